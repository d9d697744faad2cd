// =============================================================================
// mpkernel — Ticket Spinlock
// =============================================================================
//
// Mutual exclusion for short critical sections, including data that
// interrupt handlers touch.
//
// Tickets: `lock` draws the next number from `next_ticket` and spins until
// `now_serving` reaches it; release bumps `now_serving`. Cores get the lock
// in the order they asked for it.
//
// IRQ SAFETY:
//   A core holding a lock must not take an interrupt whose handler wants the
//   same lock, so interrupts are off on the holding core. The bookkeeping is
//   per core, not per guard: `push_off` nests, remembers whether interrupts
//   were on before the outermost level, and `pop_off` turns them back on
//   only when the outermost level is popped. Per-core state is what makes
//   the scheduler's lock hand-off work: a lock acquired in one stack frame
//   may be released in another (on the same core) after a context switch.
//
// OWNERSHIP CHECKS:
//   The lock records the holding core. Acquiring a lock this core already
//   holds would spin forever, so it panics instead ("acquire"); releasing a
//   lock this core does not hold panics too ("release").
//
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::arch;

/// No core holds the lock.
const NO_HOLDER: usize = usize::MAX;

/// A ticket lock that keeps interrupts off on the holding core.
pub struct SpinLock<T> {
    /// The next ticket to be dispensed.
    next_ticket: AtomicU32,
    /// The ticket currently allowed in.
    now_serving: AtomicU32,
    /// Hardware id of the holding core, for `holding` and the checks above.
    holder: AtomicUsize,
    data: UnsafeCell<T>,
}

// SAFETY: the lock hands out access to `T` to one core at a time.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            holder: AtomicUsize::new(NO_HOLDER),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts on the current core until
    /// the matching release.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        push_off();
        if self.held_here() {
            panic!("acquire: lock already held by core {}", arch::this_cpu().hw_id);
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        // Acquire pairs with the Release in `release`: we see every write the
        // previous holder made.
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }

        self.holder.store(arch::this_cpu().hw_id, Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    /// Take the lock only if nobody holds or waits for it.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        push_off();
        if self.held_here() {
            panic!("acquire: lock already held by core {}", arch::this_cpu().hw_id);
        }

        let serving = self.now_serving.load(Ordering::Relaxed);
        let taken = self
            .next_ticket
            .compare_exchange(serving, serving.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if taken {
            self.holder.store(arch::this_cpu().hw_id, Ordering::Relaxed);
            Some(SpinLockGuard { lock: self })
        } else {
            pop_off();
            None
        }
    }

    /// Whether the current core holds this lock.
    pub fn holding(&self) -> bool {
        push_off();
        let held = self.held_here();
        pop_off();
        held
    }

    /// Caller has interrupts off, so the core cannot change under us.
    fn held_here(&self) -> bool {
        self.is_locked() && self.holder.load(Ordering::Relaxed) == arch::this_cpu().hw_id
    }

    fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    fn release(&self) {
        if !self.held_here() {
            panic!("release: lock not held by core {}", arch::this_cpu().hw_id);
        }
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.now_serving.fetch_add(1, Ordering::Release);
        pop_off();
    }

    /// Release a lock whose guard lives in another stack frame.
    ///
    /// Used exactly once per process: its first run starts in a fresh
    /// frame, while the guard for the lock it inherited from the scheduler
    /// stays behind in the scheduler loop.
    ///
    /// # Safety
    /// The current core must hold the lock, and the guard that acquired it
    /// must never be dropped as if it still owned it.
    pub unsafe fn force_unlock(&self) {
        self.release();
    }

    /// Exclusive access without locking; `&mut self` proves nobody else can
    /// observe the data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock. Dropping it releases the lock and pops
/// one interrupt-off level on this core.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Release the lock and return it, so the caller can re-acquire it
    /// later (used by `sleep`).
    pub fn unlock(guard: Self) -> &'a SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

// =============================================================================
// Per-core interrupt nesting
// =============================================================================

/// Disable interrupts on this core, one nesting level deeper.
pub fn push_off() {
    let was_enabled = arch::interrupts_enabled();
    arch::disable_interrupts();
    let cpu = arch::this_cpu();
    if cpu.ncli.load(Ordering::Relaxed) == 0 {
        cpu.intena.store(was_enabled, Ordering::Relaxed);
    }
    cpu.ncli.fetch_add(1, Ordering::Relaxed);
}

/// Undo one `push_off`. Interrupts come back on when the outermost level
/// is popped and they were on before it.
pub fn pop_off() {
    if arch::interrupts_enabled() {
        panic!("pop_off: interrupts enabled");
    }
    let cpu = arch::this_cpu();
    let depth = cpu.ncli.load(Ordering::Relaxed);
    if depth == 0 {
        panic!("pop_off: not pushed");
    }
    cpu.ncli.store(depth - 1, Ordering::Relaxed);
    if depth == 1 && cpu.intena.load(Ordering::Relaxed) {
        arch::enable_interrupts();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn guards_nest_interrupt_state_per_core() {
        let a = SpinLock::new(1);
        let b = SpinLock::new(2);
        arch::enable_interrupts();
        let base = arch::this_cpu().ncli.load(Ordering::Relaxed);
        let ga = a.lock();
        assert!(!arch::interrupts_enabled());
        let gb = b.lock();
        assert_eq!(arch::this_cpu().ncli.load(Ordering::Relaxed), base + 2);
        // Release out of order: interrupts stay off until the last pop.
        drop(ga);
        assert!(!arch::interrupts_enabled());
        drop(gb);
        assert_eq!(arch::interrupts_enabled(), base == 0);
        arch::disable_interrupts();
    }

    #[test]
    fn holding_tracks_the_core() {
        let lock = Arc::new(SpinLock::new(()));
        let guard = lock.lock();
        assert!(lock.holding());
        let other = Arc::clone(&lock);
        let seen = thread::spawn(move || other.holding()).join().unwrap();
        assert!(!seen, "another core must not appear to hold the lock");
        drop(guard);
        assert!(!lock.holding());
    }

    #[test]
    #[should_panic(expected = "acquire")]
    fn relocking_on_the_same_core_is_fatal() {
        let lock = SpinLock::new(0);
        let _first = lock.lock();
        let _second = lock.lock();
    }

    #[test]
    #[should_panic(expected = "release")]
    fn releasing_an_unheld_lock_is_fatal() {
        let lock = SpinLock::new(0);
        unsafe { lock.force_unlock() };
    }

    #[test]
    fn try_lock_fails_while_held_elsewhere() {
        let lock = Arc::new(SpinLock::new(0));
        let guard = lock.lock();
        let other = Arc::clone(&lock);
        assert!(thread::spawn(move || other.try_lock().is_none()).join().unwrap());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn counter_survives_contention() {
        let lock = Arc::new(SpinLock::new(0u64));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn guard_unlock_hands_back_the_lock() {
        let lock = SpinLock::new(5);
        let guard = lock.lock();
        let same = SpinLockGuard::unlock(guard);
        assert!(!same.holding());
        assert_eq!(*same.lock(), 5);
    }
}
