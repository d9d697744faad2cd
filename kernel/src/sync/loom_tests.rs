//! Loom models of the lock and wakeup protocols.
//!
//! Loom explores every interleaving of a small concurrent program, so these
//! tests model the protocols with loom's own atomics and mutexes instead of
//! running the kernel types (which depend on per-core state loom cannot
//! see).
//!
//! ```bash
//! cargo test -p mpkernel --features loom --release -- --test-threads=1 loom
//! ```

use loom::cell::UnsafeCell;
use loom::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use loom::sync::{Arc, Mutex};
use loom::thread;

/// The ticket lock without the interrupt bookkeeping.
struct TicketLock {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    value: UnsafeCell<u32>,
}

// SAFETY: `value` is only touched between acquire and release.
unsafe impl Sync for TicketLock {}

impl TicketLock {
    fn new() -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            value: UnsafeCell::new(0),
        }
    }

    fn increment(&self) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            thread::yield_now();
        }
        self.value.with_mut(|v| unsafe { *v += 1 });
        self.now_serving.fetch_add(1, Ordering::Release);
    }
}

/// Two cores incrementing under the lock never lose an update.
#[test]
fn loom_ticket_lock_excludes() {
    loom::model(|| {
        let lock = Arc::new(TicketLock::new());
        let other = lock.clone();
        let t = thread::spawn(move || other.increment());
        lock.increment();
        t.join().unwrap();
        let total = lock.value.with(|v| unsafe { *v });
        assert_eq!(total, 2);
    });
}

const SLEEPING: u8 = 1;
const RUNNABLE: u8 = 2;
const CHAN: u8 = 7;

struct Proc {
    state: AtomicU8,
    chan: AtomicU8,
}

/// A sleeper that records its channel under the table lock before giving
/// up the condition lock is always found by a waker that changed the
/// condition afterwards.
#[test]
fn loom_wakeup_is_never_lost() {
    loom::model(|| {
        let cond = Arc::new(Mutex::new(false));
        let table = Arc::new(Mutex::new(()));
        let proc = Arc::new(Proc {
            state: AtomicU8::new(RUNNABLE),
            chan: AtomicU8::new(0),
        });

        let (c, t, p) = (cond.clone(), table.clone(), proc.clone());
        let sleeper = thread::spawn(move || {
            let guard = c.lock().unwrap();
            if *guard {
                return true;
            }
            // sleep(): table lock first, then let go of the condition.
            let table = t.lock().unwrap();
            drop(guard);
            p.chan.store(CHAN, Ordering::Relaxed);
            p.state.store(SLEEPING, Ordering::Relaxed);
            drop(table);
            false
        });

        // Waker: change the condition, then wakeup(CHAN).
        *cond.lock().unwrap() = true;
        {
            let _table = table.lock().unwrap();
            if proc.state.load(Ordering::Relaxed) == SLEEPING
                && proc.chan.load(Ordering::Relaxed) == CHAN
            {
                proc.state.store(RUNNABLE, Ordering::Relaxed);
            }
        }

        let saw_condition = sleeper.join().unwrap();
        assert!(saw_condition || proc.state.load(Ordering::Relaxed) == RUNNABLE);
    });
}
