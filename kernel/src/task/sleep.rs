// =============================================================================
// mpkernel — Sleep and Wakeup
// =============================================================================
//
// A process blocks on a `Channel` while holding the lock (the guard lock)
// that protects the condition it waits for. The order of operations is what
// keeps wakeups from getting lost:
//
//   1. take the table lock (guard lock still held)
//   2. release the guard lock
//   3. record the channel, become Sleeping, switch away
//
// Any waker must change the condition under the guard lock and then call
// `wakeup`, which needs the table lock. Between steps 1 and 3 the table lock
// is held, so a waker that got the guard lock after step 2 still cannot scan
// the table until this process is recorded as Sleeping on the channel.
//
// Lock order: the guard lock is always taken before the table lock.
//
// Waking only makes a process Runnable. The condition may be false again by
// the time it runs, or it may have been woken for someone else's condition
// on a shared channel, so every wait re-checks in a loop. `wait_until` and
// `wait_until_killable` wrap that loop.
//
// =============================================================================

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::sync::SpinLockGuard;

use super::process::{Channel, ProcState};
use super::table::TableGuard;

impl Kernel {
    /// Block the calling process on `chan`, releasing `guard` while asleep
    /// and re-acquiring it before returning.
    pub fn sleep<'a, T>(&self, chan: Channel, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let table = self.procs.lock.lock();
        let lock = SpinLockGuard::unlock(guard);
        let table = self.sleep_locked(chan, table);
        drop(table);
        lock.lock()
    }

    /// `sleep` for callers whose guard lock is the table lock itself.
    pub(crate) fn sleep_locked<'t>(&self, chan: Channel, table: TableGuard<'t>) -> TableGuard<'t> {
        let idx = self.this_proc();
        let slot = &self.procs.slots[idx];
        slot.set_chan(&table, Some(chan));
        slot.set_state(&table, ProcState::Sleeping);

        self.sched(&table, idx);

        slot.set_chan(&table, None);
        table
    }

    /// Make every process sleeping on `chan` runnable.
    pub fn wakeup(&self, chan: Channel) {
        let table = self.procs.lock.lock();
        self.wakeup_locked(&table, chan);
    }

    pub(crate) fn wakeup_locked(&self, table: &TableGuard<'_>, chan: Channel) {
        for slot in self.procs.slots.iter() {
            if slot.state() == ProcState::Sleeping && slot.chan() == Some(chan) {
                slot.set_state(table, ProcState::Runnable);
            }
        }
    }

    /// Block on `chan` until `ready` holds for the guarded data.
    ///
    /// Not interrupted by a termination request.
    pub fn wait_until<'a, T, F>(&self, chan: Channel, mut guard: SpinLockGuard<'a, T>, mut ready: F) -> SpinLockGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while !ready(&mut guard) {
            guard = self.sleep(chan, guard);
        }
        guard
    }

    /// Like [`wait_until`](Self::wait_until), but gives up with
    /// [`KernelError::Killed`] once the calling process has been marked
    /// for termination.
    pub fn wait_until_killable<'a, T, F>(
        &self,
        chan: Channel,
        mut guard: SpinLockGuard<'a, T>,
        mut ready: F,
    ) -> Result<SpinLockGuard<'a, T>, KernelError>
    where
        F: FnMut(&mut T) -> bool,
    {
        loop {
            if ready(&mut guard) {
                return Ok(guard);
            }
            if self.current_killed() {
                return Err(KernelError::Killed);
            }
            guard = self.sleep(chan, guard);
        }
    }

    /// Whether the calling process has a pending termination request.
    pub fn current_killed(&self) -> bool {
        self.procs.slots[self.this_proc()].killed()
    }
}
