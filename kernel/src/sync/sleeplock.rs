//! Blocking lock for long critical sections.
//!
//! Waiters sleep on the lock's address instead of spinning, so the holder
//! may itself block (on a disk transfer, say) while holding it. Only
//! processes can take a sleep lock. Waiting is not cut short by a kill
//! request: the lock may guard state that must be finished consistently.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::kernel::Kernel;
use crate::task::process::{Channel, Pid};

use super::spinlock::SpinLock;

struct Holder {
    locked: bool,
    pid: Option<Pid>,
}

pub struct SleepLock<T> {
    inner: SpinLock<Holder>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: the data is only reached through a guard, and one process holds
// the guard at a time.
unsafe impl<T: Send> Send for SleepLock<T> {}
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            inner: SpinLock::new(Holder { locked: false, pid: None }),
            name,
            data: UnsafeCell::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block the calling process until the lock is free, then take it.
    pub fn lock<'a>(&'a self, kernel: &'a Kernel) -> SleepLockGuard<'a, T> {
        let mut holder = kernel.wait_until(Channel::of(self), self.inner.lock(), |h| !h.locked);
        holder.locked = true;
        holder.pid = kernel.current_pid();
        drop(holder);
        SleepLockGuard { lock: self, kernel }
    }

    /// Whether the calling process holds the lock.
    pub fn holding(&self, kernel: &Kernel) -> bool {
        let holder = self.inner.lock();
        holder.locked && holder.pid.is_some() && holder.pid == kernel.current_pid()
    }
}

/// Access to the data of a held sleep lock. Dropping it releases the lock
/// and wakes every waiter.
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
    kernel: &'a Kernel,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        let mut holder = self.lock.inner.lock();
        holder.locked = false;
        holder.pid = None;
        self.kernel.wakeup(Channel::of(self.lock));
        drop(holder);
    }
}
