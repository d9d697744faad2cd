//! Kernel tick counter.
//!
//! Incremented by the timer interrupt on the boot core. Timed waits block on
//! the counter's own address and re-check the count every tick.

use crate::error::KernelError;
use crate::kernel::Kernel;

use super::process::Channel;

impl Kernel {
    /// Called by the timer interrupt on every tick.
    pub fn tick(&self) {
        let mut ticks = self.ticks.lock();
        *ticks += 1;
        self.wakeup(Channel::of(&self.ticks));
        drop(ticks);
    }

    /// Return the current tick count.
    pub fn uptime(&self) -> u64 {
        *self.ticks.lock()
    }

    /// Block the calling process until the counter reaches `deadline`.
    pub fn block_until_tick(&self, deadline: u64) -> Result<(), KernelError> {
        let ticks = self.ticks.lock();
        self.wait_until_killable(Channel::of(&self.ticks), ticks, |now| *now >= deadline)
            .map(drop)
    }

    /// Block the calling process for `n` ticks.
    pub fn sleep_ticks(&self, n: u64) -> Result<(), KernelError> {
        self.block_until_tick(self.uptime().saturating_add(n))
    }
}
