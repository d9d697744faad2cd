//! Per-core scheduler state.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::{self, Context};
use crate::kernel::Kernel;
use crate::sync::{pop_off, push_off};

use super::process::ProcessHandle;

const NO_PROC: usize = usize::MAX;

/// What the kernel keeps for each core that runs a scheduler loop.
pub struct Cpu {
    pub hw_id: usize,
    /// Where a process switches to when it gives the core back.
    pub(crate) scheduler: UnsafeCell<Context>,
    /// Slot index of the process this core is running. Only this core
    /// writes it.
    current: AtomicUsize,
}

// SAFETY: `scheduler` is only touched by the core that owns it.
unsafe impl Sync for Cpu {}

impl Cpu {
    pub fn new(hw_id: usize) -> Self {
        Self {
            hw_id,
            scheduler: UnsafeCell::new(Context::new()),
            current: AtomicUsize::new(NO_PROC),
        }
    }

    pub fn current_slot(&self) -> Option<usize> {
        match self.current.load(Ordering::Relaxed) {
            NO_PROC => None,
            idx => Some(idx),
        }
    }

    pub(crate) fn set_current(&self, slot: Option<usize>) {
        self.current.store(slot.unwrap_or(NO_PROC), Ordering::Relaxed);
    }
}

impl Kernel {
    /// The record for the calling core, if it is one of ours.
    ///
    /// Interrupts must be off: otherwise the caller could be rescheduled
    /// onto another core between the lookup and the use.
    pub fn try_mycpu(&self) -> Option<&Cpu> {
        if arch::interrupts_enabled() {
            panic!("mycpu called with interrupts enabled");
        }
        let hw_id = arch::this_cpu().hw_id;
        self.cpus.iter().find(|cpu| cpu.hw_id == hw_id)
    }

    pub fn mycpu(&self) -> &Cpu {
        match self.try_mycpu() {
            Some(cpu) => cpu,
            None => panic!("mycpu: core {} unknown", arch::this_cpu().hw_id),
        }
    }

    /// Slot index of the process running on this core.
    pub(crate) fn current_slot(&self) -> Option<usize> {
        push_off();
        let slot = self.try_mycpu().and_then(Cpu::current_slot);
        pop_off();
        slot
    }

    /// The process running on this core, if any.
    pub fn current(&self) -> Option<ProcessHandle> {
        let slot = self.current_slot()?;
        Some(ProcessHandle {
            slot,
            pid: self.procs.slots[slot].pid(),
        })
    }

    /// Slot of the calling process. Process-context operations call this;
    /// reaching one without a process is a kernel bug.
    pub(crate) fn this_proc(&self) -> usize {
        match self.current_slot() {
            Some(slot) => slot,
            None => panic!("no current process"),
        }
    }
}
