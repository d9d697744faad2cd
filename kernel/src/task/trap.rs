//! Trap handling for the process core.
//!
//! The architecture entry code saves the user registers into the current
//! process's trapframe, classifies the vector and calls
//! [`Kernel::user_trap`] or [`Kernel::kernel_trap`]. This is also where
//! termination requests take effect: a killed process exits at the next
//! trap instead of returning to user mode.

use crate::arch;
use crate::kernel::Kernel;

use super::process::ProcState;

/// Vector of the periodic timer interrupt.
pub const TIMER_VECTOR: u8 = 32;

/// Software interrupt used for system calls.
pub const SYSCALL_VECTOR: u8 = 0x80;

pub const PAGE_FAULT_VECTOR: u8 = 14;

pub const GENERAL_PROTECTION_VECTOR: u8 = 13;

/// Why the kernel was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    Syscall,
    Timer,
    /// Any other device interrupt. Acknowledged by the entry code.
    Device,
    /// A processor exception.
    Fault { vector: u8, error: u64 },
}

impl TrapCause {
    pub fn from_vector(vector: u8, error: u64) -> Self {
        match vector {
            TIMER_VECTOR => TrapCause::Timer,
            SYSCALL_VECTOR => TrapCause::Syscall,
            v if v < 32 => TrapCause::Fault { vector: v, error },
            _ => TrapCause::Device,
        }
    }
}

impl Kernel {
    /// Handle a trap taken from user mode. Returns when the process should
    /// go back to user mode; never returns for a process that exits.
    pub fn user_trap(&'static self, cause: TrapCause) {
        let idx = match self.current_slot() {
            Some(idx) => idx,
            None => panic!("user_trap: {:?} with no current process", cause),
        };
        let slot = &self.procs.slots[idx];

        match cause {
            TrapCause::Syscall => {
                if slot.killed() {
                    self.terminate(-1);
                }
                arch::enable_interrupts();
                self.syscall(idx);
            }
            TrapCause::Timer => {
                if self.on_boot_core() {
                    self.tick();
                }
            }
            TrapCause::Device => {}
            TrapCause::Fault { vector, error } => {
                klog::warn!(
                    "pid {}: trap {} err {:#x} from user mode, killed",
                    slot.pid(),
                    vector,
                    error
                );
                slot.mark_killed();
            }
        }

        if slot.killed() {
            self.terminate(-1);
        }
        if cause == TrapCause::Timer && slot.state() == ProcState::Running {
            self.yield_current();
        }
        if slot.killed() {
            self.terminate(-1);
        }
    }

    /// Handle a trap taken while the kernel itself was running.
    pub fn kernel_trap(&'static self, cause: TrapCause) {
        match cause {
            TrapCause::Fault { vector, error } => {
                klog::error!("kernel trap {} err {:#x}", vector, error);
                panic!("kernel trap {}", vector);
            }
            TrapCause::Syscall => panic!("system call from kernel mode"),
            TrapCause::Timer => {
                if self.on_boot_core() {
                    self.tick();
                }
                if let Some(idx) = self.current_slot() {
                    if self.procs.slots[idx].state() == ProcState::Running {
                        self.yield_current();
                    }
                }
            }
            TrapCause::Device => {}
        }
    }

    fn on_boot_core(&self) -> bool {
        self.cpus.first().map(|cpu| cpu.hw_id) == Some(arch::this_cpu().hw_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_classify() {
        assert_eq!(TrapCause::from_vector(32, 0), TrapCause::Timer);
        assert_eq!(TrapCause::from_vector(0x80, 0), TrapCause::Syscall);
        assert_eq!(
            TrapCause::from_vector(PAGE_FAULT_VECTOR, 6),
            TrapCause::Fault { vector: 14, error: 6 }
        );
        assert_eq!(TrapCause::from_vector(40, 0), TrapCause::Device);
    }
}
