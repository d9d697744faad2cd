//! Process-control system calls.
//!
//! The call number arrives in `rax`, arguments in `rdi` and `rsi`. The
//! result goes back in `rax`; every failure reads as `u64::MAX` from user
//! mode.
//!
//! | nr | call   | args              | returns             |
//! |----|--------|-------------------|---------------------|
//! | 1  | fork   |                   | child pid / 0       |
//! | 2  | exit   | status            | does not return     |
//! | 3  | wait   | status address    | child pid           |
//! | 6  | kill   | pid               | 0                   |
//! | 11 | getpid |                   | pid                 |
//! | 12 | sbrk   | delta (signed)    | previous size       |
//! | 13 | sleep  | ticks             | 0                   |
//! | 14 | uptime |                   | ticks since boot    |

use crate::error::KernelError;
use crate::kernel::Kernel;

use super::process::Pid;

pub const SYS_FORK: u64 = 1;
pub const SYS_EXIT: u64 = 2;
pub const SYS_WAIT: u64 = 3;
pub const SYS_KILL: u64 = 6;
pub const SYS_GETPID: u64 = 11;
pub const SYS_SBRK: u64 = 12;
pub const SYS_SLEEP: u64 = 13;
pub const SYS_UPTIME: u64 = 14;

/// What user mode sees on failure.
pub const SYSCALL_FAILED: u64 = u64::MAX;

impl Kernel {
    /// Run the call described by the trapframe of slot `idx` (the caller).
    pub(crate) fn syscall(&'static self, idx: usize) {
        // SAFETY: we are the running process.
        let Some(tf) = (unsafe { self.procs.slots[idx].private() }).trapframe else {
            panic!("syscall: no trapframe");
        };
        // Copy the arguments out; the call may sleep, and nothing may borrow
        // the frame meanwhile.
        // SAFETY: the trapframe belongs to the running process.
        let (num, a0, a1) = unsafe {
            let regs = tf.as_ptr().read();
            (regs.rax, regs.rdi, regs.rsi)
        };

        let ret = match self.dispatch(num, a0, a1) {
            Some(Ok(value)) => value,
            Some(Err(err)) => {
                klog::trace!("syscall {}: {}", num, err);
                SYSCALL_FAILED
            }
            None => {
                klog::warn!("pid {}: unknown syscall {}", self.procs.slots[idx].pid(), num);
                SYSCALL_FAILED
            }
        };
        // SAFETY: as above.
        unsafe { (*tf.as_ptr()).rax = ret };
    }

    fn dispatch(&'static self, num: u64, a0: u64, _a1: u64) -> Option<Result<u64, KernelError>> {
        let result = match num {
            SYS_FORK => self.duplicate().map(|pid| u64::from(pid.0)),
            SYS_EXIT => self.terminate(a0 as i32),
            SYS_WAIT => self.sys_wait(a0),
            SYS_KILL => u32::try_from(a0)
                .map_err(|_| KernelError::NoSuchProcess)
                .and_then(|pid| self.mark_for_termination(Pid(pid)))
                .map(|()| 0),
            SYS_GETPID => self
                .current_pid()
                .map(|pid| u64::from(pid.0))
                .ok_or(KernelError::NoSuchProcess),
            SYS_SBRK => {
                let old = self.current_size();
                self.grow_current(a0 as i64).map(|_| old)
            }
            SYS_SLEEP => self.sleep_ticks(a0).map(|()| 0),
            SYS_UPTIME => Ok(self.uptime()),
            _ => return None,
        };
        Some(result)
    }

    fn sys_wait(&self, status_addr: u64) -> Result<u64, KernelError> {
        let (pid, status) = self.await_child()?;
        if status_addr != 0 {
            self.copy_out_current(status_addr, &status.to_le_bytes())?;
        }
        Ok(u64::from(pid.0))
    }
}
