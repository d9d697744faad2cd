//! User mode on the hosted machine.
//!
//! A user program is a Rust closure. Registering one assigns it an entry
//! address high above any memory a process maps; a trapframe whose `rip`
//! holds that address "executes" the closure. A boot image is then just
//! the entry address, stored as eight little-endian bytes at `rip`.
//!
//! The closure talks to the kernel only the way real user code would: it
//! loads registers into its trapframe and traps. [`UserMode`] wraps that in
//! one method per system call. Loads and stores go through the process's
//! page tables, and an access to an unmapped address raises a page fault
//! that kills the process.

use std::sync::Arc;
use std::vec::Vec;

use spin::Mutex;

use crate::arch;
use crate::fs::FileRef;
use crate::kernel::Kernel;
use crate::memory::address::PAGE_SIZE;
use crate::task::process::Pid;
use crate::task::syscall::{
    SYSCALL_FAILED, SYS_EXIT, SYS_FORK, SYS_GETPID, SYS_KILL, SYS_SBRK, SYS_SLEEP, SYS_UPTIME,
    SYS_WAIT,
};
use crate::task::trap::{
    TrapCause, GENERAL_PROTECTION_VECTOR, PAGE_FAULT_VECTOR, SYSCALL_VECTOR, TIMER_VECTOR,
};
use crate::task::trapframe::TrapFrame;

/// A user program.
pub type UserProgram = Arc<dyn Fn(&mut UserMode) + Send + Sync>;

/// Entry address of the first registered program. Far above any size a
/// process reaches here, so an entry address never names mapped memory.
pub const PROGRAM_BASE: u64 = 0x7000_0000_0000;

const PROGRAM_STRIDE: u64 = 16;

/// Where `wait` has the kernel store the exit status: the top of the first
/// page, which every process started from the boot image has.
const STATUS_SCRATCH: u64 = PAGE_SIZE - 16;

static PROGRAMS: Mutex<Vec<UserProgram>> = Mutex::new(Vec::new());

/// Make `program` runnable and return its entry address.
pub fn register(program: UserProgram) -> u64 {
    let mut programs = PROGRAMS.lock();
    programs.push(program);
    PROGRAM_BASE + (programs.len() as u64 - 1) * PROGRAM_STRIDE
}

/// The boot image that starts the program at `entry`.
pub fn program_image(entry: u64) -> [u8; 8] {
    entry.to_le_bytes()
}

fn lookup(entry: u64) -> Option<UserProgram> {
    if entry < PROGRAM_BASE || (entry - PROGRAM_BASE) % PROGRAM_STRIDE != 0 {
        return None;
    }
    let idx = ((entry - PROGRAM_BASE) / PROGRAM_STRIDE) as usize;
    PROGRAMS.lock().get(idx).cloned()
}

/// Return to user mode: run the program `tf.rip` points at.
///
/// A program that returns has exited with status 0.
pub fn enter_user(kernel: &'static Kernel, tf: core::ptr::NonNull<TrapFrame>) -> ! {
    let mut user = UserMode { kernel, tf };
    // iretq restores the interrupt flag from the frame.
    arch::enable_interrupts();

    let rip = user.regs().rip;
    let entry = if rip < PROGRAM_BASE {
        let mut word = [0u8; 8];
        user.load(rip, &mut word);
        u64::from_le_bytes(word)
    } else {
        rip
    };
    let Some(program) = lookup(entry) else {
        user.fault(GENERAL_PROTECTION_VECTOR, 0);
    };
    program(&mut user);
    user.exit(0)
}

/// The user-mode side of a process: its trapframe and the kernel it traps
/// into.
pub struct UserMode {
    kernel: &'static Kernel,
    tf: core::ptr::NonNull<TrapFrame>,
}

impl UserMode {
    /// The kernel, for programs that stand in for kernel code paths (taking
    /// a sleep lock, say).
    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    fn regs(&self) -> TrapFrame {
        // SAFETY: the trapframe belongs to this process; only this thread
        // or the kernel on its behalf touches it.
        unsafe { self.tf.as_ptr().read() }
    }

    fn regs_mut(&mut self) -> &mut TrapFrame {
        // SAFETY: as above, and no kernel code runs while we hold this.
        unsafe { &mut *self.tf.as_ptr() }
    }

    fn trap(&mut self, cause: TrapCause, vector: u8) {
        self.regs_mut().vector = u64::from(vector);
        arch::disable_interrupts();
        self.kernel.user_trap(cause);
        arch::enable_interrupts();
    }

    /// Trap with arbitrary register contents; the raw `rax` comes back.
    pub fn syscall(&mut self, num: u64, a0: u64, a1: u64) -> u64 {
        let regs = self.regs_mut();
        regs.rax = num;
        regs.rdi = a0;
        regs.rsi = a1;
        self.trap(TrapCause::Syscall, SYSCALL_VECTOR);
        self.regs().rax
    }

    /// Fork. The child starts in `child`; the parent gets the child's pid.
    pub fn fork<F>(&mut self, child: F) -> Option<Pid>
    where
        F: Fn(&mut UserMode) + Send + Sync + 'static,
    {
        let entry = register(Arc::new(child));
        let rip = self.regs().rip;
        self.regs_mut().rip = entry;
        let ret = self.syscall(SYS_FORK, 0, 0);
        self.regs_mut().rip = rip;
        (ret != SYSCALL_FAILED).then(|| Pid(ret as u32))
    }

    pub fn exit(&mut self, status: i32) -> ! {
        self.syscall(SYS_EXIT, status as u32 as u64, 0);
        panic!("exit returned");
    }

    /// Wait for a child; its pid and exit status.
    pub fn wait(&mut self) -> Option<(Pid, i32)> {
        let ret = self.syscall(SYS_WAIT, STATUS_SCRATCH, 0);
        if ret == SYSCALL_FAILED {
            return None;
        }
        let mut status = [0u8; 4];
        self.load(STATUS_SCRATCH, &mut status);
        Some((Pid(ret as u32), i32::from_le_bytes(status)))
    }

    pub fn kill(&mut self, pid: Pid) -> bool {
        self.syscall(SYS_KILL, u64::from(pid.0), 0) != SYSCALL_FAILED
    }

    pub fn getpid(&mut self) -> Pid {
        Pid(self.syscall(SYS_GETPID, 0, 0) as u32)
    }

    /// Grow or shrink memory; the previous size.
    pub fn sbrk(&mut self, delta: i64) -> Option<u64> {
        let ret = self.syscall(SYS_SBRK, delta as u64, 0);
        (ret != SYSCALL_FAILED).then_some(ret)
    }

    /// Sleep for `ticks` timer ticks. False when interrupted by a kill.
    pub fn sleep(&mut self, ticks: u64) -> bool {
        self.syscall(SYS_SLEEP, ticks, 0) != SYSCALL_FAILED
    }

    pub fn uptime(&mut self) -> u64 {
        self.syscall(SYS_UPTIME, 0, 0)
    }

    /// A timer interrupt arriving while this process runs in user mode.
    pub fn timer_interrupt(&mut self) {
        self.trap(TrapCause::Timer, TIMER_VECTOR);
    }

    /// Read user memory. Unmapped addresses fault and kill the process.
    pub fn load(&mut self, va: u64, dst: &mut [u8]) {
        if self.kernel.copy_in_current(va, dst).is_err() {
            self.fault(PAGE_FAULT_VECTOR, 0b100);
        }
    }

    /// Write user memory. Unmapped addresses fault and kill the process.
    pub fn store(&mut self, va: u64, src: &[u8]) {
        if self.kernel.copy_out_current(va, src).is_err() {
            self.fault(PAGE_FAULT_VECTOR, 0b110);
        }
    }

    /// Raise processor exception `vector`.
    pub fn fault(&mut self, vector: u8, error: u64) -> ! {
        self.regs_mut().error = error;
        self.trap(TrapCause::Fault { vector, error }, vector);
        panic!("fault {} returned to user mode", vector);
    }

    /// What an init process does once its own work is done: reap children
    /// (including orphans handed to it) forever.
    pub fn reap_forever(&mut self) -> ! {
        loop {
            if self.wait().is_none() {
                self.sleep(1);
            }
        }
    }

    /// Put an open file in this process's descriptor table. Stands in for
    /// an `open` call, which lives outside the process core.
    pub fn attach(&mut self, file: FileRef) -> Option<usize> {
        self.kernel.attach_file(file).ok()
    }
}
