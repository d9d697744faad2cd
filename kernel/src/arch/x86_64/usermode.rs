// =============================================================================
// mpkernel — Trap Entry and Return (x86_64)
// =============================================================================
//
// Every trap from ring 3 lands on the process's kernel stack: the scheduler
// loads the top of that stack into the TSS RSP0 slot before it switches to
// the process. The CPU pushes ss/rsp/rflags/cs/rip, a per-vector
// stub pushes the error code (or 0) and the vector number, and the common
// path pushes the general registers. The result is exactly a `TrapFrame`
// sitting at the top of the kernel stack, which is where `ProcPrivate`
// expects to find it.
//
//   ┌──────────────┐ ← kernel stack top
//   │ ss .. rip    │   pushed by the CPU
//   │ error, vector│   pushed by the stub
//   │ r15 .. rax   │   pushed by mp_trap_common
//   └──────────────┘ ← &TrapFrame, rsp when mp_trap_dispatch is called
//
// Leaving is the mirror image: pop the registers, drop vector and error, and
// `iretq` (adapted from the ring-3 jump the boot path used to do by hand).
//
// =============================================================================

use core::ptr::NonNull;

use ::x86_64::structures::idt::InterruptDescriptorTable;
use ::x86_64::{PrivilegeLevel, VirtAddr as HwVirtAddr};

use crate::kernel::Kernel;
use crate::task::trap::{TrapCause, SYSCALL_VECTOR, TIMER_VECTOR};
use crate::task::trapframe::TrapFrame;

core::arch::global_asm!(
    ".global mp_vector_13",
    "mp_vector_13:",
    "push 13",
    "jmp mp_trap_common",
    ".global mp_vector_14",
    "mp_vector_14:",
    "push 14",
    "jmp mp_trap_common",
    ".global mp_vector_32",
    "mp_vector_32:",
    "push 0",
    "push 32",
    "jmp mp_trap_common",
    ".global mp_vector_128",
    "mp_vector_128:",
    "push 0",
    "push 128",
    "jmp mp_trap_common",
    "",
    "mp_trap_common:",
    "push r15",
    "push r14",
    "push r13",
    "push r12",
    "push r11",
    "push r10",
    "push r9",
    "push r8",
    "push rbp",
    "push rdi",
    "push rsi",
    "push rdx",
    "push rcx",
    "push rbx",
    "push rax",
    "mov rdi, rsp",
    "call mp_trap_dispatch",
    "cli",
    "",
    ".global mp_trap_return",
    "mp_trap_return:",
    "pop rax",
    "pop rbx",
    "pop rcx",
    "pop rdx",
    "pop rsi",
    "pop rdi",
    "pop rbp",
    "pop r8",
    "pop r9",
    "pop r10",
    "pop r11",
    "pop r12",
    "pop r13",
    "pop r14",
    "pop r15",
    "add rsp, 16",
    "iretq",
    "",
    ".global mp_enter_user",
    "mp_enter_user:",
    // rdi = *const TrapFrame
    "mov rsp, rdi",
    "jmp mp_trap_return",
);

unsafe extern "C" {
    fn mp_vector_13();
    fn mp_vector_14();
    fn mp_vector_32();
    fn mp_vector_128();
    fn mp_enter_user(tf: *const TrapFrame) -> !;
}

struct TrapHooks {
    kernel: &'static Kernel,
    /// Acknowledges a device or timer interrupt at the interrupt controller.
    eoi: fn(),
    /// Loads the current core's TSS RSP0.
    load_rsp0: fn(u64),
}

static HOOKS: spin::Once<TrapHooks> = spin::Once::new();

/// Point the process-core vectors of `idt` at our entry stubs.
pub fn install_trap_vectors(idt: &mut InterruptDescriptorTable) {
    let addr = |stub: unsafe extern "C" fn()| HwVirtAddr::new(stub as usize as u64);
    // SAFETY: the stubs follow the interrupt calling convention and end in
    // iretq.
    unsafe {
        idt.general_protection_fault.set_handler_addr(addr(mp_vector_13));
        idt.page_fault.set_handler_addr(addr(mp_vector_14));
        idt[TIMER_VECTOR].set_handler_addr(addr(mp_vector_32));
        idt[SYSCALL_VECTOR]
            .set_handler_addr(addr(mp_vector_128))
            .set_privilege_level(PrivilegeLevel::Ring3);
    }
}

/// Route traps to `kernel`. Called once by the boot core.
pub fn register_trap_handler(kernel: &'static Kernel, eoi: fn(), load_rsp0: fn(u64)) {
    HOOKS.call_once(|| TrapHooks { kernel, eoi, load_rsp0 });
}

pub(super) fn load_rsp0(top: u64) {
    if let Some(hooks) = HOOKS.get() {
        (hooks.load_rsp0)(top);
    }
}

#[unsafe(no_mangle)]
extern "C" fn mp_trap_dispatch(tf: *mut TrapFrame) {
    let Some(hooks) = HOOKS.get() else {
        panic!("trap before register_trap_handler");
    };
    // SAFETY: the entry stub built the frame on this stack.
    let (vector, error, from_user) = unsafe { ((*tf).vector, (*tf).error, (*tf).from_user()) };
    let cause = TrapCause::from_vector(vector as u8, error);
    if matches!(cause, TrapCause::Timer | TrapCause::Device) {
        (hooks.eoi)();
    }
    if from_user {
        hooks.kernel.user_trap(cause);
    } else {
        hooks.kernel.kernel_trap(cause);
    }
}

/// Restore `tf` and return to ring 3.
pub fn enter_user(_kernel: &'static Kernel, tf: NonNull<TrapFrame>) -> ! {
    ::x86_64::instructions::interrupts::disable();
    // SAFETY: `tf` is the frame at the top of the current process's kernel
    // stack; nothing below it is live any more.
    unsafe { mp_enter_user(tf.as_ptr()) }
}
