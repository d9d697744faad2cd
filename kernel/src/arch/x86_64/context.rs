// =============================================================================
// mpkernel — Context Switch (x86_64)
// =============================================================================
//
// A saved context is just a stack pointer. Everything else the System V ABI
// asks a callee to preserve (rbp, rbx, r12-r15) is pushed onto the stack
// being left, and the return address is already there from the `call`.
//
//   switch(from, to):
//     push callee-saved registers        ← on the old stack
//     [from] = rsp
//     rsp = [to]
//     pop callee-saved registers         ← from the new stack
//     ret                                ← wherever `to` last called switch
//
// A brand new process has no stack to pop from yet. Instead of faking one,
// `switch_to_fresh` saves the old side the same way and then calls the entry
// function on the new stack with one argument. The entry never returns.
//
// =============================================================================

use crate::arch::FreshEntry;
use crate::memory::address::VirtAddr;

/// Saved kernel stack pointer of a suspended context.
#[derive(Debug, Default)]
#[repr(C)]
pub struct Context {
    rsp: u64,
}

impl Context {
    pub const fn new() -> Self {
        Self { rsp: 0 }
    }
}

core::arch::global_asm!(
    ".global mp_switch",
    "mp_switch:",
    // rdi = *mut Context (from), rsi = *const Context (to)
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    ".global mp_switch_fresh",
    "mp_switch_fresh:",
    // rdi = *mut Context (from), rsi = new stack top, rdx = entry, rcx = arg
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "xor ebp, ebp",
    "mov rdi, rcx",
    "call rdx",
    "ud2",
);

unsafe extern "C" {
    fn mp_switch(from: *mut Context, to: *const Context);
    fn mp_switch_fresh(from: *mut Context, stack_top: u64, entry: FreshEntry, arg: usize);
}

/// Suspend into `from`, resume `to`.
///
/// # Safety
/// `to` must hold a context saved by `switch` or `switch_to_fresh` whose
/// stack is still allocated.
#[inline]
pub unsafe fn switch(from: *mut Context, to: *const Context) {
    unsafe { mp_switch(from, to) }
}

/// Suspend into `from` and run `entry(arg)` on the stack ending at
/// `stack_top` (16-byte aligned).
///
/// # Safety
/// The stack must be unused and stay allocated until the new context is
/// reclaimed. `entry` must never return.
#[inline]
pub unsafe fn switch_to_fresh(from: *mut Context, stack_top: VirtAddr, entry: FreshEntry, arg: usize) {
    debug_assert!(stack_top.as_u64() % 16 == 0, "switch_to_fresh: misaligned stack");
    unsafe { mp_switch_fresh(from, stack_top.as_u64(), entry, arg) }
}
