//! User register state saved at kernel entry.

/// User code segment selector (GDT index 4, RPL 3).
pub const USER_CS: u64 = 0x23;

/// User stack segment selector (GDT index 3, RPL 3).
pub const USER_SS: u64 = 0x1b;

/// RFLAGS: Interrupt Flag. Set so interrupts keep arriving in ring 3.
pub const RFLAGS_IF: u64 = 1 << 9;

/// RFLAGS: reserved bit 1, always set.
const RFLAGS_RESERVED1: u64 = 1 << 1;

/// The general registers, the vector/error pair and the five words the CPU
/// pushes on a trap, in stack order (lowest address first).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub vector: u64,
    pub error: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

// The frame sits at the top of a 16-byte aligned kernel stack, and the
// stack below it must stay aligned for the first call.
const _: () = assert!(core::mem::size_of::<TrapFrame>() % 16 == 0);

impl TrapFrame {
    /// A frame that enters ring 3 at `rip` with stack pointer `rsp` and
    /// every general register zero.
    pub fn user_entry(rip: u64, rsp: u64) -> Self {
        Self {
            rip,
            cs: USER_CS,
            rflags: RFLAGS_IF | RFLAGS_RESERVED1,
            rsp,
            ss: USER_SS,
            ..Self::default()
        }
    }

    /// Whether the trap interrupted ring 3.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_entry_targets_ring_three() {
        let tf = TrapFrame::user_entry(0x1000, 0x2000);
        assert!(tf.from_user());
        assert_eq!(tf.rflags & RFLAGS_IF, RFLAGS_IF);
        assert_eq!((tf.rip, tf.rsp, tf.rax), (0x1000, 0x2000, 0));
        assert_eq!(core::mem::offset_of!(TrapFrame, rip), 17 * 8);
    }
}
