// =============================================================================
// mpkernel — Architecture Abstraction
// =============================================================================
//
// Everything the process core needs from the processor goes through this
// module: which core am I on, the interrupt flag, the active page-table root,
// the callee-saved register switch, and the final drop into user mode.
//
// Two backends export the same interface:
//
//   x86_64/   bare metal (`target_os = "none"`). Context switches are a few
//             lines of assembly, CR3 and the interrupt flag go through the
//             `x86_64` crate.
//   hosted/   everything else. Each simulated core is a token passed between
//             OS threads; a process is a thread that only runs while it holds
//             a core. This is what the test suite runs on.
//
// The rest of the kernel uses `crate::arch::*` and never names a backend.
// =============================================================================

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};

#[cfg(target_os = "none")]
pub mod x86_64;

#[cfg(target_os = "none")]
pub use self::x86_64::*;

#[cfg(not(target_os = "none"))]
pub mod hosted;

#[cfg(not(target_os = "none"))]
pub use self::hosted::*;

/// State owned by one hardware core.
///
/// Only the core itself writes these fields; the atomics exist so the
/// record can live in a shared static, not for cross-core traffic.
pub struct CpuLocal {
    /// Hardware identifier (local APIC id on bare metal).
    pub hw_id: usize,
    /// Depth of `push_off` nesting.
    pub ncli: AtomicU32,
    /// Whether interrupts were enabled before the outermost `push_off`.
    pub intena: AtomicBool,
    /// Kernel stack top loaded on the next trap from user mode.
    pub trap_stack: AtomicU64,
    /// Physical address of the active PML4.
    pub active_root: AtomicU64,
    /// Simulated interrupt flag.
    #[cfg(not(target_os = "none"))]
    pub(crate) interrupts: AtomicBool,
    /// Set when the simulated machine powers off; idle cores park.
    #[cfg(not(target_os = "none"))]
    pub(crate) halted: AtomicBool,
}

impl CpuLocal {
    pub const fn new(hw_id: usize) -> Self {
        Self {
            hw_id,
            ncli: AtomicU32::new(0),
            intena: AtomicBool::new(false),
            trap_stack: AtomicU64::new(0),
            active_root: AtomicU64::new(0),
            #[cfg(not(target_os = "none"))]
            interrupts: AtomicBool::new(false),
            #[cfg(not(target_os = "none"))]
            halted: AtomicBool::new(false),
        }
    }
}

/// Entry point of a process's first run on its kernel stack.
pub type FreshEntry = extern "C-unwind" fn(usize) -> !;
