//! Hosted backend: cores and contexts simulated with OS threads.
//!
//! A simulated core is a [`CpuLocal`](super::CpuLocal) record. At any moment
//! exactly one thread is bound to it; that thread is the code "running on"
//! the core. A context switch hands the record to another thread and parks
//! the caller until some later switch hands a core back. Page tables are
//! built exactly as on hardware, but nothing walks them except the kernel's
//! own copy routines, so "activating" a tree only records its root.

mod context;
mod cpu;

pub use self::context::{switch, switch_to_fresh, Context};
pub use self::cpu::{
    activate_address_space, bind_core, disable_interrupts, enable_interrupts, flush_tlb,
    halt_core, halt_forever, idle, interrupts_enabled, new_core, set_trap_stack, this_cpu,
};
pub use crate::hosted::user::enter_user;
