// =============================================================================
// mpkernel — x86_64 Bare-Metal Backend
// =============================================================================
//
//   cpu.rs       — per-core records, interrupt flag, CR3, idle
//   context.rs   — callee-saved register switch
//   usermode.rs  — trap entry stubs and the iretq return path
//
// Boot (GDT, TSS, IDT loading, APIC bring-up) is not part of this crate. It
// calls `install_trap_vectors` on its IDT and `register_trap_handler` once,
// passing its interrupt acknowledge and TSS RSP0 loader.
// =============================================================================

mod context;
mod cpu;
mod usermode;

pub use self::context::{switch, switch_to_fresh, Context};
pub use self::cpu::{
    activate_address_space, apic_id, disable_interrupts, enable_interrupts, flush_tlb,
    halt_forever, idle, interrupts_enabled, set_trap_stack, this_cpu,
};
pub use self::usermode::{enter_user, install_trap_vectors, register_trap_handler};
