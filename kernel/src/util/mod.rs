// =============================================================================
// mpkernel — Bare-Metal Support
// =============================================================================
//
//   panic.rs  — panic handler (log and halt the core)
// =============================================================================

pub mod panic;
