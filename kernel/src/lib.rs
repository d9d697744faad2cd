// =============================================================================
// mpkernel — Process and Memory Core
// =============================================================================
//
// Module map:
//
//   arch/      processor interface (bare metal x86_64, or hosted threads)
//   config     limits and boot-time parameters
//   error      recoverable failures
//   fs         the file layer as seen from here
//   kernel     the `Kernel` value tying it all together
//   memory/    frames, page tables, the kernel template, address spaces
//   sync/      spin lock with per-core interrupt nesting, sleep lock
//   task/      process table, scheduler, sleep/wakeup, lifecycle, traps
//   hosted/    simulated machine for running the core on a host OS
//
// The crate is `no_std` on bare-metal targets and links `std` everywhere
// else, which is where the hosted machine and the test suite live.
// =============================================================================

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod memory;
pub mod sync;
pub mod task;

#[cfg(not(target_os = "none"))]
pub mod hosted;

#[cfg(target_os = "none")]
mod util;

pub use crate::error::{KernelError, VmError};
pub use crate::kernel::Kernel;
