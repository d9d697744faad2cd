//! A simulated machine for running the process core on a host OS.
//!
//! - `phys`    — one big zeroed allocation standing in for physical RAM
//! - `memfs`   — an in-memory file layer with observable reference counts
//! - `user`    — user programs as Rust closures, and the calls they make
//! - `machine` — boot a kernel on N simulated cores

pub mod machine;
pub mod memfs;
pub mod phys;
pub mod user;

pub use self::machine::{Machine, MachineConfig};
pub use self::memfs::MemFs;
pub use self::user::UserMode;
