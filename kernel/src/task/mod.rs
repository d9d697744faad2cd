//! Processes: the table, scheduling, sleep/wakeup and the lifecycle calls.
//!
//! Almost everything here is an `impl Kernel` block; the kernel value owns
//! the table, the per-core records and the tick counter.

pub mod clock;
pub mod cpu;
pub mod lifecycle;
pub mod process;
pub mod scheduler;
pub mod sleep;
pub mod syscall;
pub mod table;
pub mod trap;
pub mod trapframe;

pub use self::cpu::Cpu;
pub use self::process::{Channel, EntryAction, Pid, ProcState, ProcessHandle};
pub use self::table::{ProcInfo, ProcTable};
pub use self::trap::TrapCause;
pub use self::trapframe::TrapFrame;
