// =============================================================================
// mpkernel — Kernel Synchronization Primitives
// =============================================================================
//
//   spinlock   — ticket lock with per-core interrupt nesting
//   sleeplock  — lock whose waiters block instead of spinning
//
// Lock ordering (outermost first). Taking a lock from higher up this list
// while holding one from lower down is a deadlock waiting to happen.
//
//   1. sleep locks (held across blocking waits)
//   2. any lock passed to `Kernel::sleep` as the guard (tick counter, a
//      sleep lock's inner spin lock, ...)
//   3. the process table lock
//   4. the frame allocator's free list
//
// `Kernel::sleep` relies on 2 before 3: it takes the table lock while the
// guard is still held and only then lets the guard go.
// =============================================================================

pub mod sleeplock;
pub mod spinlock;

#[cfg(all(test, feature = "loom"))]
mod loom_tests;

pub use self::sleeplock::{SleepLock, SleepLockGuard};
pub use self::spinlock::{pop_off, push_off, SpinLock, SpinLockGuard};
