// =============================================================================
// mpkernel — Process Control Blocks
// =============================================================================
//
// A process lives in one slot of the fixed process table. A slot has two
// halves with different ownership rules:
//
// SHARED FIELDS (atomics):
//   state, pid, parent, sleep channel, killed flag, exit status and name.
//   They are written only while the table lock is held (the setters demand a
//   `TableGuard` as proof) and may be read at any time. Reading without the
//   lock gives a possibly stale but never torn value, which is what the
//   process dump and the kill checkpoints rely on.
//
// PRIVATE FIELDS (`ProcPrivate`):
//   kernel stack, trapframe, saved context, address space, size, open files
//   and working directory. Exactly one party may touch them at a time:
//     - the creator, while the slot is `Embryo`
//     - the process itself, while it runs
//     - the scheduler, reading the context under the table lock while the
//       process is `Runnable`
//     - the reaper, once the slot is `Zombie` and found under the lock
//
// Cross-process references (parent links) are slot indices, never pointers.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::fmt;
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use crate::arch::Context;
use crate::config::{NOFILE, PROC_NAME_LEN};
use crate::fs::{DirRef, FileRef};
use crate::memory::address::PhysFrame;
use crate::memory::space::AddressSpace;

use super::table::TableGuard;
use super::trapframe::TrapFrame;

/// Process identifier. Pids are handed out in increasing order and never
/// reused while the process that carries one is still in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a slot.
///
/// ```text
/// Unused -> Embryo -> Runnable <-> Running -> Zombie -> (reaped) -> Unused
///                        ^            |
///                        |            v
///                      Sleeping <-----+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcState {
    Unused = 0,
    Embryo = 1,
    Sleeping = 2,
    Runnable = 3,
    Running = 4,
    Zombie = 5,
}

impl ProcState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ProcState::Unused,
            1 => ProcState::Embryo,
            2 => ProcState::Sleeping,
            3 => ProcState::Runnable,
            4 => ProcState::Running,
            5 => ProcState::Zombie,
            _ => panic!("corrupt process state {}", raw),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep",
            ProcState::Runnable => "runble",
            ProcState::Running => "run",
            ProcState::Zombie => "zombie",
        }
    }
}

/// What a blocked process is waiting for.
///
/// Compared for identity only, never dereferenced. Any stable address works;
/// by convention it is the address of the data the condition is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel(NonZeroUsize);

impl Channel {
    /// The channel named by the address of `value`.
    pub fn of<T: ?Sized>(value: &T) -> Self {
        let addr = value as *const T as *const () as usize;
        // References are never null.
        Self(NonZeroUsize::new(addr).unwrap_or(NonZeroUsize::MIN))
    }

    /// A channel from an arbitrary non-zero token.
    pub const fn token(value: NonZeroUsize) -> Self {
        Self(value)
    }

    pub fn raw(self) -> usize {
        self.0.get()
    }

    fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }
}

/// A reference to a process: its slot plus the pid it had when the handle
/// was made, so a reused slot is never mistaken for the old process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub slot: usize,
    pub pid: Pid,
}

/// How the next switch into a process begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    /// First run: start the fork-return trampoline on the kernel stack,
    /// which drops the inherited table lock and returns to user mode.
    ForkReturn,
    /// Resume the context saved by the last switch away.
    Resume,
}

/// Fields owned by whoever currently owns the process (see module docs).
pub struct ProcPrivate {
    pub kstack: Option<PhysFrame>,
    /// Top of `kstack`; the trap entry writes user registers here.
    pub trapframe: Option<NonNull<TrapFrame>>,
    pub context: Context,
    pub entry: EntryAction,
    pub space: Option<AddressSpace>,
    /// Bytes of user memory, contiguous from address zero.
    pub size: u64,
    pub ofile: [Option<FileRef>; NOFILE],
    pub cwd: Option<DirRef>,
}

impl ProcPrivate {
    pub(crate) fn new() -> Self {
        Self {
            kstack: None,
            trapframe: None,
            context: Context::new(),
            entry: EntryAction::ForkReturn,
            space: None,
            size: 0,
            ofile: [None; NOFILE],
            cwd: None,
        }
    }
}

const NO_PARENT: usize = usize::MAX;

/// One entry of the process table.
pub struct Slot {
    state: AtomicU8,
    pid: AtomicU32,
    parent: AtomicUsize,
    chan: AtomicUsize,
    killed: AtomicBool,
    xstate: AtomicI32,
    name: [AtomicU8; PROC_NAME_LEN],
    private: UnsafeCell<ProcPrivate>,
}

// SAFETY: the shared fields are atomics; access to `private` follows the
// ownership protocol in the module docs.
unsafe impl Sync for Slot {}
unsafe impl Send for Slot {}

impl Slot {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ProcState::Unused as u8),
            pid: AtomicU32::new(0),
            parent: AtomicUsize::new(NO_PARENT),
            chan: AtomicUsize::new(0),
            killed: AtomicBool::new(false),
            xstate: AtomicI32::new(0),
            name: [const { AtomicU8::new(0) }; PROC_NAME_LEN],
            private: UnsafeCell::new(ProcPrivate::new()),
        }
    }

    pub fn state(&self) -> ProcState {
        ProcState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn pid(&self) -> Pid {
        Pid(self.pid.load(Ordering::Relaxed))
    }

    /// Slot index of the parent.
    pub fn parent(&self) -> Option<usize> {
        match self.parent.load(Ordering::Relaxed) {
            NO_PARENT => None,
            idx => Some(idx),
        }
    }

    pub fn chan(&self) -> Option<Channel> {
        Channel::from_raw(self.chan.load(Ordering::Relaxed))
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn xstate(&self) -> i32 {
        self.xstate.load(Ordering::Relaxed)
    }

    pub fn set_state(&self, _table: &TableGuard<'_>, state: ProcState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_parent(&self, _table: &TableGuard<'_>, parent: Option<usize>) {
        self.parent.store(parent.unwrap_or(NO_PARENT), Ordering::Relaxed);
    }

    pub fn set_chan(&self, _table: &TableGuard<'_>, chan: Option<Channel>) {
        self.chan.store(chan.map_or(0, Channel::raw), Ordering::Relaxed);
    }

    pub fn set_xstate(&self, _table: &TableGuard<'_>, status: i32) {
        self.xstate.store(status, Ordering::Relaxed);
    }

    /// Request termination. Also set from the fault path, which runs on
    /// behalf of the process itself and needs no lock.
    pub fn mark_killed(&self) {
        self.killed.store(true, Ordering::Release);
    }

    /// Reset the shared half for a freshly claimed slot.
    pub(crate) fn claim(&self, table: &TableGuard<'_>, pid: Pid) {
        self.pid.store(pid.0, Ordering::Relaxed);
        self.set_parent(table, None);
        self.set_chan(table, None);
        self.killed.store(false, Ordering::Relaxed);
        self.set_xstate(table, 0);
        self.set_name("");
        self.set_state(table, ProcState::Embryo);
    }

    /// Return the slot to the free pool. The private half must already be
    /// empty.
    pub(crate) fn release(&self, table: &TableGuard<'_>) {
        self.pid.store(0, Ordering::Relaxed);
        self.set_parent(table, None);
        self.set_chan(table, None);
        self.killed.store(false, Ordering::Relaxed);
        self.set_xstate(table, 0);
        self.set_name("");
        self.set_state(table, ProcState::Unused);
    }

    /// The debug name, truncated to the slot width.
    pub fn set_name(&self, name: &str) {
        let bytes = name.as_bytes();
        for (i, cell) in self.name.iter().enumerate() {
            cell.store(bytes.get(i).copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn copy_name_from(&self, other: &Slot) {
        for (dst, src) in self.name.iter().zip(other.name.iter()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    pub fn name(&self) -> [u8; PROC_NAME_LEN] {
        let mut out = [0u8; PROC_NAME_LEN];
        for (dst, src) in out.iter_mut().zip(self.name.iter()) {
            *dst = src.load(Ordering::Relaxed);
        }
        out
    }

    /// Raw pointer to the private half.
    pub(crate) fn private_ptr(&self) -> *mut ProcPrivate {
        self.private.get()
    }

    /// The private half.
    ///
    /// # Safety
    /// The caller must be the slot's current owner as described in the
    /// module docs, and must not let the reference live across a context
    /// switch that hands ownership to someone else.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn private(&self) -> &mut ProcPrivate {
        unsafe { &mut *self.private.get() }
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_compare_by_address() {
        let a = 1u32;
        let b = 1u32;
        assert_eq!(Channel::of(&a), Channel::of(&a));
        assert_ne!(Channel::of(&a), Channel::of(&b));
        let t = Channel::token(NonZeroUsize::new(7).unwrap());
        assert_eq!(Channel::from_raw(t.raw()), Some(t));
        assert_eq!(Channel::from_raw(0), None);
    }

    #[test]
    fn names_truncate_and_copy() {
        let a = Slot::new();
        let b = Slot::new();
        a.set_name("a-very-long-process-name");
        assert_eq!(&a.name(), b"a-very-long-proc");
        b.copy_name_from(&a);
        assert_eq!(b.name(), a.name());
        a.set_name("sh");
        assert_eq!(&a.name()[..3], b"sh\0");
    }

    #[test]
    fn state_round_trips_through_the_atomic() {
        for state in [
            ProcState::Unused,
            ProcState::Embryo,
            ProcState::Sleeping,
            ProcState::Runnable,
            ProcState::Running,
            ProcState::Zombie,
        ] {
            assert_eq!(ProcState::from_raw(state as u8), state);
        }
    }
}
