//! The process table and its lock.
//!
//! One spin lock guards every cross-process invariant: slot claim and
//! release, state transitions, parent links, sleep channels and the pid
//! counter. The lock's payload is only the pid counter; the slots sit
//! beside it so that a slot can be read without the lock (see
//! [`Kernel::procdump`]).

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::NPROC;
use crate::kernel::Kernel;
use crate::sync::{SpinLock, SpinLockGuard};

use super::process::{Pid, ProcState, Slot};

/// Data behind the table lock.
pub struct TableState {
    pub(crate) next_pid: u32,
}

/// Proof that the table lock is held.
pub type TableGuard<'a> = SpinLockGuard<'a, TableState>;

pub struct ProcTable {
    pub(crate) lock: SpinLock<TableState>,
    pub(crate) slots: [Slot; NPROC],
}

impl ProcTable {
    pub fn new() -> Self {
        Self {
            lock: SpinLock::new(TableState { next_pid: 1 }),
            slots: core::array::from_fn(|_| Slot::new()),
        }
    }

    /// Claim the first unused slot as an embryo with a fresh pid.
    pub(crate) fn claim(&self, table: &mut TableGuard<'_>) -> Option<(usize, Pid)> {
        let idx = self.slots.iter().position(|s| s.state() == ProcState::Unused)?;
        let pid = Pid(table.next_pid);
        table.next_pid += 1;
        self.slots[idx].claim(table, pid);
        Some((idx, pid))
    }

    /// Slot of the live process with `pid`.
    pub(crate) fn find(&self, _table: &TableGuard<'_>, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state() != ProcState::Unused && s.pid() == pid)
    }

    pub fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One line of the process dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: Pid,
    pub state: ProcState,
    pub name: String,
}

impl Kernel {
    /// Snapshot of every non-unused slot, logged one line per process.
    ///
    /// Takes no lock, so it works even when the table looks wedged. The
    /// result may mix values from before and after a concurrent transition.
    pub fn procdump(&self) -> Vec<ProcInfo> {
        let mut out = Vec::new();
        for slot in self.procs.slots.iter() {
            let state = slot.state();
            if state == ProcState::Unused {
                continue;
            }
            let raw = slot.name();
            let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            let name = String::from_utf8_lossy(&raw[..len]).into_owned();
            klog::info!("{} {} {}", slot.pid(), state.as_str(), name);
            out.push(ProcInfo { pid: slot.pid(), state, name });
        }
        out
    }
}
