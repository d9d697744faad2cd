//! Context switching between threads.
//!
//! Every saved context owns a baton: a one-slot mailbox for a core. Switching
//! from A to B drops this thread's core into B's baton and then blocks on
//! A's until someone switches back to A. Since exactly one thread holds each
//! core, the kernel above sees the same one-runner-per-core discipline it
//! gets on hardware.
//!
//! An exited process stays parked until its slot is reaped. Dropping its
//! context then posts `Retire`, and the thread unwinds out of the process
//! and ends.

use std::boxed::Box;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::string::String;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::arch::{CpuLocal, FreshEntry};
use super::cpu::{bind_core, this_cpu};
use crate::memory::address::VirtAddr;

/// Host stack for a process thread. User programs run on it as well.
const PROCESS_THREAD_STACK: usize = 1 << 20;

/// What a parked context is woken with.
enum Wake {
    Core(&'static CpuLocal),
    /// The context was thrown away; its thread should end.
    Retire,
}

/// Unwind payload that ends a retired process thread.
struct Retired;

struct Baton {
    slot: Mutex<Option<Wake>>,
    arrived: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            arrived: Condvar::new(),
        }
    }

    fn post(&self, wake: Wake) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(
            !matches!(*slot, Some(Wake::Core(_))),
            "switch: context resumed twice"
        );
        *slot = Some(wake);
        self.arrived.notify_one();
    }

    fn take(&self) -> Wake {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(wake) = slot.take() {
                return wake;
            }
            slot = self.arrived.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Block until `baton` hands this thread a core, then run on it. A retired
/// context never runs again, so its thread unwinds back to `run_fresh`
/// and ends there.
fn park(baton: &Baton) {
    match baton.take() {
        Wake::Core(cpu) => bind_core(cpu),
        Wake::Retire => resume_unwind(Box::new(Retired)),
    }
}

/// Saved execution context.
#[derive(Default)]
pub struct Context {
    baton: Option<Arc<Baton>>,
}

impl Context {
    pub const fn new() -> Self {
        Self { baton: None }
    }

    /// Our own baton, created on the first switch away from this context.
    /// The clone is taken before the core is handed on: once it is, the
    /// record may be reset by another thread.
    fn park_handle(&mut self) -> Arc<Baton> {
        self.baton.get_or_insert_with(|| Arc::new(Baton::new())).clone()
    }
}

/// Dropping a saved context (reaping a zombie) ends the thread parked in it.
impl Drop for Context {
    fn drop(&mut self) {
        if let Some(baton) = self.baton.take() {
            baton.post(Wake::Retire);
        }
    }
}

/// Suspend the calling context into `from` and resume `to` on this core.
///
/// # Safety
/// `from` must be the caller's own context and `to` one that was saved by
/// an earlier `switch`. Neither may be touched by anyone else until this
/// call returns.
pub unsafe fn switch(from: *mut Context, to: *const Context) {
    let mine = unsafe { (*from).park_handle() };
    let Some(target) = (unsafe { (*to).baton.clone() }) else {
        panic!("switch: target context was never saved");
    };
    target.post(Wake::Core(this_cpu()));
    park(&mine);
}

/// Suspend into `from` and start `entry(arg)` on this core in a new
/// execution context.
///
/// # Safety
/// Same as [`switch`] for `from`. `entry` must never return.
pub unsafe fn switch_to_fresh(from: *mut Context, _stack_top: VirtAddr, entry: FreshEntry, arg: usize) {
    let mine = unsafe { (*from).park_handle() };
    let cpu = this_cpu();
    let spawned = std::thread::Builder::new()
        .name(String::from("process"))
        .stack_size(PROCESS_THREAD_STACK)
        .spawn(move || run_fresh(cpu, entry, arg));
    if let Err(err) = spawned {
        panic!("switch_to_fresh: cannot start a process thread: {}", err);
    }
    park(&mine);
}

fn run_fresh(cpu: &'static CpuLocal, entry: FreshEntry, arg: usize) {
    bind_core(cpu);
    let ran: std::thread::Result<()> = catch_unwind(AssertUnwindSafe(move || entry(arg)));
    if let Err(payload) = ran {
        if !payload.is::<Retired>() {
            resume_unwind(payload);
        }
    }
}
