//! Simulated per-core state and the interrupt flag.

use std::boxed::Box;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::arch::CpuLocal;
use crate::memory::address::{PhysFrame, VirtAddr};

std::thread_local! {
    static BOUND: Cell<Option<&'static CpuLocal>> = const { Cell::new(None) };
}

static NEXT_HW_ID: AtomicUsize = AtomicUsize::new(0);

/// A fresh simulated core with a process-wide unique hardware id.
pub fn new_core() -> &'static CpuLocal {
    let hw_id = NEXT_HW_ID.fetch_add(1, Ordering::Relaxed);
    Box::leak(Box::new(CpuLocal::new(hw_id)))
}

/// Make the calling thread the one running on `cpu`.
pub fn bind_core(cpu: &'static CpuLocal) {
    BOUND.with(|bound| bound.set(Some(cpu)));
}

/// The core the calling thread runs on.
///
/// Threads that were never bound (test threads, the tick source) get a
/// private core of their own on first use, so locks work from anywhere.
pub fn this_cpu() -> &'static CpuLocal {
    BOUND.with(|bound| match bound.get() {
        Some(cpu) => cpu,
        None => {
            let cpu = new_core();
            bound.set(Some(cpu));
            cpu
        }
    })
}

pub fn interrupts_enabled() -> bool {
    this_cpu().interrupts.load(Ordering::Relaxed)
}

pub fn enable_interrupts() {
    this_cpu().interrupts.store(true, Ordering::Relaxed);
}

pub fn disable_interrupts() {
    this_cpu().interrupts.store(false, Ordering::Relaxed);
}

pub fn activate_address_space(root: PhysFrame) {
    this_cpu().active_root.store(root.start().as_u64(), Ordering::Relaxed);
}

pub fn set_trap_stack(top: VirtAddr) {
    this_cpu().trap_stack.store(top.as_u64(), Ordering::Relaxed);
}

pub fn flush_tlb() {}

/// Nothing runnable: back off briefly so process threads get host CPU time.
/// Once the machine is halted the core stays parked.
pub fn idle() {
    if this_cpu().halted.load(Ordering::Acquire) {
        halt_forever();
    }
    std::thread::sleep(Duration::from_micros(200));
}

/// Stop `cpu` the next time it goes idle.
pub fn halt_core(cpu: &CpuLocal) {
    cpu.halted.store(true, Ordering::Release);
}

pub fn halt_forever() -> ! {
    loop {
        std::thread::park();
    }
}
