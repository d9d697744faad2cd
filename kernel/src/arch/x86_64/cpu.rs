// =============================================================================
// mpkernel — CPU Utilities (x86_64)
// =============================================================================
//
// Per-core records, the interrupt flag, CR3 and the idle instruction. These
// are thin wrappers; policy lives in the scheduler and the lock primitives.
//
// CORE IDENTITY:
//   A core finds its own record by local APIC id (CPUID leaf 1, EBX[31:24]).
//   The id is stable for the life of the machine, so the lookup needs no
//   lock and works with interrupts in any state.
//
// =============================================================================

use core::sync::atomic::Ordering;

use ::x86_64::instructions::{interrupts, tlb};
use ::x86_64::registers::control::{Cr3, Cr3Flags};
use ::x86_64::structures::paging::PhysFrame as HwFrame;
use ::x86_64::PhysAddr as HwPhysAddr;

use crate::arch::CpuLocal;
use crate::memory::address::{PhysFrame, VirtAddr};

/// One record per possible APIC id.
const MAX_APIC_IDS: usize = 256;

static CPUS: [CpuLocal; MAX_APIC_IDS] = {
    let mut cpus = [const { CpuLocal::new(0) }; MAX_APIC_IDS];
    let mut id = 0;
    while id < MAX_APIC_IDS {
        cpus[id] = CpuLocal::new(id);
        id += 1;
    }
    cpus
};

/// Local APIC id of the executing core.
#[inline]
pub fn apic_id() -> usize {
    // SAFETY: CPUID leaf 1 exists on every x86_64 processor.
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    (leaf.ebx >> 24) as usize
}

/// The executing core's record.
#[inline]
pub fn this_cpu() -> &'static CpuLocal {
    &CPUS[apic_id()]
}

#[inline]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

#[inline]
pub fn enable_interrupts() {
    interrupts::enable();
}

#[inline]
pub fn disable_interrupts() {
    interrupts::disable();
}

/// Load `root` into CR3. Skips the write (and the TLB flush it implies)
/// when the tree is already active.
pub fn activate_address_space(root: PhysFrame) {
    let cpu = this_cpu();
    let phys = root.start().as_u64();
    if cpu.active_root.swap(phys, Ordering::Relaxed) == phys {
        return;
    }
    let frame = HwFrame::containing_address(HwPhysAddr::new(phys));
    // SAFETY: every root handed to us carries the shared kernel half, so
    // the code and stack we are running on stay mapped.
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

/// Kernel stack the next trap from ring 3 lands on.
pub fn set_trap_stack(top: VirtAddr) {
    this_cpu().trap_stack.store(top.as_u64(), Ordering::Relaxed);
    super::usermode::load_rsp0(top.as_u64());
}

/// Drop every non-global translation on this core.
pub fn flush_tlb() {
    tlb::flush_all();
}

/// Wait for the next interrupt. Interrupts are enabled atomically with
/// the halt, so a wakeup arriving in between is not lost.
pub fn idle() {
    interrupts::enable_and_hlt();
}

/// Halts the CPU in an unrecoverable state.
pub fn halt_forever() -> ! {
    loop {
        interrupts::disable();
        ::x86_64::instructions::hlt();
    }
}
