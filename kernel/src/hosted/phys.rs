//! Simulated physical memory.
//!
//! Physical address `p` is byte `p` of one host allocation, and the HHDM
//! offset is that allocation's base, so `PhysAddr::to_virt` yields a real
//! host pointer. Frames are carved out of the arena with a bump cursor and
//! never returned; each machine or test takes its own disjoint region.

use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{KernelLayout, PhysicalExtents};
use crate::memory::address::{init_hhdm, PhysAddr, HUGE_PAGE_SIZE, PAGE_SIZE};

/// Bytes of simulated RAM. Host memory is only committed when touched.
pub const ARENA_BYTES: u64 = 512 << 20;

static ARENA: spin::Once<u64> = spin::Once::new();

/// Page 0 stays unused so that no frame has physical address zero.
static CURSOR: AtomicU64 = AtomicU64::new(PAGE_SIZE);

fn arena_base() -> u64 {
    *ARENA.call_once(|| {
        let layout = match Layout::from_size_align(ARENA_BYTES as usize, HUGE_PAGE_SIZE as usize) {
            Ok(layout) => layout,
            Err(err) => panic!("phys: bad arena layout: {}", err),
        };
        // SAFETY: the layout has non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        init_hhdm(base as u64);
        base as u64
    })
}

/// A run of frames `[start, end)` owned by whoever reserved it.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub start: PhysAddr,
    pub end: PhysAddr,
}

/// Take `frames` fresh frames out of the arena.
///
/// # Panics
/// When the arena is exhausted.
pub fn reserve(frames: usize) -> Region {
    arena_base();
    let bytes = frames as u64 * PAGE_SIZE;
    let start = CURSOR.fetch_add(bytes, Ordering::Relaxed);
    if start + bytes > ARENA_BYTES {
        panic!("phys: simulated RAM exhausted ({} frames requested)", frames);
    }
    Region {
        start: PhysAddr::new(start),
        end: PhysAddr::new(start + bytes),
    }
}

/// Kernel regions of the simulated machine: RAM is the arena, the image
/// sits at 1 MiB, and one page of local-APIC registers lives above RAM.
pub fn layout() -> KernelLayout {
    KernelLayout::standard(PhysicalExtents {
        phys_top: ARENA_BYTES,
        kernel_text: PhysAddr::new(0x10_0000),
        kernel_data: PhysAddr::new(0x10_8000),
        kernel_end: PhysAddr::new(0x11_0000),
        io_window: 0x10_0000,
        mmio: (PhysAddr::new(0xFEE0_0000), PAGE_SIZE),
    })
}
