//! Kernel parameters.
//!
//! Compile-time limits live here as constants; everything that depends on
//! the machine (core ids, physical memory span, device windows) arrives at
//! boot in a [`BootConfig`].

use alloc::vec::Vec;

use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::vmm::PageTableFlags;

/// Process table capacity.
pub const NPROC: usize = 64;

/// Maximum number of cores the kernel tracks.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Bytes of kernel stack per process.
pub const KSTACK_SIZE: u64 = PAGE_SIZE;

/// Length of the debug name, including padding.
pub const PROC_NAME_LEN: usize = 16;

/// First address of the kernel-reserved region. User sizes never exceed it.
pub const USER_END: u64 = 0x0000_8000_0000_0000;

/// First PML4 slot of the kernel half. Slots below belong to the process.
pub const KERNEL_HALF_START: usize = 256;

/// Where all physical memory is mapped in every address space.
pub const HHDM_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Link address of the kernel image.
pub const KERNEL_TEXT_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// One fixed kernel mapping installed in every address space.
#[derive(Debug, Clone, Copy)]
pub struct KernelRegion {
    pub name: &'static str,
    pub virt: VirtAddr,
    pub phys: PhysAddr,
    pub size: u64,
    pub flags: PageTableFlags,
}

/// The table of kernel regions.
#[derive(Debug, Clone, Default)]
pub struct KernelLayout {
    pub regions: Vec<KernelRegion>,
}

/// Physical extents the standard layout is built from.
#[derive(Debug, Clone, Copy)]
pub struct PhysicalExtents {
    /// Exclusive end of RAM.
    pub phys_top: u64,
    /// Kernel image: text `[text_start, data_start)`, data `[data_start, end)`.
    pub kernel_text: PhysAddr,
    pub kernel_data: PhysAddr,
    pub kernel_end: PhysAddr,
    /// Bytes of legacy device I/O space at the bottom of physical memory.
    pub io_window: u64,
    /// Memory-mapped device registers (local APIC, I/O APIC, ...). Must lie
    /// above `phys_top`.
    pub mmio: (PhysAddr, u64),
}

impl KernelLayout {
    /// The regions every address space carries: I/O space, kernel text
    /// (read/execute), kernel data, all of RAM (read/write, no-execute), and
    /// device MMIO (uncached).
    pub fn standard(ext: PhysicalExtents) -> Self {
        let data_flags = PageTableFlags::KERNEL_DATA;
        let text_len = ext.kernel_data - ext.kernel_text;
        let data_len = ext.kernel_end - ext.kernel_data;
        let regions = alloc::vec![
            KernelRegion {
                name: "io",
                virt: VirtAddr::new(HHDM_BASE),
                phys: PhysAddr::zero(),
                size: ext.io_window,
                flags: data_flags.union(PageTableFlags::NO_CACHE),
            },
            KernelRegion {
                name: "text",
                virt: VirtAddr::new(KERNEL_TEXT_BASE),
                phys: ext.kernel_text,
                size: text_len,
                flags: PageTableFlags::KERNEL_CODE,
            },
            KernelRegion {
                name: "data",
                virt: VirtAddr::new(KERNEL_TEXT_BASE + text_len),
                phys: ext.kernel_data,
                size: data_len,
                flags: data_flags,
            },
            KernelRegion {
                name: "physmem",
                virt: VirtAddr::new(HHDM_BASE + ext.io_window),
                phys: PhysAddr::new(ext.io_window),
                size: ext.phys_top - ext.io_window,
                flags: data_flags,
            },
            KernelRegion {
                name: "mmio",
                virt: VirtAddr::new(HHDM_BASE + ext.mmio.0.as_u64()),
                phys: ext.mmio.0,
                size: ext.mmio.1,
                flags: data_flags.union(PageTableFlags::NO_CACHE),
            },
        ];
        Self { regions }
    }
}

/// Everything `Kernel::new` needs from boot code.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Hardware ids of the cores that will run scheduler loops, index 0
    /// being the core that services the timer tick.
    pub cpu_ids: Vec<usize>,
    pub layout: KernelLayout,
}
