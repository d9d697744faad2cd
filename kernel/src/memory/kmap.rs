//! The kernel half shared by every address space.
//!
//! Boot builds one template tree from the region table. New address spaces
//! copy the template's upper-half PML4 slots, so they all point at the same
//! PDPTs and see identical kernel mappings. Those shared tables are never
//! freed by a process.

use super::address::{PhysAddr, PhysFrame, VirtAddr, HUGE_PAGE_SIZE, PAGE_SIZE};
use super::pmm::FrameAllocator;
use super::vmm::{self, MapError};
use crate::config::{KernelRegion, KERNEL_HALF_START};

/// Template root for the kernel mappings; also the address space the
/// scheduler loops run in.
pub struct KernelMap {
    root: PhysFrame,
}

impl KernelMap {
    /// Map every region. The template is frozen afterwards; nothing maps
    /// into the kernel half once processes exist.
    pub fn build(regions: &[KernelRegion], frames: &dyn FrameAllocator) -> Result<Self, MapError> {
        let root = vmm::new_table(frames).ok_or(MapError::OutOfMemory)?;
        for region in regions {
            assert!(region.virt.is_kernel(), "kmap: region {} below the kernel half", region.name);
            Self::map_region(root, region, frames)?;
            klog::debug!(
                "kmap: {:<8} {} -> {} ({:#x} bytes)",
                region.name,
                region.virt,
                region.phys,
                region.size
            );
        }
        Ok(Self { root })
    }

    fn map_region(
        root: PhysFrame,
        region: &KernelRegion,
        frames: &dyn FrameAllocator,
    ) -> Result<(), MapError> {
        let mut virt = region.virt.page_align_down().as_u64();
        let mut phys = region.phys.page_align_down().as_u64();
        let end = region.virt.as_u64() + region.size;
        while virt < end {
            let remaining = end - virt;
            let huge = virt % HUGE_PAGE_SIZE == 0
                && phys % HUGE_PAGE_SIZE == 0
                && remaining >= HUGE_PAGE_SIZE;
            // SAFETY: the template is private to boot until `build` returns.
            let step = unsafe {
                if huge {
                    vmm::map_huge_page(
                        root,
                        VirtAddr::new(virt),
                        PhysAddr::new(phys),
                        region.flags,
                        frames,
                    )?;
                    HUGE_PAGE_SIZE
                } else {
                    vmm::map_page(
                        root,
                        VirtAddr::new(virt),
                        PhysFrame::from_start(PhysAddr::new(phys)),
                        region.flags,
                        frames,
                    )?;
                    PAGE_SIZE
                }
            };
            virt += step;
            phys += step;
        }
        Ok(())
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Point the upper half of `root` at the shared kernel tables.
    pub fn install(&self, root: PhysFrame) {
        // SAFETY: the template's upper half is immutable after build, and
        // `root` belongs to the caller.
        let (template, target) = unsafe { (vmm::table_mut(self.root), vmm::table_mut(root)) };
        for slot in KERNEL_HALF_START..512 {
            target[slot] = template[slot];
        }
    }

    /// True when `root` carries exactly the template's kernel half.
    pub fn is_installed_in(&self, root: PhysFrame) -> bool {
        let (template, target) = unsafe { (vmm::table_mut(self.root), vmm::table_mut(root)) };
        (KERNEL_HALF_START..512).all(|slot| target[slot] == template[slot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelLayout, PhysicalExtents, HHDM_BASE, KERNEL_TEXT_BASE};
    use crate::hosted::phys;
    use crate::memory::pmm::FreeList;
    use crate::memory::vmm::{translate, PageTableFlags};

    fn layout() -> KernelLayout {
        KernelLayout::standard(PhysicalExtents {
            phys_top: 8 * HUGE_PAGE_SIZE,
            kernel_text: PhysAddr::new(0x10_0000),
            kernel_data: PhysAddr::new(0x10_4000),
            kernel_end: PhysAddr::new(0x10_8000),
            io_window: 0x10_0000,
            mmio: (PhysAddr::new(0xFEE0_0000), PAGE_SIZE),
        })
    }

    #[test]
    fn regions_are_mapped_with_their_permissions() {
        let region = phys::reserve(64);
        let frames = unsafe { FreeList::new(region.start, region.end) };
        let kmap = KernelMap::build(&layout().regions, &frames).unwrap();

        let text = translate(kmap.root(), VirtAddr::new(KERNEL_TEXT_BASE + 8)).unwrap();
        assert_eq!(text.phys, PhysAddr::new(0x10_0008));
        assert!(!text.flags.contains(PageTableFlags::WRITABLE));
        assert!(!text.flags.contains(PageTableFlags::NO_EXECUTE));

        let ram = translate(kmap.root(), VirtAddr::new(HHDM_BASE + 0x30_0010)).unwrap();
        assert_eq!(ram.phys, PhysAddr::new(0x30_0010));
        assert!(ram.flags.contains(PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE));

        let mmio = translate(kmap.root(), VirtAddr::new(HHDM_BASE + 0xFEE0_0020)).unwrap();
        assert!(mmio.flags.contains(PageTableFlags::NO_CACHE));
        assert!(translate(kmap.root(), VirtAddr::new(0x1000)).is_none());
    }

    #[test]
    fn install_shares_the_kernel_half() {
        let region = phys::reserve(64);
        let frames = unsafe { FreeList::new(region.start, region.end) };
        let kmap = KernelMap::build(&layout().regions, &frames).unwrap();
        let root = vmm::new_table(&frames).unwrap();
        assert!(!kmap.is_installed_in(root));
        kmap.install(root);
        assert!(kmap.is_installed_in(root));
        let a = translate(kmap.root(), VirtAddr::new(HHDM_BASE + 0x20_0000));
        let b = translate(root, VirtAddr::new(HHDM_BASE + 0x20_0000));
        assert_eq!(a, b);
    }
}
