// =============================================================================
// mpkernel — Process Address Spaces
// =============================================================================
//
// An `AddressSpace` owns the lower half of one page-table tree: the root
// PML4, every table reachable from PML4[0..256], and every frame mapped
// there. The upper half points at the shared kernel tables from `KernelMap`
// and is never freed from here.
//
// The user region is contiguous from address zero up to the process size.
// Sizes passed in need not be page aligned; rounding happens here.
//
// Dropping an `AddressSpace` frees the whole lower half, leaves first, then
// the tables, then the root.
//
// =============================================================================

use super::address::{page_round_down, page_round_up, PhysAddr, PhysFrame, VirtAddr, PAGE_SIZE};
use super::kmap::KernelMap;
use super::pmm::{self, FrameAllocator};
use super::vmm::{self, MapError, PageTableFlags, Translation, Walk};
use crate::arch;
use crate::config::{KERNEL_HALF_START, USER_END};
use crate::error::VmError;
use crate::fs::{FileRef, Filesystem};

/// Where the frames behind a new mapping come from.
#[derive(Debug, Clone, Copy)]
pub enum Backing {
    /// A contiguous run of frames starting here. Ownership moves to the
    /// address space once the mapping succeeds.
    Frames(PhysAddr),
    /// A fresh zero-filled frame per page.
    Zeroed,
}

pub struct AddressSpace {
    root: PhysFrame,
    kernel: &'static KernelMap,
    frames: &'static dyn FrameAllocator,
}

impl AddressSpace {
    /// A tree holding only the kernel mappings.
    pub fn new(
        kernel: &'static KernelMap,
        frames: &'static dyn FrameAllocator,
    ) -> Result<Self, VmError> {
        let root = vmm::new_table(frames).ok_or(VmError::OutOfMemory)?;
        kernel.install(root);
        Ok(Self { root, kernel, frames })
    }

    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Make this tree the active one on the current core. Traps from user
    /// mode will enter the kernel on the stack ending at `trap_stack`.
    pub fn activate(&self, trap_stack: VirtAddr) {
        arch::set_trap_stack(trap_stack);
        arch::activate_address_space(self.root);
    }

    /// Install leaf mappings for `[start, start + size)`.
    ///
    /// Finding a page already mapped is a kernel bug and panics. On
    /// allocation failure the pages added by this call are removed again.
    pub fn map_range(
        &mut self,
        start: VirtAddr,
        size: u64,
        backing: Backing,
        flags: PageTableFlags,
    ) -> Result<(), VmError> {
        if size == 0 {
            return Ok(());
        }
        let first = page_round_down(start.as_u64());
        let end = page_round_up(start.as_u64() + size);
        assert!(end <= USER_END, "map_range: {} reaches into the kernel half", start);

        let mut va = first;
        while va < end {
            let frame = match backing {
                Backing::Frames(base) => PhysFrame::from_start(base.page_align_down() + (va - first)),
                Backing::Zeroed => match pmm::allocate_zeroed(self.frames) {
                    Some(frame) => frame,
                    None => {
                        self.unmap_span(first, va, backing);
                        return Err(VmError::OutOfMemory);
                    }
                },
            };
            // SAFETY: we own the lower half of this tree.
            match unsafe { vmm::map_page(self.root, VirtAddr::new(va), frame, flags, self.frames) } {
                Ok(()) => {}
                Err(MapError::OutOfMemory) => {
                    if let Backing::Zeroed = backing {
                        self.frames.free_frame(frame);
                    }
                    self.unmap_span(first, va, backing);
                    return Err(VmError::OutOfMemory);
                }
                Err(err) => panic!("remap: {:#x} ({:?})", va, err),
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    fn unmap_span(&mut self, from: u64, to: u64, backing: Backing) {
        let mut va = from;
        while va < to {
            // SAFETY: we own the lower half of this tree.
            if let Ok(frame) = unsafe { vmm::unmap_page(self.root, VirtAddr::new(va)) } {
                if let Backing::Zeroed = backing {
                    self.frames.free_frame(frame);
                }
            }
            va += PAGE_SIZE;
        }
    }

    /// Map one zeroed page at address 0 holding `image`.
    pub fn init_image(&mut self, image: &[u8]) -> Result<(), VmError> {
        assert!((image.len() as u64) < PAGE_SIZE, "init_image: more than a page");
        self.map_range(VirtAddr::zero(), PAGE_SIZE, Backing::Zeroed, PageTableFlags::USER_RW)?;
        self.copy_out(0, image)
    }

    /// Extend the user region from `old_size` to `new_size` with zeroed,
    /// user-writable pages.
    pub fn grow(&mut self, old_size: u64, new_size: u64) -> Result<u64, VmError> {
        if new_size > USER_END {
            return Err(VmError::LimitExceeded);
        }
        if new_size <= old_size {
            return Ok(old_size);
        }
        let mut va = page_round_up(old_size);
        while va < new_size {
            let Some(frame) = pmm::allocate_zeroed(self.frames) else {
                klog::debug!("grow: out of frames at {:#x}", va);
                self.shrink(new_size, old_size);
                return Err(VmError::OutOfMemory);
            };
            // SAFETY: we own the lower half of this tree.
            let mapped = unsafe {
                vmm::map_page(self.root, VirtAddr::new(va), frame, PageTableFlags::USER_RW, self.frames)
            };
            match mapped {
                Ok(()) => {}
                Err(MapError::OutOfMemory) => {
                    self.frames.free_frame(frame);
                    self.shrink(new_size, old_size);
                    return Err(VmError::OutOfMemory);
                }
                Err(err) => panic!("remap: grow hit {:#x} ({:?})", va, err),
            }
            va += PAGE_SIZE;
        }
        Ok(new_size)
    }

    /// Unmap and free every page in `[new_size, old_size)`.
    ///
    /// Absent tables are skipped a whole table span at a time, so shrinking
    /// a sparse region is cheap.
    pub fn shrink(&mut self, old_size: u64, new_size: u64) -> u64 {
        if new_size >= old_size {
            return old_size;
        }
        let mut va = page_round_up(new_size);
        while va < old_size {
            // SAFETY: we own the lower half of this tree.
            match unsafe { vmm::lookup(self.root, VirtAddr::new(va)) } {
                Walk::Missing { span } => {
                    va = (va & !(span - 1)) + span;
                    continue;
                }
                Walk::Leaf(leaf) => {
                    if leaf.is_present() {
                        let frame = leaf.frame();
                        leaf.clear();
                        self.frames.free_frame(frame);
                    }
                }
                Walk::Huge => panic!("shrink: huge page in the user region at {:#x}", va),
            }
            va += PAGE_SIZE;
        }
        new_size
    }

    /// Deep copy of the first `size` bytes into a new tree.
    ///
    /// Every page below `size` must be present. On failure the partial copy
    /// is freed and `self` is untouched.
    pub fn duplicate(&self, size: u64) -> Result<AddressSpace, VmError> {
        let mut child = AddressSpace::new(self.kernel, self.frames)?;
        let mut va = 0;
        while va < size {
            // SAFETY: the parent is only read here.
            let entry = match unsafe { vmm::lookup(self.root, VirtAddr::new(va)) } {
                Walk::Leaf(leaf) if leaf.is_present() => *leaf,
                _ => panic!("duplicate: page {:#x} not present", va),
            };
            let frame = self.frames.allocate_frame().ok_or(VmError::OutOfMemory)?;
            // SAFETY: the new frame is ours, the source frame stays mapped
            // in the parent for the duration of the copy.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    entry.frame().as_mut_ptr::<u8>() as *const u8,
                    frame.as_mut_ptr::<u8>(),
                    PAGE_SIZE as usize,
                );
            }
            let flags = entry.flags() & PageTableFlags::INHERITABLE;
            // SAFETY: `child` is private to this call.
            let mapped = unsafe {
                vmm::map_page(child.root, VirtAddr::new(va), frame, flags, child.frames)
            };
            if let Err(err) = mapped {
                self.frames.free_frame(frame);
                match err {
                    MapError::OutOfMemory => return Err(VmError::OutOfMemory),
                    other => panic!("duplicate: {:#x} ({:?})", va, other),
                }
            }
            va += PAGE_SIZE;
        }
        Ok(child)
    }

    /// Release the user region of `size` bytes and then the whole tree.
    pub fn destroy(mut self, size: u64) {
        self.shrink(size, 0);
        drop(self);
    }

    /// Copy bytes from `file` at `offset` into the already-mapped pages at
    /// `virt`, which must be page aligned.
    pub fn load_image_segment(
        &mut self,
        virt: VirtAddr,
        fs: &dyn Filesystem,
        file: FileRef,
        offset: u64,
        len: u64,
    ) -> Result<(), VmError> {
        assert!(virt.is_page_aligned(), "load_image_segment: {} not page aligned", virt);
        let mut done = 0;
        while done < len {
            let va = virt + done;
            let frame = self
                .present_frame(va.as_u64())
                .unwrap_or_else(|| panic!("load_image_segment: {} should be mapped", va));
            let n = core::cmp::min(PAGE_SIZE, len - done) as usize;
            // SAFETY: the frame belongs to this space and nothing else is
            // touching it while the image loads.
            let dst = unsafe { &mut frame.bytes_mut()[..n] };
            if fs.read_at(file, dst, offset + done) != Some(n) {
                return Err(VmError::IoError);
            }
            done += PAGE_SIZE;
        }
        Ok(())
    }

    /// Copy `src` into user memory at `virt`, crossing pages as needed.
    ///
    /// Works on any address space, not only the active one.
    pub fn copy_out(&self, virt: u64, src: &[u8]) -> Result<(), VmError> {
        let end = virt.checked_add(src.len() as u64).ok_or(VmError::BadAddress)?;
        if end > USER_END {
            return Err(VmError::BadAddress);
        }
        let mut va = virt;
        let mut rest = src;
        while !rest.is_empty() {
            let page = page_round_down(va);
            let frame = self.user_frame(page).ok_or(VmError::BadAddress)?;
            let offset = (va - page) as usize;
            let n = core::cmp::min(PAGE_SIZE as usize - offset, rest.len());
            // SAFETY: user frame of this space, bounds checked above.
            unsafe { frame.bytes_mut()[offset..offset + n].copy_from_slice(&rest[..n]) };
            rest = &rest[n..];
            va = page + PAGE_SIZE;
        }
        Ok(())
    }

    /// Copy user memory at `virt` into `dst`.
    pub fn copy_in(&self, virt: u64, dst: &mut [u8]) -> Result<(), VmError> {
        let end = virt.checked_add(dst.len() as u64).ok_or(VmError::BadAddress)?;
        if end > USER_END {
            return Err(VmError::BadAddress);
        }
        let mut va = virt;
        let mut filled = 0;
        while filled < dst.len() {
            let page = page_round_down(va);
            let frame = self.user_frame(page).ok_or(VmError::BadAddress)?;
            let offset = (va - page) as usize;
            let n = core::cmp::min(PAGE_SIZE as usize - offset, dst.len() - filled);
            // SAFETY: user frame of this space, bounds checked above.
            dst[filled..filled + n].copy_from_slice(unsafe { &frame.bytes_mut()[offset..offset + n] });
            filled += n;
            va = page + PAGE_SIZE;
        }
        Ok(())
    }

    /// Make the page at `virt` inaccessible from user mode (stack guard).
    pub fn clear_user(&mut self, virt: VirtAddr) {
        // SAFETY: we own the lower half of this tree.
        match unsafe { vmm::lookup(self.root, virt) } {
            Walk::Leaf(leaf) if leaf.is_present() => {
                leaf.set_flags(leaf.flags() - PageTableFlags::USER);
            }
            _ => panic!("clear_user: {} not mapped", virt),
        }
    }

    pub fn translate(&self, virt: VirtAddr) -> Option<Translation> {
        vmm::translate(self.root, virt)
    }

    fn present_frame(&self, va: u64) -> Option<PhysFrame> {
        if va >= USER_END {
            return None;
        }
        self.translate(VirtAddr::new(va)).map(|t| PhysFrame::containing(t.phys))
    }

    fn user_frame(&self, va: u64) -> Option<PhysFrame> {
        if va >= USER_END {
            return None;
        }
        let t = self.translate(VirtAddr::new(va))?;
        t.flags
            .contains(PageTableFlags::PRESENT | PageTableFlags::USER)
            .then(|| PhysFrame::containing(t.phys))
    }

    /// Number of leaf pages mapped in the user half.
    pub fn user_pages(&self) -> usize {
        // SAFETY: read-only traversal of our own tree.
        let pml4 = unsafe { vmm::table_mut(self.root) };
        pml4.iter()
            .take(KERNEL_HALF_START)
            .filter(|e| e.is_present())
            .map(|e| count_leaves(e.frame(), 3))
            .sum()
    }
}

fn count_leaves(table: PhysFrame, level: usize) -> usize {
    // SAFETY: tables below a user PML4 slot belong to the same space.
    let table = unsafe { vmm::table_mut(table) };
    table
        .iter()
        .filter(|e| e.is_present())
        .map(|e| if level == 1 { 1 } else { count_leaves(e.frame(), level - 1) })
        .sum()
}

fn free_level(table_frame: PhysFrame, level: usize, frames: &dyn FrameAllocator) {
    // SAFETY: called only on tables owned by the space being dropped.
    let table = unsafe { vmm::table_mut(table_frame) };
    for entry in table.iter().filter(|e| e.is_present()) {
        if level == 1 {
            frames.free_frame(entry.frame());
        } else {
            debug_assert!(!entry.is_huge(), "huge page in a user table");
            free_level(entry.frame(), level - 1, frames);
        }
    }
    frames.free_frame(table_frame);
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // SAFETY: the tree is ours and no core has it active any more.
        let pml4 = unsafe { vmm::table_mut(self.root) };
        for slot in 0..KERNEL_HALF_START {
            if pml4[slot].is_present() {
                free_level(pml4[slot].frame(), 3, self.frames);
            }
        }
        self.frames.free_frame(self.root);
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace").field("root", &self.root).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::phys;
    use crate::memory::pmm::FreeList;
    use alloc::boxed::Box;
    use alloc::vec;

    struct Env {
        frames: &'static FreeList,
        kmap: &'static KernelMap,
    }

    fn env(n: usize) -> Env {
        let region = phys::reserve(n);
        let frames: &'static FreeList =
            Box::leak(Box::new(unsafe { FreeList::new(region.start, region.end) }));
        let kmap = Box::leak(Box::new(KernelMap::build(&[], frames).unwrap()));
        Env { frames, kmap }
    }

    impl Env {
        fn space(&self) -> AddressSpace {
            AddressSpace::new(self.kmap, self.frames).unwrap()
        }
    }

    #[test]
    fn grow_shrink_round_trip() {
        let env = env(64);
        let mut space = env.space();
        let size = space.grow(0, 3 * PAGE_SIZE + 5).unwrap();
        assert_eq!(size, 3 * PAGE_SIZE + 5);
        assert_eq!(space.user_pages(), 4);

        let mut buf = vec![0xFFu8; (4 * PAGE_SIZE) as usize];
        space.copy_in(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0), "grown memory must be zero-filled");

        let grown = space.grow(size, size + 2 * PAGE_SIZE).unwrap();
        assert_eq!(space.user_pages(), 6);
        assert_eq!(space.shrink(grown, size), size);
        assert_eq!(space.user_pages(), 4);
        for page in 4..6 {
            assert!(space.translate(VirtAddr::new(page * PAGE_SIZE)).is_none());
        }
    }

    #[test]
    fn growth_into_kernel_half_is_rejected() {
        let env = env(16);
        let mut space = env.space();
        space.grow(0, PAGE_SIZE).unwrap();
        let before = env.frames.free_count();
        assert_eq!(space.grow(PAGE_SIZE, USER_END + 1), Err(VmError::LimitExceeded));
        assert_eq!(env.frames.free_count(), before);
        assert_eq!(space.user_pages(), 1);
    }

    #[test]
    fn failed_growth_rolls_back_only_new_pages() {
        // kernel template, root + PDPT + PD + PT + 1 page, then room for
        // exactly two more.
        let env = env(8);
        let mut space = env.space();
        space.grow(0, PAGE_SIZE).unwrap();
        space.copy_out(0, b"keep").unwrap();
        assert_eq!(env.frames.free_count(), 2);

        assert_eq!(space.grow(PAGE_SIZE, 10 * PAGE_SIZE), Err(VmError::OutOfMemory));
        assert_eq!(env.frames.free_count(), 2);
        assert_eq!(space.user_pages(), 1);
        let mut word = [0u8; 4];
        space.copy_in(0, &mut word).unwrap();
        assert_eq!(&word, b"keep");
    }

    #[test]
    fn destroy_returns_every_frame() {
        let env = env(64);
        let initial = env.frames.free_count();
        let mut space = env.space();
        space.grow(0, 5 * PAGE_SIZE).unwrap();
        space
            .map_range(VirtAddr::new(1 << 30), PAGE_SIZE, Backing::Zeroed, PageTableFlags::USER_RW)
            .unwrap();
        space.destroy(5 * PAGE_SIZE);
        assert_eq!(env.frames.free_count(), initial);
    }

    #[test]
    fn shrink_skips_absent_tables() {
        let env = env(16);
        let mut space = env.space();
        assert_eq!(space.shrink(USER_END, 0), 0);
        space
            .map_range(VirtAddr::new(3 << 30), PAGE_SIZE, Backing::Zeroed, PageTableFlags::USER_RW)
            .unwrap();
        assert_eq!(space.user_pages(), 1);
        space.shrink(4 << 30, 0);
        assert_eq!(space.user_pages(), 0);
    }

    #[test]
    fn duplicate_copies_without_aliasing() {
        let env = env(64);
        let mut parent = env.space();
        let size = parent.grow(0, 2 * PAGE_SIZE).unwrap();
        parent.copy_out(PAGE_SIZE - 2, b"spans").unwrap();

        let child = parent.duplicate(size).unwrap();
        let mut got = [0u8; 5];
        child.copy_in(PAGE_SIZE - 2, &mut got).unwrap();
        assert_eq!(&got, b"spans");

        child.copy_out(PAGE_SIZE - 2, b"child").unwrap();
        parent.copy_in(PAGE_SIZE - 2, &mut got).unwrap();
        assert_eq!(&got, b"spans");
        assert_ne!(
            parent.translate(VirtAddr::zero()).unwrap().phys,
            child.translate(VirtAddr::zero()).unwrap().phys
        );
    }

    #[test]
    fn failed_duplicate_leaves_parent_alone() {
        let env = env(12);
        let mut parent = env.space();
        let size = parent.grow(0, 4 * PAGE_SIZE).unwrap();
        parent.copy_out(0, b"parent").unwrap();
        let free = env.frames.free_count();
        // The copy needs a root, three tables and four pages; there are fewer.
        assert!(free < 8);
        assert_eq!(parent.duplicate(size).unwrap_err(), VmError::OutOfMemory);
        assert_eq!(env.frames.free_count(), free);
        let mut got = [0u8; 6];
        parent.copy_in(0, &mut got).unwrap();
        assert_eq!(&got, b"parent");
    }

    #[test]
    fn guard_pages_are_inherited_and_refuse_copies() {
        let env = env(32);
        let mut parent = env.space();
        let size = parent.grow(0, 2 * PAGE_SIZE).unwrap();
        parent.clear_user(VirtAddr::zero());
        assert_eq!(parent.copy_out(0, b"x"), Err(VmError::BadAddress));
        assert!(parent.copy_out(PAGE_SIZE, b"x").is_ok());

        let child = parent.duplicate(size).unwrap();
        let flags = child.translate(VirtAddr::zero()).unwrap().flags;
        assert!(!flags.contains(PageTableFlags::USER));
        assert_eq!(child.copy_out(0, b"x"), Err(VmError::BadAddress));
    }

    #[test]
    fn a_leading_guard_page_keeps_the_child_path_user_accessible() {
        let env = env(32);
        let mut parent = env.space();
        let size = parent.grow(0, 2 * PAGE_SIZE).unwrap();
        parent.copy_out(PAGE_SIZE, b"kept").unwrap();
        parent.clear_user(VirtAddr::zero());

        let child = parent.duplicate(size).unwrap();
        // SAFETY: read-only look at the roots of two live spaces.
        let (p, c) = unsafe { (vmm::table_mut(parent.root()), vmm::table_mut(child.root())) };
        assert_eq!(p[0].flags(), c[0].flags());
        assert!(c[0].flags().contains(PageTableFlags::USER));

        let page = child.translate(VirtAddr::new(PAGE_SIZE)).unwrap();
        assert!(page.flags.contains(PageTableFlags::USER | PageTableFlags::WRITABLE));
        let mut buf = [0u8; 4];
        child.copy_in(PAGE_SIZE, &mut buf).unwrap();
        assert_eq!(&buf, b"kept");
    }

    #[test]
    fn copies_fail_on_unmapped_pages() {
        let env = env(16);
        let mut space = env.space();
        space.grow(0, PAGE_SIZE).unwrap();
        assert_eq!(space.copy_out(PAGE_SIZE - 1, b"ab"), Err(VmError::BadAddress));
        assert_eq!(space.copy_out(USER_END - 1, b"ab"), Err(VmError::BadAddress));
        let mut buf = [0u8; 2];
        assert_eq!(space.copy_in(2 * PAGE_SIZE, &mut buf), Err(VmError::BadAddress));
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn mapping_twice_is_fatal() {
        let env = env(16);
        let mut space = env.space();
        space.grow(0, PAGE_SIZE).unwrap();
        let _ = space.map_range(VirtAddr::zero(), PAGE_SIZE, Backing::Zeroed, PageTableFlags::USER_RW);
    }

    #[test]
    fn init_image_lands_at_zero() {
        let env = env(16);
        let mut space = env.space();
        space.init_image(b"\x7fimage").unwrap();
        let mut got = [0u8; 6];
        space.copy_in(0, &mut got).unwrap();
        assert_eq!(&got, b"\x7fimage");
        assert_eq!(space.user_pages(), 1);
    }

    struct Image(&'static [u8]);

    impl Filesystem for Image {
        fn dup_file(&self, file: FileRef) -> FileRef {
            file
        }
        fn close_file(&self, _: FileRef) {}
        fn dup_dir(&self, dir: crate::fs::DirRef) -> crate::fs::DirRef {
            dir
        }
        fn release_dir(&self, _: crate::fs::DirRef) {}
        fn root_dir(&self) -> crate::fs::DirRef {
            crate::fs::DirRef(1)
        }
        fn read_at(&self, _: FileRef, dst: &mut [u8], offset: u64) -> Option<usize> {
            let start = offset as usize;
            if start > self.0.len() {
                return None;
            }
            let n = core::cmp::min(dst.len(), self.0.len() - start);
            dst[..n].copy_from_slice(&self.0[start..start + n]);
            Some(n)
        }
    }

    #[test]
    fn load_image_segment_reads_through_the_file_layer() {
        let env = env(32);
        let mut space = env.space();
        let size = space.grow(0, 2 * PAGE_SIZE).unwrap();
        let bytes: &'static [u8] = Box::leak(vec![7u8; PAGE_SIZE as usize + 100].into_boxed_slice());
        let fs = Image(bytes);

        space.load_image_segment(VirtAddr::zero(), &fs, FileRef(3), 0, PAGE_SIZE + 100).unwrap();
        let mut got = [0u8; 4];
        space.copy_in(PAGE_SIZE + 96, &mut got).unwrap();
        assert_eq!(got, [7; 4]);

        assert_eq!(
            space.load_image_segment(VirtAddr::zero(), &fs, FileRef(3), 50, PAGE_SIZE + 100),
            Err(VmError::IoError)
        );
        space.destroy(size);
    }
}
