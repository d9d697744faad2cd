// =============================================================================
// mpkernel — Page Table Primitives
// =============================================================================
//
// Entries, tables and single-page operations on x86_64 4-level paging.
// Nothing here knows what a process is: `space.rs` assembles per-process
// address spaces from these pieces and `kmap.rs` assembles the shared kernel
// half.
//
// Levels are numbered from the leaf up: level 0 is the page table whose
// entries name 4 KiB frames, level 3 is the root (PML4). An entry at level
// `n` covers `1 << (12 + 9n)` bytes.
//
// Entry layout: bit 0 present, 1 writable, 2 user, 7 large page (levels 1
// and 2 only), bits 12..52 the frame, bit 63 no-execute.
//
// Tables are edited through the direct map. A fresh table is zeroed before
// it is linked in, a present leaf is never overwritten, and intermediate
// entries are permissive so that only the leaf decides access.
//
// =============================================================================

use bitflags::bitflags;

use super::address::{PhysAddr, PhysFrame, VirtAddr, HUGE_PAGE_SIZE};
use super::pmm::{self, FrameAllocator};

const ROOT_LEVEL: usize = 3;
const ENTRIES: usize = 512;
const FRAME_BITS: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Hardware bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        const PRESENT    = 1;
        const WRITABLE   = 1 << 1;
        const USER       = 1 << 2;
        const NO_CACHE   = 1 << 4;
        const HUGE_PAGE  = 1 << 7;
        const GLOBAL     = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageTableFlags {
    pub const KERNEL_CODE: Self = Self::PRESENT.union(Self::GLOBAL);
    /// Kernel data, stacks and the direct map.
    pub const KERNEL_DATA: Self = Self::KERNEL_CODE.union(Self::WRITABLE).union(Self::NO_EXECUTE);
    const TABLE_KERNEL: Self = Self::PRESENT.union(Self::WRITABLE);
    const TABLE_USER: Self = Self::TABLE_KERNEL.union(Self::USER);
    pub const USER_RW: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
    /// What a page copied into a child may keep from its source. Never more
    /// than the source had.
    pub const INHERITABLE: Self = Self::USER_RW.union(Self::NO_EXECUTE);
}

/// Bytes one entry at `level` maps.
const fn entry_span(level: usize) -> u64 {
    1 << (12 + 9 * level)
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    #[inline]
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    /// Only meaningful when present.
    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & FRAME_BITS)
    }

    #[inline]
    pub fn frame(self) -> PhysFrame {
        PhysFrame::containing(self.addr())
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    #[inline]
    pub fn is_huge(self) -> bool {
        self.flags().contains(PageTableFlags::HUGE_PAGE)
    }

    #[inline]
    pub fn set(&mut self, addr: PhysAddr, flags: PageTableFlags) {
        debug_assert!(addr.is_page_aligned(), "entry target {} is unaligned", addr);
        self.0 = addr.as_u64() & FRAME_BITS | flags.bits();
    }

    #[inline]
    pub fn set_flags(&mut self, flags: PageTableFlags) {
        self.set(self.addr(), flags);
    }

    #[inline]
    pub fn clear(&mut self) {
        *self = Self(0);
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.is_present() {
            true => f.debug_tuple("Entry").field(&self.addr()).field(&self.flags()).finish(),
            false => f.write_str("Entry(-)"),
        }
    }
}

/// A table at any level; exactly one frame.
#[repr(C, align(4096))]
pub struct PageTable([PageTableEntry; ENTRIES]);

impl PageTable {
    pub fn iter(&self) -> core::slice::Iter<'_, PageTableEntry> {
        self.0.iter()
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;
    fn index(&self, slot: usize) -> &PageTableEntry {
        &self.0[slot]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, slot: usize) -> &mut PageTableEntry {
        &mut self.0[slot]
    }
}

/// # Safety
/// `frame` holds a page table, and the caller creates no second mutable
/// reference to it while this one lives.
#[inline]
pub unsafe fn table_mut<'a>(frame: PhysFrame) -> &'a mut PageTable {
    // SAFETY: by the contract above.
    unsafe { &mut *frame.as_mut_ptr::<PageTable>() }
}

/// An empty table, or `None` when memory is exhausted.
pub fn new_table(frames: &dyn FrameAllocator) -> Option<PhysFrame> {
    pmm::allocate_zeroed(frames)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    AlreadyMapped,
    /// No frame left for an intermediate table.
    OutOfMemory,
    /// A large page occupies the path.
    HugePageConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    NotMapped,
    HugePageConflict,
}

/// Where a walk toward a leaf ended.
pub enum Walk<'a> {
    /// The level-0 slot, present or not.
    Leaf(&'a mut PageTableEntry),
    /// A table on the path is absent, so the whole aligned `span` around
    /// the address is unmapped.
    Missing { span: u64 },
    /// A large page stands where a table was expected.
    Huge,
}

/// Descend from `root` to the level-0 slot for `virt`.
///
/// `grow` supplies an allocator and the flags for new intermediate entries;
/// without it an absent table ends the walk with [`Walk::Missing`].
///
/// # Safety
/// `root` is a valid root table and the caller has exclusive access to the
/// part of the tree the walk visits.
pub unsafe fn walk<'a>(
    root: PhysFrame,
    virt: VirtAddr,
    grow: Option<(&dyn FrameAllocator, PageTableFlags)>,
) -> Result<Walk<'a>, MapError> {
    // SAFETY: caller's contract.
    let mut table = unsafe { table_mut(root) };
    for level in (1..=ROOT_LEVEL).rev() {
        let entry = &mut table[virt.table_index(level)];
        if !entry.is_present() {
            let Some((frames, flags)) = grow else {
                return Ok(Walk::Missing { span: entry_span(level) });
            };
            let fresh = new_table(frames).ok_or(MapError::OutOfMemory)?;
            entry.set(fresh.start(), flags);
        } else if entry.is_huge() {
            return Ok(Walk::Huge);
        } else if let Some((_, flags)) = grow {
            entry.set_flags(entry.flags() | flags);
        }
        // SAFETY: a present non-leaf entry names a table in the same tree.
        table = unsafe { table_mut(entry.frame()) };
    }
    Ok(Walk::Leaf(&mut table[virt.table_index(0)]))
}

/// [`walk`] without creating tables.
///
/// # Safety
/// As for [`walk`].
pub unsafe fn lookup<'a>(root: PhysFrame, virt: VirtAddr) -> Walk<'a> {
    // SAFETY: forwarded.
    match unsafe { walk(root, virt, None) } {
        Ok(found) => found,
        Err(_) => unreachable!("a non-growing walk cannot run out of memory"),
    }
}

/// Point the 4 KiB page at `virt` to `frame`.
///
/// # Safety
/// As for [`walk`]. Flushing stale TLB entries is the caller's job.
pub unsafe fn map_page(
    root: PhysFrame,
    virt: VirtAddr,
    frame: PhysFrame,
    flags: PageTableFlags,
    frames: &dyn FrameAllocator,
) -> Result<(), MapError> {
    debug_assert!(virt.is_page_aligned(), "map_page at unaligned {}", virt);
    // Every lower-half table is reachable from user mode; the leaf alone
    // decides whether a page is.
    let path = match virt.is_kernel() {
        false => PageTableFlags::TABLE_USER,
        true => PageTableFlags::TABLE_KERNEL,
    };
    // SAFETY: forwarded.
    match unsafe { walk(root, virt, Some((frames, path))) }? {
        Walk::Leaf(leaf) if !leaf.is_present() => {
            leaf.set(frame.start(), flags | PageTableFlags::PRESENT);
            Ok(())
        }
        Walk::Leaf(_) => Err(MapError::AlreadyMapped),
        Walk::Huge => Err(MapError::HugePageConflict),
        Walk::Missing { .. } => unreachable!("growing walk stopped at a missing table"),
    }
}

/// Map a 2 MiB large page with a level-1 entry. Kernel mappings only.
///
/// # Safety
/// As for [`walk`]; `virt` and `phys` are both 2 MiB aligned.
pub unsafe fn map_huge_page(
    root: PhysFrame,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
    frames: &dyn FrameAllocator,
) -> Result<(), MapError> {
    debug_assert!((virt.as_u64() | phys.as_u64()) % HUGE_PAGE_SIZE == 0);
    // SAFETY: caller's contract.
    let mut table = unsafe { table_mut(root) };
    for level in [ROOT_LEVEL, 2] {
        let entry = &mut table[virt.table_index(level)];
        if entry.is_huge() {
            return Err(MapError::HugePageConflict);
        }
        if !entry.is_present() {
            let fresh = new_table(frames).ok_or(MapError::OutOfMemory)?;
            entry.set(fresh.start(), PageTableFlags::TABLE_KERNEL);
        }
        // SAFETY: as in `walk`.
        table = unsafe { table_mut(entry.frame()) };
    }
    let slot = &mut table[virt.table_index(1)];
    if slot.is_present() {
        return Err(MapError::AlreadyMapped);
    }
    slot.set(phys, flags | PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE);
    Ok(())
}

/// Clear the 4 KiB mapping at `virt` and hand back the frame it named,
/// still allocated.
///
/// # Safety
/// As for [`walk`].
pub unsafe fn unmap_page(root: PhysFrame, virt: VirtAddr) -> Result<PhysFrame, UnmapError> {
    // SAFETY: forwarded.
    match unsafe { lookup(root, virt) } {
        Walk::Leaf(leaf) if leaf.is_present() => {
            let frame = leaf.frame();
            leaf.clear();
            Ok(frame)
        }
        Walk::Huge => Err(UnmapError::HugePageConflict),
        Walk::Leaf(_) | Walk::Missing { .. } => Err(UnmapError::NotMapped),
    }
}

/// A resolved mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// The byte's physical address, page offset included.
    pub phys: PhysAddr,
    pub flags: PageTableFlags,
}

/// Follow `virt` through the tree at `root`, large pages included.
///
/// The flags are what the hardware enforces: user access and writes only
/// when every level allows them, no-execute when any level sets it.
pub fn translate(root: PhysFrame, virt: VirtAddr) -> Option<Translation> {
    let gated = PageTableFlags::USER | PageTableFlags::WRITABLE;
    let mut allowed = gated;
    let mut no_exec = PageTableFlags::empty();
    // SAFETY: read-only; every root in circulation is a live table.
    let mut table: &PageTable = unsafe { table_mut(root) };
    for level in (0..=ROOT_LEVEL).rev() {
        let entry = table[virt.table_index(level)];
        if !entry.is_present() {
            return None;
        }
        if level == 0 || entry.is_huge() {
            let within = virt.as_u64() & (entry_span(level) - 1);
            let flags = entry.flags();
            return Some(Translation {
                phys: PhysAddr::new(entry.addr().as_u64() & !(entry_span(level) - 1)) + within,
                flags: (flags - gated) | (flags & allowed) | no_exec,
            });
        }
        allowed &= entry.flags();
        no_exec |= entry.flags() & PageTableFlags::NO_EXECUTE;
        // SAFETY: as in `walk`.
        table = unsafe { table_mut(entry.frame()) };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::phys;
    use crate::memory::pmm::FreeList;

    fn pool(frames: usize) -> FreeList {
        let region = phys::reserve(frames);
        unsafe { FreeList::new(region.start, region.end) }
    }

    #[test]
    fn map_translate_unmap() {
        let frames = pool(16);
        let root = new_table(&frames).unwrap();
        let data = frames.allocate_frame().unwrap();
        let va = VirtAddr::new(0x40_0000);

        unsafe { map_page(root, va, data, PageTableFlags::USER_RW, &frames).unwrap() };
        let t = translate(root, va + 0x10).unwrap();
        assert_eq!(t.phys, data.start() + 0x10);
        assert!(t.flags.contains(PageTableFlags::USER | PageTableFlags::WRITABLE));

        assert_eq!(
            unsafe { map_page(root, va, data, PageTableFlags::USER_RW, &frames) },
            Err(MapError::AlreadyMapped)
        );
        assert_eq!(unsafe { unmap_page(root, va) }, Ok(data));
        assert!(translate(root, va).is_none());
        assert_eq!(unsafe { unmap_page(root, va) }, Err(UnmapError::NotMapped));
    }

    #[test]
    fn lower_half_tables_never_hide_user_pages() {
        let frames = pool(16);
        let root = new_table(&frames).unwrap();
        let guard = frames.allocate_frame().unwrap();
        let data = frames.allocate_frame().unwrap();
        let kernel_only = PageTableFlags::USER_RW - PageTableFlags::USER;

        // A supervisor page first, then a user page under the same tables.
        unsafe { map_page(root, VirtAddr::zero(), guard, kernel_only, &frames).unwrap() };
        unsafe { map_page(root, VirtAddr::new(0x1000), data, PageTableFlags::USER_RW, &frames).unwrap() };

        let upper = unsafe { table_mut(root) }[0].flags();
        assert!(upper.contains(PageTableFlags::TABLE_USER));
        let t = translate(root, VirtAddr::new(0x1000)).unwrap();
        assert!(t.flags.contains(PageTableFlags::USER | PageTableFlags::WRITABLE));
        assert!(!translate(root, VirtAddr::zero()).unwrap().flags.contains(PageTableFlags::USER));
    }

    #[test]
    fn translate_combines_every_level() {
        let frames = pool(16);
        let root = new_table(&frames).unwrap();
        let data = frames.allocate_frame().unwrap();
        let va = VirtAddr::new(0x20_0000);
        unsafe { map_page(root, va, data, PageTableFlags::USER_RW, &frames).unwrap() };

        let upper = unsafe { table_mut(root) }[0].flags();
        let set_upper = |flags: PageTableFlags| unsafe { table_mut(root) }[0].set_flags(flags);
        set_upper(upper - PageTableFlags::USER);
        assert!(!translate(root, va).unwrap().flags.contains(PageTableFlags::USER));

        set_upper(upper | PageTableFlags::NO_EXECUTE);
        let t = translate(root, va).unwrap();
        assert!(t.flags.contains(PageTableFlags::USER | PageTableFlags::NO_EXECUTE));

        // Mapping through the entry again restores user access on the path.
        set_upper(upper - PageTableFlags::USER);
        let next = frames.allocate_frame().unwrap();
        unsafe { map_page(root, va + 0x1000, next, PageTableFlags::USER_RW, &frames).unwrap() };
        assert!(translate(root, va).unwrap().flags.contains(PageTableFlags::USER));
    }

    #[test]
    fn walk_reports_missing_span() {
        let frames = pool(8);
        let root = new_table(&frames).unwrap();
        match unsafe { lookup(root, VirtAddr::new(0x1000)) } {
            Walk::Missing { span } => assert_eq!(span, 1 << 39),
            _ => panic!("expected the root slot to be empty"),
        }
    }

    #[test]
    fn huge_pages_translate_with_offset() {
        let frames = pool(8);
        let root = new_table(&frames).unwrap();
        let va = VirtAddr::new(0xFFFF_8000_0020_0000);
        unsafe {
            map_huge_page(root, va, PhysAddr::new(0x40_0000), PageTableFlags::KERNEL_DATA, &frames)
                .unwrap()
        };
        let t = translate(root, va + 0x1234).unwrap();
        assert_eq!(t.phys, PhysAddr::new(0x40_1234));
        assert!(matches!(unsafe { lookup(root, va) }, Walk::Huge));
    }

    #[test]
    fn table_allocation_failure_is_reported() {
        let frames = pool(1);
        let root = new_table(&frames).unwrap();
        let data = PhysFrame::from_start(PhysAddr::new(0x1000));
        assert_eq!(
            unsafe { map_page(root, VirtAddr::new(0), data, PageTableFlags::USER_RW, &frames) },
            Err(MapError::OutOfMemory)
        );
    }
}
