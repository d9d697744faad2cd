// =============================================================================
// mpkernel — Address Newtypes
// =============================================================================
//
// Physical addresses, virtual addresses and physical frames are distinct
// types. Page tables store `PhysAddr`, user copies walk `VirtAddr`, and the
// frame allocator hands out `PhysFrame`; crossing between them takes an
// explicit call.
//
// Virtual layout, 4-level paging:
//   0x0000_0000_0000_0000 ..  0x0000_8000_0000_0000   per-process (user)
//   0xFFFF_8000_0000_0000 ..= 0xFFFF_FFFF_FFFF_FFFF   shared kernel half
//
// All of RAM is visible to the kernel at one fixed offset, the direct map.
// Page-table frames and user frames are both edited through it. Bare metal
// learns the offset from the boot loader; the hosted machine uses the base
// of its RAM arena.
//
// =============================================================================

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

pub const PAGE_SIZE: u64 = 4096;

/// A large page: what one level-1 entry maps.
pub const HUGE_PAGE_SIZE: u64 = 512 * PAGE_SIZE;

const OFFSET_MASK: u64 = PAGE_SIZE - 1;
const PHYS_LIMIT_MASK: u64 = !((1 << 52) - 1);
const KERNEL_HALF: u64 = 0xFFFF_8000_0000_0000;

static DIRECT_MAP: AtomicU64 = AtomicU64::new(0);

/// Set where physical memory appears in the kernel half. Boot calls this
/// once; setting the same value again is harmless.
pub fn init_hhdm(offset: u64) {
    let prev = DIRECT_MAP.swap(offset, Ordering::AcqRel);
    debug_assert!(prev == 0 || prev == offset, "direct map moved from {:#x}", prev);
}

#[inline]
pub fn hhdm_offset() -> u64 {
    let offset = DIRECT_MAP.load(Ordering::Acquire);
    debug_assert!(offset != 0, "direct map used before init_hhdm");
    offset
}

#[inline]
pub const fn page_round_up(value: u64) -> u64 {
    (value + OFFSET_MASK) & !OFFSET_MASK
}

#[inline]
pub const fn page_round_down(value: u64) -> u64 {
    value & !OFFSET_MASK
}

/// Arithmetic and formatting shared by both address kinds.
macro_rules! address_common {
    ($ty:ident, $tag:literal, $width:literal) => {
        impl $ty {
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            #[inline]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            pub const fn is_zero(self) -> bool {
                self.0 == 0
            }

            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.0 & OFFSET_MASK == 0
            }

            #[inline]
            pub const fn page_align_down(self) -> Self {
                Self(page_round_down(self.0))
            }

            #[inline]
            pub const fn page_align_up(self) -> Self {
                Self(page_round_up(self.0))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "{:#0", $width, "x}"), self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }

        impl core::ops::Add<u64> for $ty {
            type Output = Self;
            fn add(self, bytes: u64) -> Self {
                Self::new(self.0 + bytes)
            }
        }

        impl core::ops::Sub<u64> for $ty {
            type Output = Self;
            fn sub(self, bytes: u64) -> Self {
                Self::new(self.0 - bytes)
            }
        }

        /// Distance in bytes.
        impl core::ops::Sub for $ty {
            type Output = u64;
            fn sub(self, lower: Self) -> u64 {
                self.0 - lower.0
            }
        }
    };
}

/// A physical address. Never dereferenced as is; see [`PhysAddr::to_virt`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        debug_assert!(addr & PHYS_LIMIT_MASK == 0, "physical address wider than 52 bits");
        Self(addr)
    }

    /// The kernel's view of this address through the direct map.
    #[inline]
    pub fn to_virt(self) -> VirtAddr {
        VirtAddr::new(self.0 + hhdm_offset())
    }
}

address_common!(PhysAddr, "pa:", 10);

/// A canonical virtual address: bits 48 and up repeat bit 47.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        debug_assert!(((addr << 16) as i64 >> 16) as u64 == addr, "non-canonical virtual address");
        Self(addr)
    }

    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_HALF
    }

    /// The slot this address selects in the table at `level`, with level 0
    /// being the leaf table and level 3 the root.
    #[inline]
    pub const fn table_index(self, level: usize) -> usize {
        ((self.0 >> (12 + 9 * level)) & 0x1FF) as usize
    }

    /// All four table slots, leaf first.
    #[inline]
    pub const fn page_table_indices(self) -> [usize; 4] {
        [self.table_index(0), self.table_index(1), self.table_index(2), self.table_index(3)]
    }

    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }
}

address_common!(VirtAddr, "va:", 18);

/// One 4 KiB frame of RAM, as the allocator hands it out and a leaf entry
/// names it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysFrame(PhysAddr);

impl PhysFrame {
    /// Panics if `start` is not page aligned.
    #[inline]
    pub fn from_start(start: PhysAddr) -> Self {
        assert!(start.is_page_aligned(), "frame start {} is unaligned", start);
        Self(start)
    }

    #[inline]
    pub const fn containing(addr: PhysAddr) -> Self {
        Self(addr.page_align_down())
    }

    #[inline]
    pub const fn start(self) -> PhysAddr {
        self.0
    }

    #[inline]
    pub const fn number(self) -> u64 {
        self.0.as_u64() / PAGE_SIZE
    }

    #[inline]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0.to_virt().as_mut_ptr()
    }

    /// # Safety
    /// The caller owns the frame and it lies inside the direct map.
    pub unsafe fn fill(self, byte: u8) {
        // SAFETY: the whole frame is ours to write.
        unsafe { core::ptr::write_bytes(self.as_mut_ptr::<u8>(), byte, PAGE_SIZE as usize) };
    }

    /// # Safety
    /// The caller owns the frame for `'a` and holds no other reference into
    /// it.
    pub unsafe fn bytes_mut<'a>(self) -> &'a mut [u8] {
        // SAFETY: exclusive ownership for 'a, by the contract above.
        unsafe { core::slice::from_raw_parts_mut(self.as_mut_ptr::<u8>(), PAGE_SIZE as usize) }
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.number())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_up(0), 0);
        assert_eq!(page_round_up(1), PAGE_SIZE);
        assert_eq!(page_round_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_round_down(PAGE_SIZE + 7), PAGE_SIZE);
        assert_eq!(PhysAddr::new(0x1234).page_align_down(), PhysAddr::new(0x1000));
        assert_eq!(PhysAddr::new(0x1001).page_align_up(), PhysAddr::new(0x2000));
    }

    #[test]
    fn indices_split_each_level() {
        let va = VirtAddr::new((3 << 39) | (5 << 30) | (7 << 21) | (9 << 12) | 0x42);
        assert_eq!(va.page_table_indices(), [9, 7, 5, 3]);
        assert_eq!(va.table_index(2), 5);
        assert_eq!(va.page_offset(), 0x42);
        assert!(!va.is_kernel());
        assert!(VirtAddr::new(KERNEL_HALF).is_kernel());
    }

    #[test]
    fn frames() {
        let f = PhysFrame::containing(PhysAddr::new(0x5123));
        assert_eq!(f.start(), PhysAddr::new(0x5000));
        assert_eq!(f.number(), 5);
        assert_eq!(VirtAddr::new(0x3000) - VirtAddr::new(0x1000), 0x2000);
    }

    #[test]
    #[should_panic]
    fn unaligned_frame_rejected() {
        let _ = PhysFrame::from_start(PhysAddr::new(0x5001));
    }
}
