//! Physical frame allocation.
//!
//! The process core never owns physical memory; it borrows frames through
//! [`FrameAllocator`]. [`FreeList`] is the stock implementation: an
//! intrusive singly linked list threaded through the free frames
//! themselves, reached through the HHDM window.

use spin::Mutex;

use super::address::{PhysAddr, PhysFrame, PAGE_SIZE};

/// Byte written over every freed frame so stale readers see garbage
/// instead of the previous owner's data.
pub const JUNK: u8 = 0x01;

/// Source of 4 KiB physical frames.
///
/// Frames come back with unspecified contents; zero them if that matters.
pub trait FrameAllocator: Sync {
    fn allocate_frame(&self) -> Option<PhysFrame>;
    fn free_frame(&self, frame: PhysFrame);
}

/// Allocate one frame and clear it.
pub fn allocate_zeroed(frames: &dyn FrameAllocator) -> Option<PhysFrame> {
    let frame = frames.allocate_frame()?;
    // SAFETY: freshly allocated, so nobody else references it.
    unsafe { frame.fill(0) };
    Some(frame)
}

struct FreeListInner {
    /// Physical address of the first free frame, 0 when empty.
    head: u64,
    free: usize,
}

/// Free-list allocator over one contiguous physical range.
pub struct FreeList {
    start: PhysAddr,
    end: PhysAddr,
    inner: Mutex<FreeListInner>,
}

impl FreeList {
    /// Build a list holding every whole frame in `[start, end)`.
    ///
    /// # Safety
    /// The range must be RAM owned exclusively by this allocator and mapped
    /// through the HHDM window. Physical address 0 must not be part of it.
    pub unsafe fn new(start: PhysAddr, end: PhysAddr) -> Self {
        let start = start.page_align_up();
        let end = end.page_align_down();
        assert!(!start.is_zero(), "FreeList: frame 0 cannot be managed");
        let list = Self {
            start,
            end,
            inner: Mutex::new(FreeListInner { head: 0, free: 0 }),
        };
        let mut addr = start.as_u64();
        while addr + PAGE_SIZE <= end.as_u64() {
            list.free_frame(PhysFrame::from_start(PhysAddr::new(addr)));
            addr += PAGE_SIZE;
        }
        klog::debug!(
            "pmm: {} frames in [{}, {})",
            list.free_count(),
            list.start,
            list.end
        );
        list
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free
    }

    pub fn total_frames(&self) -> usize {
        ((self.end - self.start) / PAGE_SIZE) as usize
    }
}

impl FrameAllocator for FreeList {
    fn allocate_frame(&self) -> Option<PhysFrame> {
        let mut inner = self.inner.lock();
        if inner.head == 0 {
            return None;
        }
        let frame = PhysFrame::from_start(PhysAddr::new(inner.head));
        // SAFETY: every listed frame stores the next link in its first word.
        inner.head = unsafe { frame.as_mut_ptr::<u64>().read() };
        inner.free -= 1;
        Some(frame)
    }

    fn free_frame(&self, frame: PhysFrame) {
        let addr = frame.start();
        if addr < self.start || addr >= self.end {
            panic!("free_frame: {:?} outside {}..{}", frame, self.start, self.end);
        }
        // SAFETY: the caller gave the frame back, so we own it now.
        unsafe { frame.fill(JUNK) };
        let mut inner = self.inner.lock();
        // SAFETY: as above; the first word becomes the link.
        unsafe { frame.as_mut_ptr::<u64>().write(inner.head) };
        inner.head = addr.as_u64();
        inner.free += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::phys;

    #[test]
    fn freed_frames_are_junk_filled_and_reused() {
        let region = phys::reserve(4);
        let list = unsafe { FreeList::new(region.start, region.end) };
        assert_eq!(list.free_count(), 4);
        assert_eq!(list.total_frames(), 4);

        let a = list.allocate_frame().unwrap();
        unsafe { a.fill(0xAB) };
        list.free_frame(a);
        let bytes = unsafe { a.bytes_mut() };
        assert!(bytes[8..].iter().all(|&b| b == JUNK));

        let again = list.allocate_frame().unwrap();
        assert_eq!(again, a);
        let z = allocate_zeroed(&list).unwrap();
        assert!(unsafe { z.bytes_mut() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn exhaustion_returns_none() {
        let region = phys::reserve(2);
        let list = unsafe { FreeList::new(region.start, region.end) };
        assert!(list.allocate_frame().is_some());
        assert!(list.allocate_frame().is_some());
        assert!(list.allocate_frame().is_none());
    }

    #[test]
    #[should_panic(expected = "free_frame")]
    fn foreign_frame_is_fatal() {
        let region = phys::reserve(1);
        let list = unsafe { FreeList::new(region.start, region.end) };
        list.free_frame(PhysFrame::from_start(region.end));
    }
}
