//! Physical page frame accounting.
//!
//! All of physical memory is tracked by a bitmap with one bit per page
//! frame, indexed by `physical_address >> PAGE_ALIGN_BITS`. A set bit means
//! the frame is in use. Allocation is linear first-fit over the bitmap and
//! hands out the lowest suitable run of contiguous free frames.
//!
//! The bitmap itself lives in physical memory chosen by the caller (the
//! kernel places it right after its own image), so the bookkeeping works
//! before any other allocator exists.

use core::cmp;
use core::ptr;

use spinlock::Mutex;

use crate::addr::{Alignable, PhysAddr};
use crate::{PAGE_ALIGN_BITS, PAGE_SIZE};

/// Errors reported by the frame allocator.
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum AllocError {
    /// No run of contiguous free frames of the requested size exists.
    NoMemory,
}

/// The frame bitmap plus its usage counters.
///
/// Raw bitmap manipulation lives here; all public access goes through
/// [`FrameAllocator`], which serializes every operation with a spinlock.
pub struct FrameBitmap {
    map: *mut u8,
    total_bytes: usize,
    avail_bytes: usize,
}

impl FrameBitmap {
    /// Required number of bytes for holding the bitmap for `total_memory`
    /// bytes of physical memory.
    pub fn required_size_bytes(total_memory: usize) -> usize {
        total_memory / PAGE_SIZE / 8
    }

    /// Create a bitmap at the given location, marking all frames free.
    ///
    /// # Safety
    ///
    /// `map` must be valid for reads and writes of
    /// `required_size_bytes(total_memory)` bytes for the lifetime of the
    /// bitmap, and must not overlap memory the allocator will hand out
    /// unless the caller immediately marks that region used.
    pub unsafe fn from_addr(map: *mut u8, total_memory: usize) -> FrameBitmap {
        ptr::write_bytes(map, 0, Self::required_size_bytes(total_memory));
        FrameBitmap {
            map,
            total_bytes: total_memory,
            avail_bytes: total_memory,
        }
    }

    fn is_marked(&self, paddr: PhysAddr) -> bool {
        let frame = paddr.0 >> PAGE_ALIGN_BITS;
        let byte = unsafe { *self.map.add(frame / 8) };
        byte & (1 << (frame % 8)) != 0
    }

    fn set_mark(&mut self, paddr: PhysAddr, marked: bool) {
        let frame = paddr.0 >> PAGE_ALIGN_BITS;
        let byte = unsafe { &mut *self.map.add(frame / 8) };
        let bit = 1 << (frame % 8);

        // Only move the counters when the bit actually changes, so that the
        // popcount of the bitmap always equals (total - avail) / PAGE_SIZE.
        if marked && *byte & bit == 0 {
            *byte |= bit;
            self.avail_bytes -= PAGE_SIZE;
        } else if !marked && *byte & bit != 0 {
            *byte &= !bit;
            self.avail_bytes += PAGE_SIZE;
        }
    }

    /// First-fit search for a free run of at least `size` bytes, starting at
    /// `base` rounded down to a page boundary.
    pub fn alloc_from(&mut self, base: PhysAddr, size: usize) -> Result<PhysAddr, AllocError> {
        let needed = cmp::max(1, size.align_up(PAGE_SIZE) >> PAGE_ALIGN_BITS);
        let mut from = PhysAddr(0);
        let mut count = 0;

        let mut at = base.align_down(PAGE_SIZE);
        while at.0 < self.total_bytes {
            if self.is_marked(at) {
                // any gap resets the run
                count = 0;
            } else {
                if count == 0 {
                    from = at;
                }
                count += 1;

                if count == needed {
                    let mut page = from;
                    while page <= at {
                        self.set_mark(page, true);
                        page += PAGE_SIZE;
                    }
                    return Ok(from);
                }
            }
            at += PAGE_SIZE;
        }
        Err(AllocError::NoMemory)
    }

    /// Clear the mark for the page containing `paddr`.
    ///
    /// The bitmap does not record who allocated a frame; freeing a frame that
    /// is still referenced elsewhere corrupts memory. Caller contract.
    pub fn free(&mut self, paddr: PhysAddr) {
        self.set_mark(paddr.align_down(PAGE_SIZE), false);
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn avail_bytes(&self) -> usize {
        self.avail_bytes
    }

    /// Actual popcount of the bitmap, in frames.
    pub fn marked_frames(&self) -> usize {
        let len = Self::required_size_bytes(self.total_bytes);
        (0..len)
            .map(|i| unsafe { *self.map.add(i) }.count_ones() as usize)
            .sum()
    }
}

/// The physical frame allocator: the bitmap behind its spinlock.
///
/// Every mutating operation takes the lock; there is no lock-free fast path.
pub struct FrameAllocator {
    inner: Mutex<FrameBitmap>,
}

impl FrameAllocator {
    /// Set up the allocator with a fresh bitmap at `map`.
    ///
    /// # Safety
    ///
    /// See [`FrameBitmap::from_addr`].
    pub unsafe fn from_addr(map: *mut u8, total_memory: usize) -> FrameAllocator {
        FrameAllocator {
            inner: Mutex::new(FrameBitmap::from_addr(map, total_memory)),
        }
    }

    /// Allocate the lowest free run of at least `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<PhysAddr, AllocError> {
        self.alloc_from(PhysAddr(0), size)
    }

    /// Allocate the lowest free run of at least `size` bytes at or above `base`.
    pub fn alloc_from(&self, base: PhysAddr, size: usize) -> Result<PhysAddr, AllocError> {
        self.inner.with_lock(|map| map.alloc_from(base, size))
    }

    /// Free the single page containing `paddr`.
    pub fn free(&self, paddr: PhysAddr) {
        self.inner.with_lock(|map| map.free(paddr));
    }

    /// Free `size` bytes worth of pages starting at `base`.
    pub fn free_range(&self, base: PhysAddr, size: usize) {
        self.inner.with_lock(|map| {
            let mut page = base.align_down(PAGE_SIZE);
            let end = base + size;
            while page < end {
                map.free(page);
                page += PAGE_SIZE;
            }
        });
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.with_lock(|map| map.total_bytes())
    }

    pub fn avail_bytes(&self) -> usize {
        self.inner.with_lock(|map| map.avail_bytes())
    }

    /// Number of frames currently marked used.
    pub fn used_frames(&self) -> usize {
        self.inner.with_lock(|map| map.marked_frames())
    }
}
