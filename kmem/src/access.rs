//! Access to raw physical memory.
//!
//! The allocator and the page table code need to read and write physical
//! frames that do not necessarily have a permanent virtual mapping yet. All
//! of that goes through [`PhysAccess`], which answers one question: through
//! which pointer can a given physical address be dereferenced right now.
//!
//! On the running kernel this is the identity mapping of the kernel image
//! region. Hosted tests implement it with a plain memory buffer standing in
//! for physical RAM.

use core::ptr;

use crate::addr::{PhysAddr, VirtAddr};

/// Translation from physical addresses to dereferencable pointers.
///
/// # Safety
///
/// Implementations must return pointers that are valid for reads and writes
/// of at least a whole page starting at the translated address, and distinct
/// physical addresses must not alias.
pub unsafe trait PhysAccess {
    /// Pointer through which `paddr` can be accessed.
    fn phys_ptr(&self, paddr: PhysAddr) -> *mut u8;

    /// Invalidate the translation cache entry covering `vaddr`.
    ///
    /// The default is a no-op, which is correct for any implementation that
    /// is not backed by a hardware TLB.
    fn invalidate_page(&self, _vaddr: VirtAddr) {}

    /// Invalidate all translation cache entries.
    fn invalidate_all(&self) {}

    /// Read a value from physical memory.
    unsafe fn read<T: Copy>(&self, paddr: PhysAddr) -> T {
        (self.phys_ptr(paddr) as *const T).read_unaligned()
    }

    /// Write a value to physical memory.
    unsafe fn write<T: Copy>(&self, paddr: PhysAddr, value: T) {
        (self.phys_ptr(paddr) as *mut T).write_unaligned(value)
    }

    /// Fill `len` bytes of physical memory with zeroes.
    unsafe fn fill_zero(&self, paddr: PhysAddr, len: usize) {
        ptr::write_bytes(self.phys_ptr(paddr), 0, len);
    }
}

/// The identity view used while the kernel runs with its image and tables
/// identity-mapped: a physical address is a valid pointer as-is.
pub struct Identity;

unsafe impl PhysAccess for Identity {
    fn phys_ptr(&self, paddr: PhysAddr) -> *mut u8 {
        paddr.0 as *mut u8
    }
}

/// A linear window placing the physical range `base .. base + size` at an
/// arbitrary virtual location, such as a buffer standing in for RAM in
/// hosted tests.
pub struct Window {
    virtual_base: *mut u8,
    physical_base: PhysAddr,
    size: usize,
}

impl Window {
    /// Create a window of `size` bytes backed by the memory at `virtual_base`.
    ///
    /// # Safety
    ///
    /// `virtual_base` must be valid for reads and writes of `size` bytes for
    /// the lifetime of the window.
    pub unsafe fn new(virtual_base: *mut u8, physical_base: PhysAddr, size: usize) -> Window {
        Window {
            virtual_base,
            physical_base,
            size,
        }
    }

    pub fn contains(&self, paddr: PhysAddr) -> bool {
        paddr >= self.physical_base && paddr - self.physical_base < self.size
    }
}

unsafe impl PhysAccess for Window {
    fn phys_ptr(&self, paddr: PhysAddr) -> *mut u8 {
        if !self.contains(paddr) {
            panic!("physical address {:#x} outside of window", paddr);
        }
        unsafe { self.virtual_base.add(paddr - self.physical_base) }
    }
}
