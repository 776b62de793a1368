//! Description of the boot image handed over by the bootloader.
//!
//! The image is a flat blob in physical memory containing the initial user
//! programs. Each program names its entry point and the segments to map from
//! the blob into its fresh address space. Programs flagged as idle are
//! instantiated once per CPU instead of once overall; the scheduler falls
//! back to a CPU's idle process when nothing else is ready.

use kmem::addr::{PhysAddr, VirtAddr};

bitflags! {
    pub struct BootProgFlags: u16 {
        /// One instance per CPU, run only when that CPU has nothing else.
        const IDLE = 1 << 1;
    }
}

/// A loadable segment of a boot program, relative to the image blob.
#[derive(Copy, Clone, Debug)]
pub struct BootSegment {
    /// Where the segment lives in the program's address space.
    pub virt_base: VirtAddr,
    /// Size of the segment in bytes.
    pub size: usize,
    /// Offset of the segment data within the image blob.
    pub offset: usize,
}

/// One program inside the boot image.
#[derive(Copy, Clone, Debug)]
pub struct BootProgram<'a> {
    /// Path the program was packed from, for diagnostics only.
    pub path: &'a str,
    /// Virtual address execution starts at.
    pub entry: VirtAddr,
    pub flags: BootProgFlags,
    pub segments: &'a [BootSegment],
}

/// The boot image: the physical location of the blob plus its table of
/// contents.
#[derive(Copy, Clone)]
pub struct BootImage<'a> {
    pub base: PhysAddr,
    pub programs: &'a [BootProgram<'a>],
}
