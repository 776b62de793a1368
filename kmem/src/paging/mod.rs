//! This module provides functionality for manipulating the two-level page
//! tables: a directory of 1024 entries, each pointing to a table of 1024
//! entries, each mapping one 4 KiB page.
//!
//! Two directory slots are reserved by convention. The self-map slot makes
//! the running CPU's own directory addressable at a fixed virtual address.
//! The remote slot is used to graft a *different* process's directory into
//! the current address space so its tables can be edited without switching
//! address spaces; see [`Mapper::map_remote_dir`].

use core::cell::Cell;

use crate::access::PhysAccess;
use crate::addr::{Alignable, PhysAddr, VirtAddr};
use crate::physical::{AllocError, FrameAllocator};
use crate::{PAGE_ALIGN_BITS, PAGE_SIZE};

/// Size of a page table, one page.
pub const TAB_SIZE: usize = PAGE_SIZE;

/// Size of a page directory, one page.
pub const DIR_SIZE: usize = PAGE_SIZE;

/// Page directory entry bit shift.
pub const DIR_SHIFT: u32 = 22;

/// Number of entries in a directory or table.
pub const ENTRY_COUNT: usize = 1024;

/// Virtual address at which each directory maps itself.
pub const DIR_VADDR: VirtAddr = VirtAddr(4 * 1024 * 1024);

/// Virtual address of the remote directory graft slot.
pub const RDIR_VADDR: VirtAddr = VirtAddr(8 * 1024 * 1024);

/// Scratch window for temporary mappings of raw physical memory.
pub const TMP_VADDR: VirtAddr = VirtAddr(12 * 1024 * 1024);
pub const TMP_VADDR_END: VirtAddr = VirtAddr(16 * 1024 * 1024);

/// Virtual (and, by identity mapping, physical) base of the kernel image.
pub const KERN_VADDR: VirtAddr = VirtAddr(16 * 1024 * 1024);

/// Per-process kernel stack mapping.
pub const KERN_STACK: VirtAddr = VirtAddr(0xbfff_0000);

/// Per-process user stack mapping.
pub const USER_STACK: VirtAddr = VirtAddr(0xbffc_0000);

bitflags! {
    /// Page entry flags. A flags word is composed with bitwise OR; there is
    /// no validation of conflicting combinations.
    pub struct PageFlags: u32 {
        /// Page is present.
        const PRESENT  = 1 << 0;
        /// Page is writable.
        const WRITABLE = 1 << 1;
        /// Page is accessible by unprivileged userland processes.
        const USER     = 1 << 2;
        /// Pinned pages are never released back to the frame allocator.
        const PINNED   = 1 << 9;
    }
}

/// A single directory or table entry: a frame address plus flag bits.
#[repr(transparent)]
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct Entry(u32);

assert_eq_size!(entry_is_a_word; Entry, u32);

impl Entry {
    pub const EMPTY: Entry = Entry(0);

    const ADDR_MASK: u32 = 0xffff_f000;

    pub fn new(paddr: PhysAddr, flags: PageFlags) -> Entry {
        debug_assert!(paddr.0 as u64 >> 32 == 0, "entry addresses are 32 bit");
        Entry((paddr.0 as u32 & Self::ADDR_MASK) | flags.bits())
    }

    pub fn address(self) -> PhysAddr {
        PhysAddr((self.0 & Self::ADDR_MASK) as usize)
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & !Self::ADDR_MASK)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }
}

/// Entry inside a page directory that covers the given virtual address.
pub fn dir_index(vaddr: VirtAddr) -> usize {
    (vaddr.0 >> DIR_SHIFT) & (ENTRY_COUNT - 1)
}

/// Entry inside a page table that covers the given virtual address.
pub fn tab_index(vaddr: VirtAddr) -> usize {
    (vaddr.0 >> PAGE_ALIGN_BITS) & (ENTRY_COUNT - 1)
}

fn entry_at<M: PhysAccess>(mem: &M, table: PhysAddr, index: usize) -> Entry {
    debug_assert!(index < ENTRY_COUNT);
    unsafe { mem.read(table + index * core::mem::size_of::<Entry>()) }
}

fn set_entry<M: PhysAccess>(mem: &M, table: PhysAddr, index: usize, entry: Entry) {
    debug_assert!(index < ENTRY_COUNT);
    unsafe { mem.write(table + index * core::mem::size_of::<Entry>(), entry) }
}

/// Errors reported by mapping operations.
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum MapError {
    /// There is no memory left for allocating new page tables.
    OutOfMemory,
    /// The temporary mapping window has no free run of the requested size.
    WindowExhausted,
}

impl From<AllocError> for MapError {
    fn from(e: AllocError) -> MapError {
        match e {
            AllocError::NoMemory => MapError::OutOfMemory,
        }
    }
}

/// Page table manipulation for the executing CPU.
///
/// Each CPU owns one `Mapper`, anchored at that CPU's page directory. All
/// operations on *other* address spaces go through the remote directory
/// graft, of which at most one may be active per CPU.
pub struct Mapper<'m, M: PhysAccess> {
    mem: &'m M,
    dir: PhysAddr,
    kernel_size: usize,
    mmio_page: PhysAddr,
    remote_active: Cell<bool>,
}

impl<'m, M: PhysAccess> Mapper<'m, M> {
    /// Allocate and prepare the page directory for the executing CPU.
    ///
    /// Identity-maps the kernel image (`KERN_VADDR .. + kernel_size`), the
    /// interrupt controller page and this CPU's boot stack, and installs the
    /// directory self-map. The caller is responsible for actually loading
    /// the directory (enabling paging) on the CPU afterwards.
    pub fn new(
        mem: &'m M,
        frames: &FrameAllocator,
        kernel_size: usize,
        mmio_page: PhysAddr,
        boot_stack: PhysAddr,
        stack_size: usize,
    ) -> Result<Mapper<'m, M>, MapError> {
        let dir = frames.alloc(DIR_SIZE)?;
        unsafe { mem.fill_zero(dir, DIR_SIZE) };

        let mapper = Mapper {
            mem,
            dir,
            kernel_size,
            mmio_page,
            remote_active: Cell::new(false),
        };

        let rw = PageFlags::PRESENT | PageFlags::WRITABLE;
        mapper.map_in(dir, KERN_VADDR, PhysAddr(KERN_VADDR.0), kernel_size, rw, frames)?;
        mapper.map_in(dir, VirtAddr(mmio_page.0), mmio_page, PAGE_SIZE, rw, frames)?;
        mapper.map_in(dir, VirtAddr(boot_stack.0), boot_stack, stack_size, rw, frames)?;
        set_entry(mem, dir, dir_index(DIR_VADDR), Entry::new(dir, rw));

        trace!("[VMM] directory {:#x} prepared for local CPU", dir);
        Ok(mapper)
    }

    /// Physical address of this CPU's page directory.
    pub fn directory(&self) -> PhysAddr {
        self.dir
    }

    /// Map `size` bytes at `vaddr` to the physical range starting at `paddr`
    /// in the local address space.
    ///
    /// Page tables are allocated on demand. Both addresses are masked to
    /// page boundaries before any computation, and the translation cache is
    /// invalidated for every page touched.
    pub fn map(
        &self,
        frames: &FrameAllocator,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.map_in(self.dir, vaddr, paddr, size, flags, frames)
    }

    /// Unmap `size` bytes at `vaddr`: mapping to the zero frame with empty
    /// flags clears the entries.
    pub fn unmap(&self, frames: &FrameAllocator, vaddr: VirtAddr, size: usize) {
        // clearing a range whose table was never allocated allocates one
        // just to hold the empty entries; if even that fails, the range is
        // unmapped either way
        let _ = self.map(frames, vaddr, PhysAddr(0), size, PageFlags::empty());
    }

    /// Software page walk through the local directory.
    pub fn resolve(&self, vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        resolve_in(self.mem, self.dir, vaddr)
    }

    /// Map `size` bytes of raw physical memory into the first sufficiently
    /// large free run of the scratch window and return its virtual address.
    ///
    /// Used whenever the kernel must touch physical memory that has no
    /// permanent mapping yet. The caller must [`Mapper::temp_unmap`] the
    /// range when done; nothing is reclaimed automatically.
    pub fn temp_map(
        &self,
        frames: &FrameAllocator,
        paddr: PhysAddr,
        size: usize,
    ) -> Result<VirtAddr, MapError> {
        let needed = core::cmp::max(1, size.align_up(PAGE_SIZE) >> PAGE_ALIGN_BITS);
        let mut run_start = TMP_VADDR;
        let mut run_len = 0;

        let mut at = TMP_VADDR;
        while at < TMP_VADDR_END {
            if resolve_in(self.mem, self.dir, at).is_some() {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = at;
                }
                run_len += 1;

                if run_len == needed {
                    let rw = PageFlags::PRESENT | PageFlags::WRITABLE;
                    self.map(frames, run_start, paddr, size, rw)?;
                    return Ok(run_start);
                }
            }
            at += PAGE_SIZE;
        }
        Err(MapError::WindowExhausted)
    }

    /// Release a temporary mapping obtained from [`Mapper::temp_map`].
    pub fn temp_unmap(&self, frames: &FrameAllocator, vaddr: VirtAddr, size: usize) {
        self.unmap(frames, vaddr, size);
    }

    /// Graft another process's page directory into the reserved remote slot
    /// of the local directory, so that its tables can be edited without
    /// switching address spaces.
    ///
    /// The graft is undone when the returned guard is dropped. At most one
    /// graft may be active per CPU; attempting to nest grafts panics.
    pub fn map_remote_dir(&self, remote: PhysAddr) -> RemoteDir<'_, 'm, M> {
        assert!(
            !self.remote_active.get(),
            "remote directory already grafted"
        );
        self.remote_active.set(true);
        set_entry(
            self.mem,
            self.dir,
            dir_index(RDIR_VADDR),
            Entry::new(remote, PageFlags::PRESENT | PageFlags::WRITABLE),
        );
        self.mem.invalidate_all();
        RemoteDir { mapper: self, dir: remote }
    }

    /// Prepare a brand-new process's page directory.
    ///
    /// The fresh directory at `dir` is temporarily mapped, cleared and
    /// self-mapped, then grafted remotely to install the pinned kernel and
    /// interrupt controller mappings and the process's private stacks.
    pub fn setup_process(
        &self,
        frames: &FrameAllocator,
        dir: PhysAddr,
        kern_stack: PhysAddr,
        user_stack: PhysAddr,
        stack_size: usize,
    ) -> Result<(), MapError> {
        let rw = PageFlags::PRESENT | PageFlags::WRITABLE;

        // the directory has no mapping anywhere yet, reach it through the
        // scratch window
        let tmp = self.temp_map(frames, dir, DIR_SIZE)?;
        let (dir_phys, _) = self.resolve(tmp).expect("scratch window mapping vanished");
        debug_assert_eq!(dir_phys, dir);
        unsafe { self.mem.fill_zero(dir_phys, DIR_SIZE) };
        set_entry(self.mem, dir, dir_index(DIR_VADDR), Entry::new(dir, rw));
        self.temp_unmap(frames, tmp, DIR_SIZE);

        let pinned = rw | PageFlags::PINNED;
        let remote = self.map_remote_dir(dir);
        remote.map(frames, KERN_VADDR, PhysAddr(KERN_VADDR.0), self.kernel_size, pinned)?;
        remote.map(
            frames,
            VirtAddr(self.mmio_page.0),
            self.mmio_page,
            PAGE_SIZE,
            pinned,
        )?;
        remote.map(frames, KERN_STACK, kern_stack, stack_size, rw)?;
        remote.map(
            frames,
            USER_STACK,
            user_stack,
            stack_size,
            rw | PageFlags::USER,
        )?;
        Ok(())
    }

    fn map_in(
        &self,
        dir: PhysAddr,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: usize,
        flags: PageFlags,
        frames: &FrameAllocator,
    ) -> Result<(), MapError> {
        let vaddr = vaddr.align_down(PAGE_SIZE);
        let paddr = paddr.align_down(PAGE_SIZE);
        let size = size.align_up(PAGE_SIZE);

        let mut offset = 0;
        while offset < size {
            let page = vaddr + offset;

            let dirent = entry_at(self.mem, dir, dir_index(page));
            let tab = if dirent.is_present() {
                dirent.address()
            } else {
                let tab = frames.alloc(TAB_SIZE)?;
                unsafe { self.mem.fill_zero(tab, TAB_SIZE) };
                set_entry(
                    self.mem,
                    dir,
                    dir_index(page),
                    Entry::new(tab, PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER),
                );
                tab
            };

            set_entry(self.mem, tab, tab_index(page), Entry::new(paddr + offset, flags));
            self.mem.invalidate_page(page);
            offset += PAGE_SIZE;
        }
        Ok(())
    }
}

fn resolve_in<M: PhysAccess>(mem: &M, dir: PhysAddr, vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    let vaddr = vaddr.align_down(PAGE_SIZE);
    let dirent = entry_at(mem, dir, dir_index(vaddr));
    if !dirent.is_present() {
        return None;
    }
    let entry = entry_at(mem, dirent.address(), tab_index(vaddr));
    if !entry.is_present() {
        return None;
    }
    Some((entry.address(), entry.flags()))
}

/// A scoped graft of another process's page directory.
///
/// While the guard lives, the target's directory and tables can be read and
/// written as ordinary memory. Dropping the guard clears the remote slot and
/// flushes the translation caches unconditionally.
pub struct RemoteDir<'a, 'm, M: PhysAccess> {
    mapper: &'a Mapper<'m, M>,
    dir: PhysAddr,
}

impl<'a, 'm, M: PhysAccess> RemoteDir<'a, 'm, M> {
    /// Physical address of the grafted directory.
    pub fn directory(&self) -> PhysAddr {
        self.dir
    }

    /// Map a range in the grafted address space. Same contract as
    /// [`Mapper::map`].
    pub fn map(
        &self,
        frames: &FrameAllocator,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: usize,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.mapper.map_in(self.dir, vaddr, paddr, size, flags, frames)
    }

    /// Unmap a range in the grafted address space.
    pub fn unmap(&self, frames: &FrameAllocator, vaddr: VirtAddr, size: usize) {
        let _ = self.map(frames, vaddr, PhysAddr(0), size, PageFlags::empty());
    }

    /// Software page walk through the grafted directory.
    pub fn resolve(&self, vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        resolve_in(self.mapper.mem, self.dir, vaddr)
    }

    /// Free every non-pinned frame reachable from the grafted directory,
    /// then the page tables themselves, then the directory frame.
    ///
    /// Pinned entries (the kernel image and the interrupt controller page)
    /// reference shared frames and are skipped; the tables holding them are
    /// still private to this directory and are freed.
    pub fn release(&self, frames: &FrameAllocator) {
        let mem = self.mapper.mem;
        let self_slot = dir_index(DIR_VADDR);
        let remote_slot = dir_index(RDIR_VADDR);

        for i in 0..ENTRY_COUNT {
            if i == self_slot || i == remote_slot {
                continue;
            }
            let dirent = entry_at(mem, self.dir, i);
            if !dirent.is_present() {
                continue;
            }
            let tab = dirent.address();
            if !dirent.flags().contains(PageFlags::PINNED) {
                for j in 0..ENTRY_COUNT {
                    let entry = entry_at(mem, tab, j);
                    if entry.is_present() && !entry.flags().contains(PageFlags::PINNED) {
                        frames.free(entry.address());
                    }
                }
            }
            frames.free(tab);
        }
        frames.free(self.dir);
    }
}

impl<'a, 'm, M: PhysAccess> Drop for RemoteDir<'a, 'm, M> {
    fn drop(&mut self) {
        set_entry(
            self.mapper.mem,
            self.mapper.dir,
            dir_index(RDIR_VADDR),
            Entry::EMPTY,
        );
        self.mapper.mem.invalidate_all();
        self.mapper.remote_active.set(false);
    }
}
