//! Kernel bring-up.
//!
//! The bootstrap processor runs [`Kernel::bootstrap`] once: physical memory
//! accounting, processor discovery and its own address space. It then loads
//! the initial processes from the boot image with [`Kernel::populate`] and
//! releases the application processors with [`CpuTable::boot_all`]. Every
//! CPU, bootstrap or not, ends in [`Kernel::start_scheduling`], after which
//! the timer interrupt drives it.

use kmem::access::PhysAccess;
use kmem::addr::PhysAddr;
use kmem::paging::{Mapper, PageFlags, KERN_VADDR};
use kmem::physical::{AllocError, FrameAllocator, FrameBitmap};

use crate::bootimg::{BootImage, BootProgFlags, BootProgram};
use crate::platform::Platform;
use crate::process::{Pid, ProcTable};
use crate::smp::{CpuTable, LAPIC_BASE};
use crate::{KernelError, STACK_SIZE};

/// Set up physical frame accounting.
///
/// The bitmap is placed directly behind the kernel image. The first megabyte
/// (firmware structures, the AP trampoline) and the kernel image together
/// with the bitmap itself are marked used before anything else can allocate.
/// Returns the allocator and the size of the reserved kernel region.
pub fn phys_init<M: PhysAccess, P: Platform>(
    mem: &M,
    platform: &P,
    kernel_start: PhysAddr,
    kernel_end: PhysAddr,
) -> Result<(FrameAllocator, usize), AllocError> {
    let total = platform.total_memory();
    let bitmap_size = FrameBitmap::required_size_bytes(total);
    let frames = unsafe { FrameAllocator::from_addr(mem.phys_ptr(kernel_end), total) };
    let kernel_size = (kernel_end - kernel_start) + bitmap_size;

    frames.alloc_from(PhysAddr(0), 1 << 20)?;
    frames.alloc_from(kernel_start, kernel_size)?;

    info!(
        "[MEM] {} KiB total, {} KiB free, kernel occupies {} KiB",
        total / 1024,
        frames.avail_bytes() / 1024,
        kernel_size / 1024
    );
    Ok((frames, kernel_size))
}

/// The kernel core: all global state, tied to the physical memory view and
/// the platform it runs on.
pub struct Kernel<'a, M: PhysAccess, P: Platform> {
    mem: &'a M,
    platform: &'a P,
    pub frames: FrameAllocator,
    pub cpus: CpuTable,
    pub procs: ProcTable,
    kernel_size: usize,
}

impl<'a, M: PhysAccess, P: Platform> Kernel<'a, M, P> {
    /// One-time bring-up on the bootstrap processor.
    ///
    /// Initializes frame accounting, discovers the machine's processors and
    /// builds and loads this CPU's address space. The returned mapper is the
    /// handle to that address space; all process loading goes through it.
    pub fn bootstrap(
        mem: &'a M,
        platform: &'a P,
        kernel_start: PhysAddr,
        kernel_end: PhysAddr,
        boot_stack: PhysAddr,
    ) -> Result<(Kernel<'a, M, P>, Mapper<'a, M>), KernelError> {
        info!(
            "kestrel {} on CPU#{}",
            env!("CARGO_PKG_VERSION"),
            platform.cpu_id()
        );
        assert_eq!(
            kernel_start.0, KERN_VADDR.0,
            "kernel image must be loaded at its identity-mapped base"
        );

        let (frames, kernel_size) = phys_init(mem, platform, kernel_start, kernel_end)?;
        let cpus = CpuTable::discover(mem, &frames, platform, boot_stack);
        let kernel = Kernel {
            mem,
            platform,
            frames,
            cpus,
            procs: ProcTable::new(),
            kernel_size,
        };
        let mapper = kernel.cpu_startup()?;
        Ok((kernel, mapper))
    }

    /// Per-CPU bring-up: build the executing CPU's address space, load it
    /// and report the CPU active. The bootstrap processor runs this from
    /// [`Kernel::bootstrap`]; application processors call it directly once
    /// they come out of the trampoline.
    pub fn cpu_startup(&self) -> Result<Mapper<'a, M>, KernelError> {
        let cpu = self.cpus.current(self.platform.cpu_id());
        let mapper = Mapper::new(
            self.mem,
            &self.frames,
            self.kernel_size,
            LAPIC_BASE,
            cpu.stack(),
            STACK_SIZE,
        )?;
        self.platform.load_directory(mapper.directory());
        cpu.mark_active();
        info!("[SMP] CPU#{} running, stack at {:#x}", cpu.id(), cpu.stack());
        Ok(mapper)
    }

    /// Create the initial processes from the boot image.
    ///
    /// Idle programs are instantiated once per discovered CPU and assigned
    /// as that CPU's idle process; everything else is loaded once and made
    /// ready. A program that fails to load is reported and skipped, the rest
    /// of the image still loads.
    pub fn populate(&self, mapper: &Mapper<'a, M>, image: &BootImage<'_>) {
        info!("[BOOT] image at {:#x}", image.base);
        for prog in image.programs {
            let copies = if prog.flags.contains(BootProgFlags::IDLE) {
                self.cpus.len()
            } else {
                1
            };
            for n in 0..copies {
                match self.load_program(mapper, image, prog) {
                    Ok(pid) => {
                        if prog.flags.contains(BootProgFlags::IDLE) {
                            self.cpus
                                .get(n)
                                .expect("one copy per discovered CPU")
                                .set_idle_proc(pid);
                        } else {
                            // a freshly created pid can always be resumed
                            let _ = self.procs.resume(pid);
                            info!("[BOOT] `{}` ready as pid {}", prog.path, pid);
                        }
                    }
                    Err(err) => {
                        warn!("[BOOT] loading `{}` failed: {:?}", prog.path, err);
                        break;
                    }
                }
            }
        }
    }

    fn load_program(
        &self,
        mapper: &Mapper<'a, M>,
        image: &BootImage<'_>,
        prog: &BootProgram<'_>,
    ) -> Result<Pid, KernelError> {
        let pid = self
            .procs
            .create(&self.frames, mapper, self.platform, prog.entry)?;
        let dir = self.procs.get(pid).expect("created a moment ago").page_dir;

        let remote = mapper.map_remote_dir(dir);
        for seg in prog.segments {
            let user = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
            remote.map(
                &self.frames,
                seg.virt_base,
                image.base + seg.offset,
                seg.size,
                user,
            )?;
        }
        Ok(pid)
    }

    /// Hand the executing CPU over to the scheduler: start its timer, unmask
    /// interrupts and run the first pick.
    pub fn start_scheduling(&self) -> Option<Pid> {
        self.platform.init_clock();
        self.platform.enable_interrupts();
        self.procs.schedule(&self.cpus, self.platform)
    }
}
