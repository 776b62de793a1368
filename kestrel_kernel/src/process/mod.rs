//! The process table and the scheduler.
//!
//! Processes live in a fixed-size table indexed by [`Pid`]; a slot is in use
//! while its AVAIL flag is set. The whole table sits behind one spinlock.
//! Scheduling is round-robin over the table with a single rotation cursor
//! shared by all CPUs, so that ready processes are spread across the machine
//! instead of piling onto one CPU.
//!
//! Lock order: the table lock may be taken before the frame allocator's
//! lock (process creation allocates while holding it), never the other way
//! around.

use kmem::access::PhysAccess;
use kmem::addr::{PhysAddr, VirtAddr};
use kmem::paging::{MapError, Mapper, DIR_SIZE};
use kmem::physical::FrameAllocator;
use spinlock::Mutex;

use crate::platform::Platform;
use crate::smp::CpuTable;
use crate::STACK_SIZE;

/// Maximum number of processes.
pub const PROC_MAX: usize = 4096;

/// Process identifier, the index of the process's table slot.
pub type Pid = u16;

const_assert!(pids_fit_their_type; PROC_MAX - 1 < u16::MAX as usize);

bitflags! {
    pub struct ProcFlags: u8 {
        /// Slot is in use.
        const AVAIL   = 1 << 0;
        /// Process may be picked by the scheduler.
        const READY   = 1 << 1;
        /// Process is executing on some CPU right now.
        const RUNNING = 1 << 2;
    }
}

/// One process table slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Process {
    /// Physical address of the process's page directory.
    pub page_dir: PhysAddr,
    /// Saved stack pointer, updated by the platform on context switch.
    pub stack: VirtAddr,
    pub flags: ProcFlags,
}

impl Process {
    pub const EMPTY: Process = Process {
        page_dir: PhysAddr(0),
        stack: VirtAddr(0),
        flags: ProcFlags::empty(),
    };
}

/// A validated reference to a live process, obtained from
/// [`ProcTable::find`].
#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct ProcHandle(Pid);

/// Errors reported by process table operations.
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum ProcError {
    /// Every table slot is in use.
    TableFull,
    /// The given id does not name a live process.
    NoSuchProcess,
    /// The process is executing and cannot be destroyed.
    Busy,
    /// Physical memory for the process's address space ran out.
    NoMemory,
}

struct Table {
    slots: [Process; PROC_MAX],
    /// Shared round-robin rotation cursor.
    cursor: usize,
}

/// The process table behind its spinlock.
pub struct ProcTable {
    inner: Mutex<Table>,
}

impl ProcTable {
    pub const fn new() -> ProcTable {
        ProcTable {
            inner: Mutex::new(Table {
                slots: [Process::EMPTY; PROC_MAX],
                cursor: 0,
            }),
        }
    }

    /// Create a process that will start executing at `entry`.
    ///
    /// Claims the lowest free table slot, allocates the page directory and
    /// both stacks, builds the address space and hands the slot to the
    /// platform for register setup. The new process is not READY; callers
    /// [`ProcTable::resume`] it once it is fully loaded.
    pub fn create<M: PhysAccess, P: Platform>(
        &self,
        frames: &FrameAllocator,
        mapper: &Mapper<'_, M>,
        platform: &P,
        entry: VirtAddr,
    ) -> Result<Pid, ProcError> {
        let mut table = self.inner.lock();
        let slot = (0..PROC_MAX)
            .find(|&i| !table.slots[i].flags.contains(ProcFlags::AVAIL))
            .ok_or(ProcError::TableFull)?;

        let page_dir = frames.alloc(DIR_SIZE).map_err(|_| ProcError::NoMemory)?;
        let kern_stack = match frames.alloc(STACK_SIZE) {
            Ok(stack) => stack,
            Err(_) => {
                frames.free_range(page_dir, DIR_SIZE);
                return Err(ProcError::NoMemory);
            }
        };
        let user_stack = match frames.alloc(STACK_SIZE) {
            Ok(stack) => stack,
            Err(_) => {
                frames.free_range(page_dir, DIR_SIZE);
                frames.free_range(kern_stack, STACK_SIZE);
                return Err(ProcError::NoMemory);
            }
        };

        if let Err(err) = mapper.setup_process(frames, page_dir, kern_stack, user_stack, STACK_SIZE)
        {
            // the half-built address space is not reclaimed; the machine is
            // out of memory during boot and about to stop anyway
            warn!("[PROC] address space setup failed: {:?}", err);
            return Err(match err {
                MapError::OutOfMemory | MapError::WindowExhausted => ProcError::NoMemory,
            });
        }

        let proc = &mut table.slots[slot];
        proc.page_dir = page_dir;
        proc.flags = ProcFlags::AVAIL;
        platform.init_process(proc, entry, kern_stack, user_stack);

        debug!("[PROC] created pid {} with directory {:#x}", slot, page_dir);
        Ok(slot as Pid)
    }

    /// Look up a live process, yielding a handle that witnesses it existed.
    pub fn find(&self, pid: Pid) -> Option<ProcHandle> {
        self.get(pid).map(|_| ProcHandle(pid))
    }

    /// Id of the process behind a handle.
    pub fn lookup(&self, proc: Option<ProcHandle>) -> Option<Pid> {
        proc.map(|handle| handle.0)
    }

    /// Snapshot of a live process's slot.
    pub fn get(&self, pid: Pid) -> Option<Process> {
        self.inner.with_lock(|table| {
            table
                .slots
                .get(pid as usize)
                .copied()
                .filter(|proc| proc.flags.contains(ProcFlags::AVAIL))
        })
    }

    /// Mark a process ready for scheduling.
    pub fn resume(&self, pid: Pid) -> Result<(), ProcError> {
        self.set_ready(pid, true)
    }

    /// Take a process out of the scheduler's consideration. It keeps running
    /// until its CPU schedules next.
    pub fn pause(&self, pid: Pid) -> Result<(), ProcError> {
        self.set_ready(pid, false)
    }

    fn set_ready(&self, pid: Pid, ready: bool) -> Result<(), ProcError> {
        self.inner.with_lock(|table| {
            let proc = table
                .slots
                .get_mut(pid as usize)
                .filter(|proc| proc.flags.contains(ProcFlags::AVAIL))
                .ok_or(ProcError::NoSuchProcess)?;
            if ready {
                proc.flags.insert(ProcFlags::READY);
            } else {
                proc.flags.remove(ProcFlags::READY);
            }
            Ok(())
        })
    }

    /// Destroy a process and reclaim its memory.
    ///
    /// Fails with [`ProcError::Busy`] if the process is executing anywhere,
    /// including on the calling CPU. The slot is claimed by clearing READY
    /// under the table lock, then the address space is torn down without the
    /// lock held, then the slot is cleared.
    pub fn destroy<M: PhysAccess, P: Platform>(
        &self,
        cpus: &CpuTable,
        mapper: &Mapper<'_, M>,
        frames: &FrameAllocator,
        platform: &P,
        pid: Pid,
    ) -> Result<(), ProcError> {
        let page_dir = {
            let mut table = self.inner.lock();
            let cpu = cpus.current(platform.cpu_id());
            let proc = table
                .slots
                .get_mut(pid as usize)
                .filter(|proc| proc.flags.contains(ProcFlags::AVAIL))
                .ok_or(ProcError::NoSuchProcess)?;
            if cpu.current_proc() == Some(pid) || proc.flags.contains(ProcFlags::RUNNING) {
                return Err(ProcError::Busy);
            }
            proc.flags.remove(ProcFlags::READY);
            proc.page_dir
        };

        {
            let remote = mapper.map_remote_dir(page_dir);
            remote.release(frames);
        }

        self.inner
            .with_lock(|table| table.slots[pid as usize] = Process::EMPTY);
        debug!("[PROC] destroyed pid {}", pid);
        Ok(())
    }

    /// Pick the next process for the executing CPU and switch to it.
    ///
    /// Scans the table round-robin from the shared cursor for a process that
    /// is ready and not already executing elsewhere. If none is found the
    /// CPU keeps its current process while that stays ready, and otherwise
    /// falls back to its idle process. Returns the process now current on
    /// this CPU.
    pub fn schedule<P: Platform>(&self, cpus: &CpuTable, platform: &P) -> Option<Pid> {
        platform.disable_interrupts();
        let cpu = cpus.current(platform.cpu_id());
        let old = cpu.current_proc();

        let chosen = {
            let mut table = self.inner.lock();
            let start = table.cursor;
            let runnable = ProcFlags::AVAIL | ProcFlags::READY;
            let chosen = loop {
                table.cursor = (table.cursor + 1) % PROC_MAX;
                if table.cursor == start {
                    break match old {
                        Some(o) if table.slots[o as usize].flags.contains(ProcFlags::READY) => {
                            Some(o)
                        }
                        _ => cpu.idle_proc(),
                    };
                }
                let flags = table.slots[table.cursor].flags;
                if flags.contains(runnable) && !flags.contains(ProcFlags::RUNNING) {
                    break Some(table.cursor as Pid);
                }
            };

            if let Some(new) = chosen {
                table.slots[new as usize].flags.insert(ProcFlags::RUNNING);
                if let Some(o) = old {
                    if o != new {
                        table.slots[o as usize].flags.remove(ProcFlags::RUNNING);
                    }
                }
                cpu.set_current_proc(Some(new));
            }
            chosen
        };

        if let Some(new) = chosen {
            if old != Some(new) {
                trace!("[PROC] CPU#{}: {:?} -> {}", cpu.id(), old, new);
                platform.context_switch(old, new);
            }
        }
        chosen
    }
}

#[cfg(test)]
impl ProcTable {
    /// Put a slot into an arbitrary state, bypassing the lifecycle.
    fn force_flags(&self, pid: Pid, flags: ProcFlags) {
        self.inner
            .with_lock(|table| table.slots[pid as usize].flags = flags);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::smp::LAPIC_BASE;
    use crate::testutil::{Fixture, BOOT_STACK};
    use kmem::access::Window;

    fn world(fix: &Fixture) -> (FrameAllocator, Mapper<'_, Window>) {
        let (frames, kernel_size) = fix.phys_init();
        let mapper = Mapper::new(
            &fix.mem,
            &frames,
            kernel_size,
            LAPIC_BASE,
            BOOT_STACK,
            STACK_SIZE,
        )
        .unwrap();
        (frames, mapper)
    }

    fn cpus(fix: &Fixture, frames: &FrameAllocator) -> CpuTable {
        CpuTable::discover(&fix.mem, frames, &fix.platform, BOOT_STACK)
    }

    #[test]
    fn create_and_lifecycle() {
        let fix = Fixture::new();
        let (frames, mapper) = world(&fix);
        let table = ProcTable::new();

        let pid = table
            .create(&frames, &mapper, &fix.platform, VirtAddr(0x1000))
            .unwrap();
        assert_eq!(pid, 0);

        let proc = table.get(pid).unwrap();
        assert_eq!(proc.flags, ProcFlags::AVAIL);
        assert_ne!(proc.page_dir, PhysAddr(0));

        table.resume(pid).unwrap();
        assert!(table.get(pid).unwrap().flags.contains(ProcFlags::READY));
        table.pause(pid).unwrap();
        assert!(!table.get(pid).unwrap().flags.contains(ProcFlags::READY));

        let handle = table.find(pid).unwrap();
        assert_eq!(table.lookup(Some(handle)), Some(pid));
        assert_eq!(table.find(99), None);
        assert_eq!(table.resume(99), Err(ProcError::NoSuchProcess));
    }

    #[test]
    fn destroy_reclaims_all_memory() {
        let fix = Fixture::new();
        let (frames, mapper) = world(&fix);
        let cpus = cpus(&fix, &frames);
        let table = ProcTable::new();

        // first creation permanently allocates a page table for the scratch
        // window in the local directory, warm that up before measuring
        let warm = table
            .create(&frames, &mapper, &fix.platform, VirtAddr(0x1000))
            .unwrap();
        table
            .destroy(&cpus, &mapper, &frames, &fix.platform, warm)
            .unwrap();

        let avail_before = frames.avail_bytes();
        let pid = table
            .create(&frames, &mapper, &fix.platform, VirtAddr(0x1000))
            .unwrap();
        assert!(frames.avail_bytes() < avail_before);

        table
            .destroy(&cpus, &mapper, &frames, &fix.platform, pid)
            .unwrap();
        assert_eq!(frames.avail_bytes(), avail_before);
        assert_eq!(table.get(pid), None);
        assert_eq!(
            table.destroy(&cpus, &mapper, &frames, &fix.platform, pid),
            Err(ProcError::NoSuchProcess)
        );
    }

    #[test]
    fn destroying_the_current_process_is_busy() {
        let fix = Fixture::new();
        let (frames, mapper) = world(&fix);
        let cpus = cpus(&fix, &frames);
        let table = ProcTable::new();

        let pid = table
            .create(&frames, &mapper, &fix.platform, VirtAddr(0x1000))
            .unwrap();
        table.resume(pid).unwrap();
        assert_eq!(table.schedule(&cpus, &fix.platform), Some(pid));

        assert_eq!(
            table.destroy(&cpus, &mapper, &frames, &fix.platform, pid),
            Err(ProcError::Busy)
        );
    }

    #[test]
    fn destroying_a_process_running_elsewhere_is_busy() {
        let fix = Fixture::new();
        fix.plant_mp_table(&[0, 1]);
        let (frames, mapper) = world(&fix);
        let cpus = cpus(&fix, &frames);
        let table = ProcTable::new();

        let pid = table
            .create(&frames, &mapper, &fix.platform, VirtAddr(0x1000))
            .unwrap();
        table.resume(pid).unwrap();
        assert_eq!(table.schedule(&cpus, &fix.platform), Some(pid));

        // from the other CPU's point of view the process is still RUNNING
        fix.platform.set_cpu(1);
        assert_eq!(
            table.destroy(&cpus, &mapper, &frames, &fix.platform, pid),
            Err(ProcError::Busy)
        );
    }

    #[test]
    fn full_table_is_an_error() {
        let fix = Fixture::new();
        let (frames, mapper) = world(&fix);
        let table = ProcTable::new();

        for pid in 0..PROC_MAX {
            table.force_flags(pid as Pid, ProcFlags::AVAIL);
        }
        assert_eq!(
            table.create(&frames, &mapper, &fix.platform, VirtAddr(0x1000)),
            Err(ProcError::TableFull)
        );
    }

    #[test]
    fn exhausted_memory_is_an_error() {
        let fix = Fixture::new();
        let (frames, mapper) = world(&fix);
        let table = ProcTable::new();

        while frames.alloc(DIR_SIZE).is_ok() {}
        assert_eq!(
            table.create(&frames, &mapper, &fix.platform, VirtAddr(0x1000)),
            Err(ProcError::NoMemory)
        );
    }

    #[test]
    fn round_robin_visits_every_ready_process() {
        let fix = Fixture::new();
        let (frames, mapper) = world(&fix);
        let cpus = cpus(&fix, &frames);
        let table = ProcTable::new();

        let mut pids = Vec::new();
        for _ in 0..3 {
            let pid = table
                .create(&frames, &mapper, &fix.platform, VirtAddr(0x1000))
                .unwrap();
            table.resume(pid).unwrap();
            pids.push(pid);
        }

        let picks: Vec<Pid> = (0..9)
            .map(|_| table.schedule(&cpus, &fix.platform).unwrap())
            .collect();

        // every ready process runs once before any runs again
        for window in picks.chunks(3) {
            let mut sorted = window.to_vec();
            sorted.sort_unstable();
            assert_eq!(sorted, pids);
        }

        // exactly the current pick is marked RUNNING
        let current = *picks.last().unwrap();
        for &pid in &pids {
            let running = table.get(pid).unwrap().flags.contains(ProcFlags::RUNNING);
            assert_eq!(running, pid == current);
        }
    }

    #[test]
    fn idle_process_runs_when_nothing_is_ready() {
        let fix = Fixture::new();
        let (frames, mapper) = world(&fix);
        let cpus = cpus(&fix, &frames);
        let table = ProcTable::new();

        let idle = table
            .create(&frames, &mapper, &fix.platform, VirtAddr(0x1000))
            .unwrap();
        cpus.current(0).set_idle_proc(idle);

        assert_eq!(table.schedule(&cpus, &fix.platform), Some(idle));
        assert_eq!(cpus.current(0).current_proc(), Some(idle));

        // a process becoming ready takes over from idle
        let busy = table
            .create(&frames, &mapper, &fix.platform, VirtAddr(0x2000))
            .unwrap();
        table.resume(busy).unwrap();
        assert_eq!(table.schedule(&cpus, &fix.platform), Some(busy));
        assert!(!table.get(idle).unwrap().flags.contains(ProcFlags::RUNNING));

        let switches = fix.platform.switches.lock().unwrap();
        assert_eq!(*switches, vec![(None, idle), (Some(idle), busy)]);
    }

    #[test]
    fn schedule_without_work_or_idle_keeps_the_cpu() {
        let fix = Fixture::new();
        let (frames, _mapper) = world(&fix);
        let cpus = cpus(&fix, &frames);
        let table = ProcTable::new();

        assert_eq!(table.schedule(&cpus, &fix.platform), None);
        assert!(fix.platform.switches.lock().unwrap().is_empty());
    }
}
