//! Multiprocessor discovery and bring-up.
//!
//! At boot the bootstrap processor scans the firmware areas for the MP
//! configuration table (see the `mpspec` crate) and builds one [`Cpu`]
//! descriptor per reported processor. Application processors are then
//! started one at a time; each one signals readiness by setting its ACTIVE
//! flag, which the bootstrap processor spin-waits on.
//!
//! Descriptors are never handed out mutably. All fields that change after
//! discovery are atomics, so the table can be shared freely between CPUs
//! without a lock.

use core::array;
use core::sync::atomic::{AtomicU16, AtomicU8, Ordering};

use kmem::access::PhysAccess;
use kmem::addr::PhysAddr;
use kmem::physical::FrameAllocator;

use crate::platform::Platform;
use crate::process::Pid;
use crate::STACK_SIZE;

/// Maximum number of processors the table can describe.
pub const CPU_MAX: usize = 256;

/// Physical address of the real-mode trampoline application processors
/// start executing at.
pub const BOOT_VECTOR: PhysAddr = PhysAddr(0xf000);

/// Physical address of the local interrupt controller's register page,
/// identical on every CPU.
pub const LAPIC_BASE: PhysAddr = PhysAddr(0xfee0_0000);

/// Sentinel stored in the per-CPU process fields when no process is set.
const NO_PROC: u16 = u16::MAX;

bitflags! {
    pub struct CpuFlags: u8 {
        /// Slot does not describe a processor.
        const EMPTY    = 1 << 0;
        /// Processor was reported by the firmware.
        const DETECTED = 1 << 1;
        /// Processor is up and executing kernel code.
        const ACTIVE   = 1 << 2;
    }
}

/// Per-CPU state: identity, boot stack and scheduling slots.
pub struct Cpu {
    id: u32,
    flags: AtomicU8,
    stack: PhysAddr,
    current: AtomicU16,
    idle: AtomicU16,
}

impl Cpu {
    fn empty() -> Cpu {
        Cpu {
            id: 0,
            flags: AtomicU8::new(CpuFlags::EMPTY.bits()),
            stack: PhysAddr(0),
            current: AtomicU16::new(NO_PROC),
            idle: AtomicU16::new(NO_PROC),
        }
    }

    fn new(id: u32, stack: PhysAddr, flags: CpuFlags) -> Cpu {
        Cpu {
            id,
            flags: AtomicU8::new(flags.bits()),
            stack,
            current: AtomicU16::new(NO_PROC),
            idle: AtomicU16::new(NO_PROC),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this is the bootstrap processor. By convention the CPU with
    /// id 0 boots the machine and runs the one-time bring-up.
    pub fn is_boot_cpu(&self) -> bool {
        self.id == 0
    }

    pub fn flags(&self) -> CpuFlags {
        CpuFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.flags().contains(CpuFlags::ACTIVE)
    }

    /// Signal that this CPU finished its bring-up. Release-ordered so that
    /// everything written before becomes visible to the waiting bootstrap
    /// processor.
    pub fn mark_active(&self) {
        self.flags
            .fetch_or(CpuFlags::ACTIVE.bits(), Ordering::Release);
    }

    /// Physical base of this CPU's boot stack.
    pub fn stack(&self) -> PhysAddr {
        self.stack
    }

    /// Process currently executing on this CPU.
    pub fn current_proc(&self) -> Option<Pid> {
        match self.current.load(Ordering::Acquire) {
            NO_PROC => None,
            pid => Some(pid),
        }
    }

    pub(crate) fn set_current_proc(&self, pid: Option<Pid>) {
        self.current.store(pid.unwrap_or(NO_PROC), Ordering::Release);
    }

    /// This CPU's idle process, run when nothing else is ready.
    pub fn idle_proc(&self) -> Option<Pid> {
        match self.idle.load(Ordering::Acquire) {
            NO_PROC => None,
            pid => Some(pid),
        }
    }

    pub fn set_idle_proc(&self, pid: Pid) {
        self.idle.store(pid, Ordering::Release);
    }
}

/// The table of discovered processors.
pub struct CpuTable {
    cpus: [Cpu; CPU_MAX],
    count: usize,
}

impl CpuTable {
    /// Find the processors of this machine.
    ///
    /// Scans the firmware areas (the first kilobyte, the last kilobyte of
    /// base memory and the BIOS read-only segment) for the MP configuration
    /// table. The executing CPU keeps its boot stack and is marked active;
    /// every other processor gets a stack allocated for its later bring-up.
    /// Without a configuration table the machine is taken to be a
    /// uniprocessor.
    pub fn discover<M: PhysAccess, P: Platform>(
        mem: &M,
        frames: &FrameAllocator,
        platform: &P,
        boot_stack: PhysAddr,
    ) -> CpuTable {
        let mut table = CpuTable {
            cpus: array::from_fn(|_| Cpu::empty()),
            count: 0,
        };

        let total = platform.total_memory();
        let windows = [
            (PhysAddr(0), 1024),
            (PhysAddr(total.saturating_sub(1024)), 1024),
            (PhysAddr(0xf_0000), 0x1_0000),
        ];
        let config = windows
            .iter()
            .find_map(|&(base, len)| mpspec::scan(mem, base, len))
            .and_then(|addr| mpspec::Config::read(mem, addr));

        if let Some(config) = &config {
            debug!(
                "[SMP] configuration table with {} entries, APIC at {:#x}",
                config.entry_count(),
                config.lapic_addr()
            );
            for entry in config.processors(mem) {
                let id = entry.apic_id as u32;
                if table.by_id(id).is_some() {
                    warn!("[SMP] ignoring duplicate entry for CPU#{}", id);
                    continue;
                }
                if table.count == CPU_MAX {
                    warn!("[SMP] out of table slots, ignoring CPU#{}", id);
                    continue;
                }
                if id == platform.cpu_id() {
                    table.push(Cpu::new(id, boot_stack, CpuFlags::DETECTED | CpuFlags::ACTIVE));
                } else {
                    match frames.alloc(STACK_SIZE) {
                        Ok(stack) => table.push(Cpu::new(id, stack, CpuFlags::DETECTED)),
                        Err(_) => warn!("[SMP] no memory for CPU#{} boot stack", id),
                    }
                }
            }
        }

        if table.by_id(platform.cpu_id()).is_none() && table.count < CPU_MAX {
            if config.is_some() {
                warn!("[SMP] executing CPU missing from configuration table");
            }
            table.push(Cpu::new(
                platform.cpu_id(),
                boot_stack,
                CpuFlags::DETECTED | CpuFlags::ACTIVE,
            ));
        }

        info!("[SMP] {} processor(s)", table.len());
        table
    }

    fn push(&mut self, cpu: Cpu) {
        self.cpus[self.count] = cpu;
        self.count += 1;
    }

    /// Number of discovered processors.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus[..self.count].iter()
    }

    /// Descriptor at the given discovery index.
    pub fn get(&self, index: usize) -> Option<&Cpu> {
        self.cpus[..self.count].get(index)
    }

    /// Descriptor of the CPU with the given id.
    pub fn by_id(&self, id: u32) -> Option<&Cpu> {
        self.iter().find(|cpu| cpu.id() == id)
    }

    /// Descriptor of the executing CPU. Every CPU that runs kernel code must
    /// have been discovered, so a missing descriptor is unrecoverable.
    pub fn current(&self, cpu_id: u32) -> &Cpu {
        match self.by_id(cpu_id) {
            Some(cpu) => cpu,
            None => panic!("no descriptor for executing CPU#{}", cpu_id),
        }
    }

    /// Start every application processor and wait for each to come up.
    ///
    /// Each AP is kicked via the platform's startup mechanism and then
    /// spin-waited on until it flips its ACTIVE flag, serializing the
    /// bring-up so that at most one AP boots at a time.
    pub fn boot_all<P: Platform>(&self, platform: &P) {
        for cpu in self.iter() {
            if cpu.id() == platform.cpu_id() {
                continue;
            }
            debug!("[SMP] starting CPU#{}", cpu.id());
            platform.start_cpu(cpu.id(), cpu.stack());
            while !cpu.is_active() {
                core::hint::spin_loop();
            }
            info!("[SMP] CPU#{} is up", cpu.id());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{Fixture, BOOT_STACK};

    #[test]
    fn discover_from_configuration_table() {
        let fix = Fixture::new();
        fix.plant_mp_table(&[0, 1, 2]);
        let (frames, _) = fix.phys_init();

        let table = CpuTable::discover(&fix.mem, &frames, &fix.platform, BOOT_STACK);
        assert_eq!(table.len(), 3);

        let boot = table.by_id(0).unwrap();
        assert!(boot.is_active());
        assert_eq!(boot.stack(), BOOT_STACK);

        for id in [1_u32, 2].iter() {
            let ap = table.by_id(*id).unwrap();
            assert!(ap.flags().contains(CpuFlags::DETECTED));
            assert!(!ap.is_active());
            // each AP got its own stack from the allocator
            assert_ne!(ap.stack(), BOOT_STACK);
            assert_ne!(ap.stack(), PhysAddr(0));
        }
    }

    #[test]
    fn discover_without_table_is_uniprocessor() {
        let fix = Fixture::new();
        let (frames, _) = fix.phys_init();

        let table = CpuTable::discover(&fix.mem, &frames, &fix.platform, BOOT_STACK);
        assert_eq!(table.len(), 1);
        assert!(table.current(0).is_active());
        assert_eq!(table.current(0).stack(), BOOT_STACK);
    }

    #[test]
    fn boot_cpu_is_id_zero() {
        let fix = Fixture::new();
        fix.plant_mp_table(&[0, 1]);
        let (frames, _) = fix.phys_init();

        let table = CpuTable::discover(&fix.mem, &frames, &fix.platform, BOOT_STACK);
        assert!(table.current(0).is_boot_cpu());
        assert!(!table.current(1).is_boot_cpu());
    }

    #[test]
    fn duplicate_processor_entries_are_ignored() {
        let fix = Fixture::new();
        fix.plant_mp_table(&[0, 1, 1]);
        let (frames, _) = fix.phys_init();

        let table = CpuTable::discover(&fix.mem, &frames, &fix.platform, BOOT_STACK);
        assert_eq!(table.len(), 2);
    }

    #[test]
    #[should_panic(expected = "no descriptor for executing CPU")]
    fn current_requires_discovered_cpu() {
        let fix = Fixture::new();
        let (frames, _) = fix.phys_init();
        let table = CpuTable::discover(&fix.mem, &frames, &fix.platform, BOOT_STACK);
        table.current(7);
    }

    #[test]
    fn boot_all_waits_for_each_processor() {
        let fix = Fixture::new();
        fix.plant_mp_table(&[0, 1, 2]);
        let (frames, _) = fix.phys_init();
        let table = CpuTable::discover(&fix.mem, &frames, &fix.platform, BOOT_STACK);

        // stand in for the APs: acknowledge each startup request only after
        // it was issued, like real processors would
        std::thread::scope(|s| {
            s.spawn(|| {
                for cpu in table.iter().filter(|cpu| cpu.id() != 0) {
                    while !fix.platform.started.lock().unwrap().contains(&cpu.id()) {
                        std::thread::yield_now();
                    }
                    cpu.mark_active();
                }
            });
            table.boot_all(&fix.platform);
        });

        assert_eq!(*fix.platform.started.lock().unwrap(), vec![1, 2]);
        assert!(table.iter().all(|cpu| cpu.is_active()));
    }
}
