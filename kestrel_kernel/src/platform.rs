//! The seam between the portable kernel core and the machine.
//!
//! Everything that requires privileged instructions or knowledge of the CPU
//! (context switches, interrupt masking, inter-processor startup) sits behind
//! [`Platform`]. The kernel core only ever talks to this trait; the mock
//! implementation in [`mock`] is what makes the core testable on a host.

use kmem::addr::{PhysAddr, VirtAddr};

use crate::process::{Pid, Process};

/// Architecture services required by the kernel core.
///
/// Implementations are shared between all CPUs, so every method takes
/// `&self`; per-CPU state lives behind [`Platform::cpu_id`].
pub trait Platform {
    /// Total bytes of physical memory installed.
    fn total_memory(&self) -> usize;

    /// Identifier of the executing CPU, as reported by its local interrupt
    /// controller.
    fn cpu_id(&self) -> u32;

    /// Prepare the register state of a fresh process so that it starts
    /// executing at `entry` once it is first switched to.
    fn init_process(
        &self,
        proc: &mut Process,
        entry: VirtAddr,
        kern_stack: PhysAddr,
        user_stack: PhysAddr,
    );

    /// Switch the executing CPU from `old` to `new`.
    ///
    /// Saves the current register state into `old`'s slot (if any) and
    /// restores `new`'s, loading its page directory on the way.
    fn context_switch(&self, old: Option<Pid>, new: Pid);

    /// Mask interrupts on the executing CPU.
    fn disable_interrupts(&self);

    /// Unmask interrupts on the executing CPU.
    fn enable_interrupts(&self);

    /// Program the timer that drives preemptive scheduling on the executing
    /// CPU.
    fn init_clock(&self);

    /// Load `dir` as the executing CPU's page directory, enabling paging.
    fn load_directory(&self, dir: PhysAddr);

    /// Kick the application processor with the given id out of halt and make
    /// it start executing the kernel entry path on `stack`.
    fn start_cpu(&self, cpu_id: u32, stack: PhysAddr);
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use kmem::addr::{PhysAddr, VirtAddr};
    use kmem::paging::KERN_STACK;

    use super::Platform;
    use crate::process::{Pid, Process};
    use crate::STACK_SIZE;

    /// Platform stand-in for hosted tests. Records every machine-level
    /// operation the kernel requests so tests can assert on them.
    #[derive(Default)]
    pub struct MockPlatform {
        total: usize,
        cpu: AtomicU32,
        pub switches: Mutex<Vec<(Option<Pid>, Pid)>>,
        pub started: Mutex<Vec<u32>>,
        pub loaded: Mutex<Vec<PhysAddr>>,
    }

    impl MockPlatform {
        pub fn with_memory(total: usize) -> MockPlatform {
            MockPlatform {
                total,
                ..MockPlatform::default()
            }
        }

        /// Pretend that subsequent kernel calls happen on the given CPU.
        pub fn set_cpu(&self, id: u32) {
            self.cpu.store(id, Ordering::SeqCst);
        }
    }

    impl Platform for MockPlatform {
        fn total_memory(&self) -> usize {
            self.total
        }

        fn cpu_id(&self) -> u32 {
            self.cpu.load(Ordering::SeqCst)
        }

        fn init_process(
            &self,
            proc: &mut Process,
            _entry: VirtAddr,
            _kern_stack: PhysAddr,
            _user_stack: PhysAddr,
        ) {
            proc.stack = KERN_STACK + STACK_SIZE;
        }

        fn context_switch(&self, old: Option<Pid>, new: Pid) {
            self.switches.lock().unwrap().push((old, new));
        }

        fn disable_interrupts(&self) {}

        fn enable_interrupts(&self) {}

        fn init_clock(&self) {}

        fn load_directory(&self, dir: PhysAddr) {
            self.loaded.lock().unwrap().push(dir);
        }

        fn start_cpu(&self, cpu_id: u32, _stack: PhysAddr) {
            self.started.lock().unwrap().push(cpu_id);
        }
    }
}
