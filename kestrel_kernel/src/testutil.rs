//! Shared scaffolding for hosted tests: a memory buffer standing in for
//! physical RAM, the mock platform, and helpers that mirror the boot-time
//! memory layout.

use std::mem;

use kmem::access::{PhysAccess, Window};
use kmem::addr::PhysAddr;
use kmem::paging::KERN_VADDR;
use kmem::physical::FrameAllocator;

use crate::kernel;
pub(crate) use crate::platform::mock::MockPlatform;

pub(crate) const TOTAL: usize = 32 << 20;
pub(crate) const KERNEL_START: PhysAddr = PhysAddr(KERN_VADDR.0);
pub(crate) const KERNEL_END: PhysAddr = PhysAddr(KERN_VADDR.0 + 64 * 1024);
pub(crate) const BOOT_STACK: PhysAddr = PhysAddr(0x9_0000);

const MP_FLOAT: PhysAddr = PhysAddr(0xf_0100);
const MP_CONFIG: PhysAddr = PhysAddr(0xf_1000);

pub(crate) struct Fixture {
    // the buffer stands in for physical RAM and must outlive the window
    _storage: Box<[u8]>,
    pub mem: Window,
    pub platform: MockPlatform,
}

// The window's raw pointer targets the owned `_storage` buffer, which is
// valid for the fixture's whole lifetime; all access goes through the
// unsafe `PhysAccess` methods whose contract covers concurrent use.
unsafe impl Sync for Fixture {}

impl Fixture {
    pub fn new() -> Fixture {
        let mut storage = vec![0_u8; TOTAL].into_boxed_slice();
        let mem = unsafe { Window::new(storage.as_mut_ptr(), PhysAddr(0), TOTAL) };
        Fixture {
            _storage: storage,
            mem,
            platform: MockPlatform::with_memory(TOTAL),
        }
    }

    /// Leave an MP configuration for the given processors in the BIOS area,
    /// the way real firmware does, with valid checksums.
    pub fn plant_mp_table(&self, apic_ids: &[u8]) {
        let base_length = mem::size_of::<mpspec::ConfigHeader>()
            + apic_ids.len() * mem::size_of::<mpspec::ProcessorEntry>();

        let float = mpspec::FloatingPointer {
            signature: mpspec::FLOAT_SIGNATURE,
            config_addr: MP_CONFIG.0 as u32,
            length: 1,
            revision: 4,
            checksum: 0,
            feature1: 0,
            feature2: 0,
        };
        unsafe { self.mem.write(MP_FLOAT, float) };

        let header = mpspec::ConfigHeader {
            signature: mpspec::CONFIG_SIGNATURE,
            base_length: base_length as u16,
            revision: 4,
            checksum: 0,
            oem_id: *b"KESTREL ",
            product_id: *b"TESTBOARD   ",
            oem_table_addr: 0,
            oem_table_length: 0,
            entry_count: apic_ids.len() as u16,
            lapic_addr: crate::smp::LAPIC_BASE.0 as u32,
            reserved: 0,
        };
        unsafe { self.mem.write(MP_CONFIG, header) };

        let mut at = MP_CONFIG + mem::size_of::<mpspec::ConfigHeader>();
        for id in apic_ids {
            let entry = mpspec::ProcessorEntry {
                kind: mpspec::ENTRY_PROCESSOR,
                apic_id: *id,
                apic_revision: 0x14,
                cpu_flags: 1,
                signature: 0,
                features: 0,
                reserved: [0; 8],
            };
            unsafe { self.mem.write(at, entry) };
            at += mem::size_of::<mpspec::ProcessorEntry>();
        }

        // checksum bytes sit at offset 10 of the floating pointer and
        // offset 7 of the configuration header
        self.balance_checksum(MP_FLOAT, mem::size_of::<mpspec::FloatingPointer>(), 10);
        self.balance_checksum(MP_CONFIG, base_length, 7);
    }

    /// Make the bytes in `base..base + len` sum to zero by patching the
    /// checksum byte at `base + checksum_offset`.
    fn balance_checksum(&self, base: PhysAddr, len: usize, checksum_offset: usize) {
        let mut sum = 0_u8;
        for i in 0..len {
            let byte: u8 = unsafe { self.mem.read(base + i) };
            sum = sum.wrapping_add(byte);
        }
        unsafe { self.mem.write(base + checksum_offset, 0_u8.wrapping_sub(sum)) };
    }

    /// Physical memory bring-up with the standard test layout: the kernel
    /// image at its linked base, the frame bitmap right behind it.
    pub fn phys_init(&self) -> (FrameAllocator, usize) {
        kernel::phys_init(&self.mem, &self.platform, KERNEL_START, KERNEL_END)
            .expect("physical memory bring-up")
    }
}
