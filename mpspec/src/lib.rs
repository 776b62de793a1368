//! Parsing of the Intel MultiProcessor Specification tables.
//!
//! The firmware leaves a floating pointer structure in one of a few known
//! physical memory windows; it points at a configuration table whose entries
//! describe the processors (and buses, IO interrupt controllers and so on,
//! which the kernel does not care about). Everything is read through
//! [`PhysAccess`] because the tables live in physical memory that may have
//! no permanent mapping.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate static_assertions;

use core::mem;

use kmem::access::PhysAccess;
use kmem::addr::PhysAddr;

/// Signature of the floating pointer structure, "_MP_".
pub const FLOAT_SIGNATURE: u32 = 0x5f50_4d5f;

/// Signature of the configuration table, "PCMP".
pub const CONFIG_SIGNATURE: u32 = 0x504d_4350;

/// Configuration entry type for a processor.
pub const ENTRY_PROCESSOR: u8 = 0;

/// Structures are valid when their bytes sum to zero modulo 256.
fn checksum_ok<M: PhysAccess>(mem: &M, addr: PhysAddr, len: usize) -> bool {
    let mut sum = 0_u8;
    for i in 0..len {
        let byte: u8 = unsafe { mem.read(addr + i) };
        sum = sum.wrapping_add(byte);
    }
    sum == 0
}

/// MP floating pointer structure.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct FloatingPointer {
    pub signature: u32,
    pub config_addr: u32,
    pub length: u8,
    pub revision: u8,
    pub checksum: u8,
    pub feature1: u8,
    pub feature2: u32,
}

assert_eq_size!(floating_pointer_size; FloatingPointer, [u8; 16]);

/// Header of the MP configuration table.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct ConfigHeader {
    pub signature: u32,
    pub base_length: u16,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 8],
    pub product_id: [u8; 12],
    pub oem_table_addr: u32,
    pub oem_table_length: u16,
    pub entry_count: u16,
    pub lapic_addr: u32,
    pub reserved: u32,
}

assert_eq_size!(config_header_size; ConfigHeader, [u8; 44]);

/// A processor entry in the configuration table.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct ProcessorEntry {
    pub kind: u8,
    pub apic_id: u8,
    pub apic_revision: u8,
    pub cpu_flags: u8,
    pub signature: u32,
    pub features: u32,
    pub reserved: [u8; 8],
}

assert_eq_size!(processor_entry_size; ProcessorEntry, [u8; 20]);

/// Scan a window of physical memory for the floating pointer structure and
/// return the physical address of the configuration table it points to.
///
/// The signature is word aligned, so the scan steps one word at a time.
/// Candidates whose bytes do not sum to zero are ignored and the scan
/// continues.
pub fn scan<M: PhysAccess>(mem: &M, base: PhysAddr, len: usize) -> Option<PhysAddr> {
    let mut offset = 0;
    while offset + mem::size_of::<FloatingPointer>() <= len {
        let signature: u32 = unsafe { mem.read(base + offset) };
        if signature == FLOAT_SIGNATURE
            && checksum_ok(mem, base + offset, mem::size_of::<FloatingPointer>())
        {
            let float: FloatingPointer = unsafe { mem.read(base + offset) };
            return Some(PhysAddr(float.config_addr as usize));
        }
        offset += mem::size_of::<u32>();
    }
    None
}

/// A validated MP configuration table.
pub struct Config {
    header: ConfigHeader,
    addr: PhysAddr,
}

impl Config {
    /// Read and validate the configuration table at `addr`. The table must
    /// carry the right signature and its base portion (header plus entries,
    /// `base_length` bytes) must checksum to zero.
    pub fn read<M: PhysAccess>(mem: &M, addr: PhysAddr) -> Option<Config> {
        let header: ConfigHeader = unsafe { mem.read(addr) };
        if header.signature != CONFIG_SIGNATURE {
            return None;
        }
        if !checksum_ok(mem, addr, header.base_length as usize) {
            return None;
        }
        Some(Config { header, addr })
    }

    /// Physical address of the local interrupt controller reported by the
    /// firmware.
    pub fn lapic_addr(&self) -> PhysAddr {
        PhysAddr(self.header.lapic_addr as usize)
    }

    pub fn entry_count(&self) -> usize {
        self.header.entry_count as usize
    }

    /// Iterate over the processor entries of the table, skipping all other
    /// entry types.
    pub fn processors<'a, M: PhysAccess>(&self, mem: &'a M) -> Processors<'a, M> {
        Processors {
            mem,
            at: self.addr + mem::size_of::<ConfigHeader>(),
            remaining: self.entry_count(),
        }
    }
}

/// Iterator over the processor entries of a configuration table.
///
/// Processor entries are 20 bytes, every other entry type is 8 bytes.
pub struct Processors<'a, M: PhysAccess> {
    mem: &'a M,
    at: PhysAddr,
    remaining: usize,
}

impl<'a, M: PhysAccess> Iterator for Processors<'a, M> {
    type Item = ProcessorEntry;

    fn next(&mut self) -> Option<ProcessorEntry> {
        while self.remaining > 0 {
            self.remaining -= 1;
            let kind: u8 = unsafe { self.mem.read(self.at) };
            if kind == ENTRY_PROCESSOR {
                let entry: ProcessorEntry = unsafe { self.mem.read(self.at) };
                self.at += mem::size_of::<ProcessorEntry>();
                return Some(entry);
            }
            self.at += 8;
        }
        None
    }
}
