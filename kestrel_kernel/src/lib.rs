//! Core of the kestrel microkernel: physical and virtual memory management
//! (via the `kmem` crate), the process table with its round-robin scheduler,
//! and multiprocessor bring-up.
//!
//! Everything architecture specific is reached through the [`Platform`]
//! trait, so the whole crate can be exercised by hosted tests with a mock
//! platform and a memory buffer standing in for physical RAM.
//!
//! [`Platform`]: platform/trait.Platform.html

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate static_assertions;
#[macro_use]
extern crate log;

pub mod bootimg;
pub mod kernel;
pub mod platform;
pub mod process;
pub mod smp;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::kernel::Kernel;

use kmem::paging::MapError;
use kmem::physical::AllocError;

use crate::process::ProcError;

/// Size of kernel stacks, user stacks and CPU boot stacks.
pub const STACK_SIZE: usize = 0x4000;

/// Top level error type of the kernel core.
#[derive(Eq, PartialEq, Clone, Debug)]
pub enum KernelError {
    /// Physical memory is exhausted.
    NoMemory,
    /// A page mapping operation failed.
    Map(MapError),
    /// A process table operation failed.
    Proc(ProcError),
}

impl From<AllocError> for KernelError {
    fn from(e: AllocError) -> KernelError {
        match e {
            AllocError::NoMemory => KernelError::NoMemory,
        }
    }
}

impl From<MapError> for KernelError {
    fn from(e: MapError) -> KernelError {
        KernelError::Map(e)
    }
}

impl From<ProcError> for KernelError {
    fn from(e: ProcError) -> KernelError {
        KernelError::Proc(e)
    }
}
