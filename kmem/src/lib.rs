//! Memory management for the kernel: physical page frame accounting and the
//! two-level page table format.
//!
//! Physical memory is handed out in whole page frames only. The kernel never
//! needs a general-purpose heap, so there is no one.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate static_assertions;

#[macro_use]
extern crate log;

pub mod access;
pub mod addr;
pub mod paging;
pub mod physical;

pub use crate::addr::{Alignable, PhysAddr, VirtAddr};

/// Number of trailing zeros in a page aligned address.
pub const PAGE_ALIGN_BITS: u32 = 12;

/// Size of a normal physical page, 4096 bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_ALIGN_BITS;

const_assert!(page_size_is_power_of_two; PAGE_SIZE & (PAGE_SIZE - 1) == 0);
