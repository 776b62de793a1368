//! Newtype wrappers that make it harder to accidentally confuse physical and
//! virtual addresses.

use core::fmt;
use core::ops;

/// A virtual address. Its validity depends on the current page mapping.
#[repr(C)]
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct VirtAddr(pub usize);

/// A physical address. Whether it is accessible depends on the current page
/// mapping.
#[repr(C)]
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct PhysAddr(pub usize);

/// Something (usually addresses or sizes) that is alignable to a certain
/// alignment represented in the same type and usually a power of two.
pub trait Alignable {
    type Alignment;

    /// Return the smallest `x` that is a multiple of `alignment` such that `x >= num`.
    fn align_up(self, alignment: Self::Alignment) -> Self;

    /// Return the largest `x` that is a multiple of `alignment` such that `x <= num`.
    fn align_down(self, alignment: Self::Alignment) -> Self;
}

impl Alignable for usize {
    type Alignment = usize;

    fn align_up(self, alignment: usize) -> usize {
        if alignment == 0 {
            self
        } else {
            let mask = alignment - 1;
            assert!(alignment & mask == 0, "alignment must be power of two");
            let padding = alignment - (self & mask);
            self + (padding & mask)
        }
    }

    fn align_down(self, alignment: usize) -> usize {
        if alignment == 0 {
            self
        } else {
            let mask = alignment - 1;
            assert!(alignment & mask == 0, "alignment must be power of two");
            self - (self & mask)
        }
    }
}

macro_rules! impl_addr_arith {
    ($addr:tt) => {
        impl Alignable for $addr {
            type Alignment = usize;

            fn align_up(self, alignment: usize) -> Self {
                $addr(self.0.align_up(alignment))
            }

            fn align_down(self, alignment: usize) -> Self {
                $addr(self.0.align_down(alignment))
            }
        }

        impl ops::Add<usize> for $addr {
            type Output = $addr;

            fn add(self, other: usize) -> Self::Output {
                $addr(self.0 + other)
            }
        }

        impl ops::AddAssign<usize> for $addr {
            fn add_assign(&mut self, other: usize) {
                self.0 += other;
            }
        }

        impl ops::Sub<$addr> for $addr {
            type Output = usize;

            fn sub(self, other: $addr) -> usize {
                self.0 - other.0
            }
        }

        impl fmt::LowerHex for $addr {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

impl_addr_arith!(VirtAddr);
impl_addr_arith!(PhysAddr);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn align_down_test() {
        assert_eq!(23_usize.align_down(8), 16);
        assert_eq!(24_usize.align_down(8), 24);
        assert_eq!(25_usize.align_down(8), 24);

        // edge cases
        assert_eq!(23_usize.align_down(0), 23);
        assert_eq!(0_usize.align_down(0), 0);
    }

    #[test]
    fn align_up_test() {
        assert_eq!(23_usize.align_up(8), 24);
        assert_eq!(24_usize.align_up(8), 24);
        assert_eq!(25_usize.align_up(8), 32);

        // edge cases
        assert_eq!(23_usize.align_up(0), 23);
        assert_eq!(0_usize.align_up(0), 0);
    }

    #[test]
    fn addr_arith() {
        assert_eq!(PhysAddr(0x4000) + 0x20, PhysAddr(0x4020));
        assert_eq!(PhysAddr(0x4020) - PhysAddr(0x4000), 0x20);
        assert_eq!(VirtAddr(0x1FFF).align_down(0x1000), VirtAddr(0x1000));
    }
}
