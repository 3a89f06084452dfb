// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::types::{Pfn, PAGE_SHIFT, PAGE_SIZE};
use core::fmt;
use core::ops;

pub type InnerAddr = usize;

/// Common operations on both address spaces. Addresses are plain
/// integers under the hood; the newtypes only prevent mixing the two
/// spaces by accident.
pub trait Address:
    Copy + From<InnerAddr> + Into<InnerAddr> + PartialEq + Eq + PartialOrd + Ord
{
    fn bits(&self) -> InnerAddr {
        (*self).into()
    }

    fn is_null(&self) -> bool {
        self.bits() == 0
    }

    fn align_up(&self, align: InnerAddr) -> Self {
        Self::from((self.bits() + (align - 1)) & !(align - 1))
    }

    fn page_align_up(&self) -> Self {
        self.align_up(PAGE_SIZE)
    }

    fn page_align(&self) -> Self {
        Self::from(self.bits() & !(PAGE_SIZE - 1))
    }

    fn is_aligned(&self, align: InnerAddr) -> bool {
        (self.bits() & (align - 1)) == 0
    }

    fn is_page_aligned(&self) -> bool {
        self.is_aligned(PAGE_SIZE)
    }

    fn checked_add(&self, off: InnerAddr) -> Option<Self> {
        self.bits().checked_add(off).map(|addr| Self::from(addr))
    }

    fn page_offset(&self) -> usize {
        self.bits() & (PAGE_SIZE - 1)
    }

    fn pfn(&self) -> Pfn {
        Pfn::new(self.bits() >> PAGE_SHIFT)
    }
}

/// A guest-virtual address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(InnerAddr);

impl VirtAddr {
    #[inline]
    pub const fn new(v: InnerAddr) -> Self {
        Self(v)
    }

    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Index into the page table at level `L`, with `L = 0` being the
    /// leaf level.
    #[inline]
    pub const fn to_pgtbl_idx<const L: usize>(&self) -> usize {
        (self.0 >> (PAGE_SHIFT + L * 9)) & 0x1ffusize
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<InnerAddr> for VirtAddr {
    fn from(addr: InnerAddr) -> Self {
        Self(addr)
    }
}

impl From<VirtAddr> for InnerAddr {
    fn from(addr: VirtAddr) -> InnerAddr {
        addr.0
    }
}

impl ops::Add<usize> for VirtAddr {
    type Output = VirtAddr;

    fn add(self, other: usize) -> Self {
        VirtAddr(self.0 + other)
    }
}

impl ops::Sub<VirtAddr> for VirtAddr {
    type Output = usize;

    fn sub(self, other: VirtAddr) -> usize {
        self.0 - other.0
    }
}

impl Address for VirtAddr {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_addr_alignment() {
        let unaligned = VirtAddr::new(0x1234);
        assert!(!unaligned.is_page_aligned());
        assert_eq!(unaligned.page_align(), VirtAddr::new(0x1000));
        assert_eq!(unaligned.page_align_up(), VirtAddr::new(0x2000));
        assert_eq!(unaligned.page_offset(), 0x234);
    }

    #[test]
    fn test_pgtbl_idx() {
        let va = VirtAddr::new(0x4000_1234_5000);
        assert_eq!(va.to_pgtbl_idx::<0>(), (0x4000_1234_5000usize >> 12) & 0x1ff);
        assert_eq!(va.to_pgtbl_idx::<1>(), (0x4000_1234_5000usize >> 21) & 0x1ff);
        assert_eq!(va.to_pgtbl_idx::<2>(), (0x4000_1234_5000usize >> 30) & 0x1ff);
        assert_eq!(va.to_pgtbl_idx::<3>(), (0x4000_1234_5000usize >> 39) & 0x1ff);
    }

    #[test]
    fn test_pfn() {
        assert_eq!(VirtAddr::new(0x5000).pfn(), Pfn::new(5));
        assert_eq!(VirtAddr::new(0x5fff).pfn(), Pfn::new(5));
    }
}
