// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::address::Address;
use crate::types::PAGE_SIZE;

/// An abstraction over a memory region, expressed by a typed start
/// address and a length in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryRegion<A> {
    start: A,
    end: A,
}

impl<A: Address> MemoryRegion<A> {
    /// Create a new region from a start address and a length.
    ///
    /// # Examples
    ///
    /// ```
    /// use guestcore::address::VirtAddr;
    /// use guestcore::utils::MemoryRegion;
    ///
    /// let region = MemoryRegion::new(VirtAddr::new(0x1000), 0x2000);
    /// assert!(region.contains(VirtAddr::new(0x1fff)));
    /// assert!(!region.contains(VirtAddr::new(0x3000)));
    /// ```
    pub fn new(start: A, len: usize) -> Self {
        let end = A::from(start.bits() + len);
        Self { start, end }
    }

    /// Create a new region from two addresses; `end` is exclusive.
    pub fn from_addresses(start: A, end: A) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> A {
        self.start
    }

    pub fn end(&self) -> A {
        self.end
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.end.bits().saturating_sub(self.start.bits())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `addr` lies within the region.
    pub fn contains(&self, addr: A) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Whether the two regions share at least one byte.
    pub fn overlap(&self, other: &Self) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Number of whole pages needed to cover the region.
    pub fn page_count(&self) -> usize {
        self.len().div_ceil(PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::VirtAddr;

    #[test]
    fn test_overlap() {
        let a = MemoryRegion::new(VirtAddr::new(0x1000), 0x3000);
        let b = MemoryRegion::new(VirtAddr::new(0x3fff), 0x1000);
        let c = MemoryRegion::new(VirtAddr::new(0x4000), 0x1000);
        assert!(a.overlap(&b));
        assert!(!a.overlap(&c));
    }

    #[test]
    fn test_page_count() {
        let region = MemoryRegion::new(VirtAddr::new(0x1000), 0x2001);
        assert_eq!(region.page_count(), 3);
        assert!(MemoryRegion::new(VirtAddr::new(0x1000), 0).is_empty());
    }
}
