// SPDX-License-Identifier: MIT OR Apache-2.0

//! The frame allocator: a page-backed used-bit map over the guest's
//! frames. The map itself lives in ordinary guest pages so the balloon
//! can grow it one page at a time and relocate its virtual placement
//! when the reservation ceiling outgrows the boot placement.
//!
//! Frames handed out by [`FrameAllocator::alloc_page`] are zeroed; both
//! freshly granted frames (hypervisor convention) and recycled frames
//! rely on this.

use crate::address::VirtAddr;
use crate::error::CoreError;
use crate::types::{Mfn, Pfn, PAGE_SIZE};
use alloc::vec;
use alloc::vec::Vec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    OutOfMemory,
}

impl From<AllocError> for CoreError {
    fn from(err: AllocError) -> Self {
        Self::Alloc(err)
    }
}

const BITS_PER_WORD: usize = u64::BITS as usize;
const WORDS_PER_PAGE: usize = PAGE_SIZE / 8;
const BITS_PER_PAGE: usize = PAGE_SIZE * 8;

/// A set bit means the frame is in use or not (yet) owned by the
/// guest; only frames explicitly returned to the pool allocate.
#[derive(Debug)]
pub struct FrameAllocator {
    bits: Vec<u64>,
    base: VirtAddr,
    backing: Vec<Mfn>,
    nr_free: usize,
}

impl FrameAllocator {
    /// A map sized to cover `capacity` frames (rounded up to whole
    /// pages), with every frame marked used. `base` is the virtual
    /// placement of the map's pages, `backing` their machine frames.
    pub fn new_all_used(capacity: usize, base: VirtAddr, backing: Vec<Mfn>) -> Self {
        let pages = capacity.div_ceil(BITS_PER_PAGE);
        debug_assert_eq!(backing.len(), pages);
        Self {
            bits: vec![!0u64; pages * WORDS_PER_PAGE],
            base,
            backing,
            nr_free: 0,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.bits.len() * 8
    }

    /// Frames the map can currently account for.
    pub fn capacity(&self) -> usize {
        self.bits.len() * BITS_PER_WORD
    }

    pub fn nr_free_pages(&self) -> usize {
        self.nr_free
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn set_base(&mut self, base: VirtAddr) {
        self.base = base;
    }

    pub fn backing(&self) -> &[Mfn] {
        &self.backing
    }

    fn mask(lo: usize, hi: usize) -> u64 {
        if hi - lo == BITS_PER_WORD {
            !0u64
        } else {
            ((1u64 << (hi - lo)) - 1) << lo
        }
    }

    fn test(&self, idx: usize) -> bool {
        self.bits[idx / BITS_PER_WORD] & (1u64 << (idx % BITS_PER_WORD)) != 0
    }

    /// Return the frames `[first, end)` to the pool.
    pub fn free_range(&mut self, first: usize, end: usize) {
        let mut idx = first;
        while idx < end {
            let word = idx / BITS_PER_WORD;
            let lo = idx % BITS_PER_WORD;
            let hi = BITS_PER_WORD.min(lo + (end - idx));
            let mask = Self::mask(lo, hi);
            debug_assert_eq!(self.bits[word] & mask, mask);
            self.bits[word] &= !mask;
            idx += hi - lo;
        }
        self.nr_free += end - first;
    }

    /// Take the lowest free frame out of the pool. The frame is zeroed.
    pub fn alloc_page(&mut self) -> Option<Pfn> {
        for (word, bits) in self.bits.iter_mut().enumerate() {
            if *bits != !0u64 {
                let bit = bits.trailing_ones() as usize;
                *bits |= 1u64 << bit;
                self.nr_free -= 1;
                return Some(Pfn::new(word * BITS_PER_WORD + bit));
            }
        }
        None
    }

    pub fn free_page(&mut self, pfn: Pfn) {
        let idx = pfn.index();
        debug_assert!(self.test(idx), "double free of pfn {:#x}", pfn);
        self.bits[idx / BITS_PER_WORD] &= !(1u64 << (idx % BITS_PER_WORD));
        self.nr_free += 1;
    }

    /// Extend the map by one page of all-used bits, backed by `mfn`.
    /// The caller has already mapped `mfn` at the end of the map's
    /// virtual placement.
    pub fn grow_page(&mut self, mfn: Mfn) {
        self.bits.extend(core::iter::repeat(!0u64).take(WORDS_PER_PAGE));
        self.backing.push(mfn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_used(capacity: usize) -> FrameAllocator {
        let pages = capacity.div_ceil(BITS_PER_PAGE);
        let backing = (0..pages).map(|i| Mfn::new(0x100 + i as u64)).collect();
        FrameAllocator::new_all_used(capacity, VirtAddr::null(), backing)
    }

    #[test]
    fn alloc_and_free() {
        let mut alloc = all_used(BITS_PER_PAGE);
        assert_eq!(alloc.nr_free_pages(), 0);
        assert!(alloc.alloc_page().is_none());

        alloc.free_range(10, 20);
        assert_eq!(alloc.nr_free_pages(), 10);

        let pfn = alloc.alloc_page().unwrap();
        assert_eq!(pfn, Pfn::new(10));
        assert_eq!(alloc.nr_free_pages(), 9);

        alloc.free_page(pfn);
        assert_eq!(alloc.nr_free_pages(), 10);
    }

    #[test]
    fn free_range_crosses_words() {
        let mut alloc = all_used(BITS_PER_PAGE);
        alloc.free_range(60, 200);
        assert_eq!(alloc.nr_free_pages(), 140);
        for _ in 0..140 {
            assert!(alloc.alloc_page().is_some());
        }
        assert!(alloc.alloc_page().is_none());
    }

    #[test]
    fn alloc_returns_lowest_free() {
        let mut alloc = all_used(BITS_PER_PAGE);
        alloc.free_range(100, 103);
        alloc.free_range(5, 6);
        assert_eq!(alloc.alloc_page(), Some(Pfn::new(5)));
        assert_eq!(alloc.alloc_page(), Some(Pfn::new(100)));
    }

    #[test]
    fn grow_extends_capacity() {
        let mut alloc = all_used(BITS_PER_PAGE);
        assert_eq!(alloc.capacity(), BITS_PER_PAGE);
        alloc.grow_page(Mfn::new(0x200));
        assert_eq!(alloc.capacity(), 2 * BITS_PER_PAGE);
        assert_eq!(alloc.size_bytes(), 2 * PAGE_SIZE);
        assert_eq!(alloc.backing().len(), 2);
        // new bits arrive all-used
        assert_eq!(alloc.nr_free_pages(), 0);
        alloc.free_range(BITS_PER_PAGE, BITS_PER_PAGE + 4);
        assert_eq!(alloc.nr_free_pages(), 4);
    }
}
