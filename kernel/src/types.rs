// SPDX-License-Identifier: MIT OR Apache-2.0

use core::fmt;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SHIFT_2M: usize = 21;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_SIZE_2M: usize = 1 << PAGE_SHIFT_2M;

/// Number of entries in a page table page (4KB/8B).
pub const ENTRY_COUNT: usize = 512;

/// Levels of the page-table hierarchy on 64-bit.
pub const PAGETABLE_LEVELS: usize = 4;

/// Machine frame numbers per published P2M frame page (4KB/8B).
pub const P2M_ENTRIES: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageSize {
    Regular,
    Huge,
}

impl From<PageSize> for usize {
    fn from(psize: PageSize) -> Self {
        match psize {
            PageSize::Regular => PAGE_SIZE,
            PageSize::Huge => PAGE_SIZE_2M,
        }
    }
}

/// A guest frame number: dense logical index into the guest's own
/// reservation, valid in `[0, nr_mem_pages)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pfn(usize);

impl Pfn {
    #[inline]
    pub const fn new(pfn: usize) -> Self {
        Self(pfn)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::LowerHex for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A machine frame number: the hypervisor-assigned physical backing of a
/// guest frame. Opaque to the guest; only ever obtained from the
/// hypervisor via the boot frame list or a populate-physmap request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Mfn(u64);

impl Mfn {
    /// Marker stored in the frame translation table for entries that do
    /// not currently have machine backing.
    pub const INVALID: Self = Self(u64::MAX);

    #[inline]
    pub const fn new(mfn: u64) -> Self {
        Self(mfn)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_invalid(self) -> bool {
        self.0 == u64::MAX
    }
}

impl Default for Mfn {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::LowerHex for Mfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
