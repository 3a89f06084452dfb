// SPDX-License-Identifier: MIT OR Apache-2.0

//! The frame translation table (P2M): a dense guest-frame to
//! machine-frame array plus the 3-level index published to the
//! hypervisor so external tooling can translate guest frames.

use crate::address::{Address, VirtAddr};
use crate::error::CoreError;
use crate::hypervisor::{DomId, Hypervisor, MmuUpdate};
use crate::mm::address_space::pfn_to_virt;
use crate::mm::alloc::AllocError;
use crate::mm::memory::MemoryManager;
use crate::mm::pagetable::{PtEntry, PtEntryFlags};
use crate::types::{Mfn, Pfn, P2M_ENTRIES, PAGE_SIZE};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Marker for translation entries without machine backing.
pub const INVALID_P2M_ENTRY: u64 = u64::MAX;

/// One page of the published frame list: 512 machine frame numbers.
/// Layout is a hypervisor contract.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FrameListPage {
    pub entries: [u64; P2M_ENTRIES],
}

impl FrameListPage {
    pub fn new_invalid() -> Self {
        Self {
            entries: [INVALID_P2M_ENTRY; P2M_ENTRIES],
        }
    }

    /// Invalidate entries from `start` to the end of the page.
    pub fn invalidate_tail(&mut self, start: usize) {
        for entry in &mut self.entries[start..] {
            *entry = INVALID_P2M_ENTRY;
        }
    }
}

/// The translation table and its published index. The dense list is
/// chunked into page-sized pieces; `backing` records the machine frame
/// holding each chunk, `base` the chunks' virtual placement.
#[derive(Debug)]
pub struct P2m {
    base: VirtAddr,
    entries: Vec<Mfn>,
    backing: Vec<Mfn>,
    index_pages: BTreeMap<Mfn, FrameListPage>,
    l2_pages: Vec<Mfn>,
    l3_root: Mfn,
    capacity_pages: usize,
}

impl P2m {
    /// Wrap the boot-time frame list.
    pub(crate) fn seed(entries: Vec<Mfn>) -> Self {
        Self {
            base: VirtAddr::null(),
            entries,
            backing: Vec::new(),
            index_pages: BTreeMap::new(),
            l2_pages: Vec::new(),
            l3_root: Mfn::INVALID,
            capacity_pages: 0,
        }
    }

    /// Machine frame backing `pfn`. Out-of-range frame numbers are a
    /// caller bug and trap.
    pub fn translate(&self, pfn: Pfn) -> Mfn {
        self.entries[pfn.index()]
    }

    /// Total translation over all defined entries.
    pub fn get(&self, pfn: Pfn) -> Option<Mfn> {
        self.entries
            .get(pfn.index())
            .copied()
            .filter(|mfn| !mfn.is_invalid())
    }

    pub(crate) fn set_raw(&mut self, pfn: Pfn, mfn: Mfn) {
        self.entries[pfn.index()] = mfn;
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub(crate) fn set_base(&mut self, base: VirtAddr) {
        self.base = base;
    }

    pub fn root(&self) -> Mfn {
        self.l3_root
    }

    pub(crate) fn backing(&self) -> &[Mfn] {
        &self.backing
    }

    pub(crate) fn push_backing(&mut self, mfn: Mfn) {
        self.backing.push(mfn);
    }

    /// Chunks the current virtual placement can hold.
    pub(crate) fn capacity_pages(&self) -> usize {
        self.capacity_pages
    }

    pub(crate) fn set_capacity_pages(&mut self, pages: usize) {
        self.capacity_pages = pages;
    }

    /// Pad the dense list out to its physical chunk boundary; the tail
    /// entries carry no translation.
    pub(crate) fn pad_to_chunk(&mut self) {
        self.entries.resize(self.backing.len() * P2M_ENTRIES, Mfn::INVALID);
    }

    pub(crate) fn install_index(
        &mut self,
        l3_mfn: Mfn,
        l3_page: FrameListPage,
        l2: Vec<(Mfn, FrameListPage)>,
    ) {
        self.index_pages.insert(l3_mfn, l3_page);
        for (mfn, page) in l2 {
            self.l2_pages.push(mfn);
            self.index_pages.insert(mfn, page);
        }
        self.l3_root = l3_mfn;
    }

    /// Hook a fresh level-2 index page into the root.
    pub(crate) fn add_l2_page(&mut self, mfn: Mfn) {
        let slot = self.l2_pages.len();
        self.l2_pages.push(mfn);
        self.index_pages.insert(mfn, FrameListPage::new_invalid());
        if let Some(root) = self.index_pages.get_mut(&self.l3_root) {
            root.entries[slot] = mfn.bits();
        }
    }

    /// Register a fresh chunk of the dense list, backed by `mfn`. The
    /// new entries carry no translation yet.
    pub(crate) fn add_chunk(&mut self, mfn: Mfn) {
        let chunk = self.backing.len();
        self.backing.push(mfn);
        let l2_mfn = self.l2_pages[chunk / P2M_ENTRIES];
        if let Some(page) = self.index_pages.get_mut(&l2_mfn) {
            page.entries[chunk % P2M_ENTRIES] = mfn.bits();
        }
        self.entries
            .resize(self.backing.len() * P2M_ENTRIES, Mfn::INVALID);
    }

    /// Number of chunks currently backed.
    pub(crate) fn chunks(&self) -> usize {
        self.backing.len()
    }

    /// Published index page contents, for inspection.
    pub fn index_page(&self, mfn: Mfn) -> Option<&FrameListPage> {
        self.index_pages.get(&mfn)
    }

    /// Invalidate the index tails beyond `max_pfn`.
    pub(crate) fn invalidate_index_tails(&mut self, max_pfn: usize) {
        if max_pfn == 0 {
            return;
        }
        let last_chunk = (max_pfn - 1) / P2M_ENTRIES;
        if let Some(root) = self.index_pages.get_mut(&self.l3_root) {
            root.invalidate_tail(last_chunk / P2M_ENTRIES + 1);
        }
        let l2_mfn = self.l2_pages[last_chunk / P2M_ENTRIES];
        if let Some(page) = self.index_pages.get_mut(&l2_mfn) {
            page.invalidate_tail(last_chunk % P2M_ENTRIES + 1);
        }
    }
}

impl<H: Hypervisor> MemoryManager<H> {
    pub fn p2m(&self) -> &P2m {
        &self.p2m
    }

    fn boot_alloc_page(&mut self) -> Pfn {
        match self.alloc_page() {
            Some(pfn) => pfn,
            None => panic!("out of memory building the p2m index"),
        }
    }

    /// Build the published index over the seeded list, hand its root
    /// to the hypervisor and relocate the list if the reservation
    /// ceiling outgrows the boot placement.
    pub(crate) fn init_p2m(&mut self, max_pfn: usize) {
        let l3_pfn = self.boot_alloc_page();
        let l3_mfn = self.p2m.translate(l3_pfn);
        let mut l3_page = FrameListPage::new_invalid();
        let mut l2: Vec<(Mfn, FrameListPage)> = Vec::new();

        for chunk in 0..self.p2m.chunks() {
            if chunk % P2M_ENTRIES == 0 {
                let pfn = self.boot_alloc_page();
                let mfn = self.p2m.translate(pfn);
                l3_page.entries[chunk / P2M_ENTRIES] = mfn.bits();
                l2.push((mfn, FrameListPage::new_invalid()));
            }
            if let Some((_, page)) = l2.last_mut() {
                page.entries[chunk % P2M_ENTRIES] = self.p2m.backing()[chunk].bits();
            }
        }
        self.p2m.install_index(l3_mfn, l3_page, l2);

        if self.backend.publishes_p2m() {
            self.hv.publish_p2m_root(l3_mfn, max_pfn);
        }
        self.remap_p2m(max_pfn);
    }

    /// Move the dense list into the kernel virtual area when the boot
    /// placement cannot cover the reservation ceiling.
    pub(crate) fn remap_p2m(&mut self, max_pfn: usize) {
        self.p2m.invalidate_index_tails(max_pfn);

        let ceiling = self.nr_max_pages().max(max_pfn);
        let needed = ceiling.div_ceil(P2M_ENTRIES);
        if needed <= self.p2m.capacity_pages() {
            return;
        }

        let va = self.alloc_virt_kernel(needed);
        let backing = self.p2m.backing().to_vec();
        for (i, &mfn) in backing.iter().enumerate() {
            if let Err(err) = self.map_frame_rw(va + i * PAGE_SIZE, mfn) {
                panic!("cannot relocate the p2m list: {:?}", err);
            }
        }
        self.p2m.set_base(va);
        self.p2m.set_capacity_pages(needed);
        log::info!("P2M list relocated to {:#x}", va.bits());
    }

    /// Grow the translation table (and its published index) to cover
    /// frame numbers up to `target`.
    pub(crate) fn expand_p2m(&mut self, target: usize) -> Result<(), CoreError> {
        assert!(
            target.div_ceil(P2M_ENTRIES) <= self.p2m.capacity_pages(),
            "p2m growth beyond the reservation ceiling"
        );

        while self.p2m.chunks() * P2M_ENTRIES < target {
            let chunk = self.p2m.chunks();
            if chunk % P2M_ENTRIES == 0 {
                let pfn = self.alloc_page().ok_or(AllocError::OutOfMemory)?;
                let mfn = self.p2m.translate(pfn);
                self.p2m.add_l2_page(mfn);
            }
            let pfn = self.alloc_page().ok_or(AllocError::OutOfMemory)?;
            let mfn = self.p2m.translate(pfn);
            self.map_frame_rw(self.p2m.base() + chunk * PAGE_SIZE, mfn)?;
            self.p2m.add_chunk(mfn);
        }

        if self.backend.publishes_p2m() {
            self.hv.publish_p2m_root(self.p2m.root(), target);
        }
        // The new last frame must be mappable 1:1 before it arrives.
        self.ensure(pfn_to_virt(Pfn::new(target - 1)))?;
        Ok(())
    }

    /// Record machine backing for `pfn` and install its 1:1 leaf
    /// mapping. The two views are never updated independently; a
    /// rejection here would leave them split, so it is fatal.
    pub(crate) fn pfn_add(&mut self, pfn: Pfn, mfn: Mfn) {
        self.p2m.set_raw(pfn, mfn);
        let slot = match self.ensure(pfn_to_virt(pfn)) {
            Ok(slot) => slot,
            Err(err) => panic!("no leaf slot for ballooned frame {:#x}: {:?}", pfn, err),
        };
        debug_assert_eq!(slot.level, 0);
        let update = MmuUpdate {
            ptr: slot.ptr(),
            val: PtEntry::new(mfn, PtEntryFlags::data()),
        };
        if let Err(err) =
            self.backend
                .apply_updates(&mut self.hv, &mut self.store, &[update], DomId::SELF)
        {
            panic!("cannot map ballooned frame {:#x}: {:?}", pfn, err);
        }
    }
}
