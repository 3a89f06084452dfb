// SPDX-License-Identifier: MIT OR Apache-2.0

//! Page-table pages, entries and walks. Table pages live in the
//! [`PageStore`] arena keyed by the machine frame that holds them;
//! entries store the machine frame of the next level, so a walk never
//! needs a reverse map.

use crate::address::{Address, VirtAddr};
use crate::error::CoreError;
use crate::hypervisor::{DomId, HvError, Hypervisor, MmuUpdate, UpdatePtr};
use crate::mm::address_space::{pfn_to_virt, VIRT_DEMAND_AREA};
use crate::mm::alloc::AllocError;
use crate::mm::mapping::UpdateBatch;
use crate::mm::memory::MemoryManager;
use crate::types::{Mfn, PageSize, Pfn, ENTRY_COUNT, PAGE_SHIFT, PAGE_SIZE, PAGE_SIZE_2M};
use crate::utils::MemoryRegion;
use alloc::collections::BTreeMap;
use bitflags::bitflags;
use core::ops::{Index, IndexMut};

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct PtEntryFlags: u64 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
        const HUGE     = 1 << 7;
    }
}

impl PtEntryFlags {
    /// Flags for a writable data leaf.
    pub fn data() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::ACCESSED
    }

    /// Flags for a read-only data leaf.
    pub fn data_ro() -> Self {
        Self::PRESENT | Self::ACCESSED
    }

    /// Flags for an entry pointing to a lower-level table page.
    pub fn table() -> Self {
        Self::PRESENT | Self::WRITABLE | Self::USER | Self::ACCESSED | Self::DIRTY
    }
}

/// Protections used when hooking a table page serving `level` into its
/// parent (level 0 being a 4K leaf).
fn level_prot(level: usize) -> PtEntryFlags {
    if level == 0 {
        PtEntryFlags::data()
    } else {
        PtEntryFlags::table()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageTableError {
    /// A walk ended on a superpage where a 4K leaf was required.
    NotLeaf,
}

impl From<PageTableError> for CoreError {
    fn from(err: PageTableError) -> Self {
        Self::PageTable(err)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtEntry(u64);

impl PtEntry {
    const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(mfn: Mfn, flags: PtEntryFlags) -> Self {
        Self(((mfn.bits() << PAGE_SHIFT) & Self::ADDR_MASK) | flags.bits())
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_clear(&self) -> bool {
        self.0 == 0
    }

    pub fn flags(&self) -> PtEntryFlags {
        PtEntryFlags::from_bits_truncate(self.0)
    }

    pub fn present(&self) -> bool {
        self.flags().contains(PtEntryFlags::PRESENT)
    }

    pub fn writable(&self) -> bool {
        self.flags().contains(PtEntryFlags::WRITABLE)
    }

    pub fn huge(&self) -> bool {
        self.flags().contains(PtEntryFlags::HUGE)
    }

    /// Machine frame this entry points at.
    pub fn frame(&self) -> Mfn {
        Mfn::new((self.0 & Self::ADDR_MASK) >> PAGE_SHIFT)
    }
}

/// One page worth of page-table entries.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct PtPage {
    entries: [PtEntry; ENTRY_COUNT],
}

impl PtPage {
    pub const fn new() -> Self {
        Self {
            entries: [PtEntry::empty(); ENTRY_COUNT],
        }
    }
}

impl Default for PtPage {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PtPage {
    type Output = PtEntry;

    fn index(&self, index: usize) -> &PtEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PtPage {
    fn index_mut(&mut self, index: usize) -> &mut PtEntry {
        &mut self.entries[index]
    }
}

/// Arena of page-table pages, keyed by backing machine frame.
#[derive(Debug, Default)]
pub struct PageStore {
    pages: BTreeMap<Mfn, PtPage>,
}

impl PageStore {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    pub fn insert_zeroed(&mut self, mfn: Mfn) {
        let old = self.pages.insert(mfn, PtPage::new());
        assert!(old.is_none(), "page-table frame {:#x} reused", mfn);
    }

    pub fn contains(&self, mfn: Mfn) -> bool {
        self.pages.contains_key(&mfn)
    }

    /// Read an entry from a table page that must exist.
    pub fn read(&self, ptr: UpdatePtr) -> PtEntry {
        match self.pages.get(&ptr.table) {
            Some(page) => page[ptr.index],
            None => panic!("read from unknown page-table frame {:#x}", ptr.table),
        }
    }

    /// Write an entry in a table page that must exist. Only for boot
    /// seeding of hypervisor-provided state; everything later goes
    /// through a backend.
    pub(crate) fn set(&mut self, ptr: UpdatePtr, val: PtEntry) {
        match self.pages.get_mut(&ptr.table) {
            Some(page) => page[ptr.index] = val,
            None => panic!("write to unknown page-table frame {:#x}", ptr.table),
        }
    }

    pub fn write(&mut self, ptr: UpdatePtr, val: PtEntry) -> Result<(), HvError> {
        match self.pages.get_mut(&ptr.table) {
            Some(page) => {
                page[ptr.index] = val;
                Ok(())
            }
            None => Err(HvError::BadTarget),
        }
    }

    /// Number of table pages in the arena.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Location of one page-table entry found by a walk. `level` is 0 for
/// a 4K leaf and 1 for a superpage entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PteRef {
    pub table: Mfn,
    pub index: usize,
    pub level: usize,
}

impl PteRef {
    pub fn ptr(self) -> UpdatePtr {
        UpdatePtr {
            table: self.table,
            index: self.index,
        }
    }
}

/// The active page-table hierarchy, identified by its root frame.
#[derive(Clone, Copy, Debug)]
pub struct PageTable {
    root: Mfn,
}

impl PageTable {
    pub fn new(root: Mfn) -> Self {
        Self { root }
    }

    pub fn root(&self) -> Mfn {
        self.root
    }

    /// Walk to the entry mapping `va` without allocating. Returns the
    /// leaf slot even when the leaf entry itself is clear; returns
    /// `None` at the first missing intermediate level.
    pub fn lookup(&self, store: &PageStore, va: VirtAddr) -> Option<PteRef> {
        let mut table = self.root;

        let entry = store.read(UpdatePtr {
            table,
            index: va.to_pgtbl_idx::<3>(),
        });
        if !entry.present() {
            return None;
        }
        table = entry.frame();

        let entry = store.read(UpdatePtr {
            table,
            index: va.to_pgtbl_idx::<2>(),
        });
        if !entry.present() {
            return None;
        }
        table = entry.frame();

        let index = va.to_pgtbl_idx::<1>();
        let entry = store.read(UpdatePtr { table, index });
        if !entry.present() {
            return None;
        }
        if entry.huge() {
            return Some(PteRef {
                table,
                index,
                level: 1,
            });
        }
        table = entry.frame();

        Some(PteRef {
            table,
            index: va.to_pgtbl_idx::<0>(),
            level: 0,
        })
    }
}

impl<H: Hypervisor> MemoryManager<H> {
    /// Non-allocating walk to the entry mapping `va`.
    pub fn lookup(&self, va: VirtAddr) -> Option<PteRef> {
        self.pagetable.lookup(&self.store, va)
    }

    /// Read the entry at a walk result.
    pub fn read_entry(&self, slot: PteRef) -> PtEntry {
        self.store.read(slot.ptr())
    }

    /// Whether `va` currently has a present mapping.
    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.lookup(va)
            .map(|slot| self.read_entry(slot).present())
            .unwrap_or(false)
    }

    /// Turn the frame `pfn` into a page-table page serving `level` and
    /// hook it into `parent` at `index`. Boot-critical: a hypervisor
    /// rejection here leaves nothing to recover, so it is fatal.
    pub(crate) fn new_pt_frame(&mut self, pfn: Pfn, parent: Mfn, index: usize, level: usize) {
        let mfn = self.p2m.translate(pfn);
        let va = pfn_to_virt(pfn);
        log::debug!(
            "Allocating new L{} pt frame for pfn={:#x}, prot={:?}",
            level,
            pfn,
            level_prot(level)
        );
        self.store.insert_zeroed(mfn);

        if self.backend.protects_table_pages() {
            // The frame must lose its writable 1:1 mapping before it
            // can be hooked in as a table page.
            let slot = match self.pagetable.lookup(&self.store, va) {
                Some(slot) => slot,
                None => panic!("pt frame {:#x} outside the mapped 1:1 region", va),
            };
            let update = MmuUpdate {
                ptr: slot.ptr(),
                val: PtEntry::new(mfn, level_prot(level - 1) & !PtEntryFlags::WRITABLE),
            };
            if let Err(err) =
                self.backend
                    .apply_updates(&mut self.hv, &mut self.store, &[update], DomId::SELF)
            {
                panic!("cannot remap pt frame {:#x} read-only: {:?}", va, err);
            }
        }

        let hook = MmuUpdate {
            ptr: UpdatePtr {
                table: parent,
                index,
            },
            val: PtEntry::new(mfn, level_prot(level)),
        };
        if let Err(err) =
            self.backend
                .apply_updates(&mut self.hv, &mut self.store, &[hook], DomId::SELF)
        {
            panic!("cannot hook pt frame {:#x} into hierarchy: {:?}", va, err);
        }
    }

    /// Walk to the leaf slot for `va`, allocating any missing table
    /// pages on the way. Stops early on an existing superpage.
    pub(crate) fn ensure(&mut self, va: VirtAddr) -> Result<PteRef, CoreError> {
        let mut table = self.pagetable.root();
        let indices = [
            va.to_pgtbl_idx::<3>(),
            va.to_pgtbl_idx::<2>(),
            va.to_pgtbl_idx::<1>(),
        ];

        for (i, &index) in indices.iter().enumerate() {
            let level = 3 - i;
            let entry = self.store.read(UpdatePtr { table, index });
            if !entry.present() {
                let pfn = self.alloc_page().ok_or(AllocError::OutOfMemory)?;
                self.new_pt_frame(pfn, table, index, level);
            } else if level == 1 && entry.huge() {
                return Ok(PteRef {
                    table,
                    index,
                    level: 1,
                });
            }
            table = self.store.read(UpdatePtr { table, index }).frame();
        }

        Ok(PteRef {
            table,
            index: va.to_pgtbl_idx::<0>(),
            level: 0,
        })
    }

    /// Extend the 1:1 mapping up to `max_pfn`, consuming table frames
    /// from `cursor`. Mapping starts at the cursor itself: frames the
    /// boot tables already cover are skipped, and every table frame
    /// consumed here keeps the read-only self-map it receives instead.
    pub(crate) fn build_initial_mapping(&mut self, cursor: &mut usize, max_pfn: usize) {
        let huge = self.backend.map_granularity() == PageSize::Huge;
        let mut pfn_to_map = *cursor;
        if huge {
            pfn_to_map &= !(ENTRY_COUNT - 1);
        }

        log::info!(
            "Mapping memory range {:#x} - {:#x}",
            pfn_to_virt(Pfn::new(pfn_to_map)).bits(),
            pfn_to_virt(Pfn::new(max_pfn)).bits()
        );

        let mut batch = UpdateBatch::new();
        while pfn_to_map < max_pfn {
            let va = pfn_to_virt(Pfn::new(pfn_to_map));
            let root = self.pagetable.root();

            let idx3 = va.to_pgtbl_idx::<3>();
            if !self.store.read(UpdatePtr { table: root, index: idx3 }).present() {
                let pfn = self.take_boot_frame(cursor);
                self.new_pt_frame(pfn, root, idx3, 3);
            }
            let l3 = self.store.read(UpdatePtr { table: root, index: idx3 }).frame();

            let idx2 = va.to_pgtbl_idx::<2>();
            if !self.store.read(UpdatePtr { table: l3, index: idx2 }).present() {
                let pfn = self.take_boot_frame(cursor);
                self.new_pt_frame(pfn, l3, idx2, 2);
            }
            let l2 = self.store.read(UpdatePtr { table: l3, index: idx2 }).frame();

            let idx1 = va.to_pgtbl_idx::<1>();
            if huge {
                let entry = self.store.read(UpdatePtr { table: l2, index: idx1 });
                if entry.present() && entry.huge() {
                    pfn_to_map += ENTRY_COUNT;
                    continue;
                }
                if !entry.present()
                    && pfn_to_map % ENTRY_COUNT == 0
                    && pfn_to_map + ENTRY_COUNT <= max_pfn
                {
                    let mfn = self.p2m.translate(Pfn::new(pfn_to_map));
                    batch.push(MmuUpdate {
                        ptr: UpdatePtr { table: l2, index: idx1 },
                        val: PtEntry::new(mfn, PtEntryFlags::data() | PtEntryFlags::HUGE),
                    });
                    if batch.is_full() {
                        self.flush_batch(&mut batch);
                    }
                    pfn_to_map += ENTRY_COUNT;
                    continue;
                }
                // A span the boot tables partially cover with 4K
                // leaves, or one truncated by max_pfn: map it at 4K.
            }

            if !self.store.read(UpdatePtr { table: l2, index: idx1 }).present() {
                let pfn = self.take_boot_frame(cursor);
                self.new_pt_frame(pfn, l2, idx1, 1);
            }
            let l1 = self.store.read(UpdatePtr { table: l2, index: idx1 }).frame();

            let idx0 = va.to_pgtbl_idx::<0>();
            if !self.store.read(UpdatePtr { table: l1, index: idx0 }).present() {
                let mfn = self.p2m.translate(Pfn::new(pfn_to_map));
                batch.push(MmuUpdate {
                    ptr: UpdatePtr { table: l1, index: idx0 },
                    val: PtEntry::new(mfn, PtEntryFlags::data()),
                });
                if batch.is_full() {
                    self.flush_batch(&mut batch);
                }
            }
            pfn_to_map += 1;
        }
        self.flush_batch(&mut batch);
    }

    fn take_boot_frame(&mut self, cursor: &mut usize) -> Pfn {
        let pfn = Pfn::new(*cursor);
        *cursor += 1;
        pfn
    }

    /// Strip the writable bit from every mapping in `region`, leaving
    /// the shared-info page alone. Flushes once at the end.
    pub fn mark_read_only(&mut self, region: MemoryRegion<VirtAddr>) {
        let start = region.start().page_align();
        let end = region.end().page_align_up();
        log::info!("Marking read-only: {:#x} - {:#x}", start.bits(), end.bits());

        let mut batch = UpdateBatch::new();
        let mut va = start;
        while va < end {
            if va == self.shared_info {
                log::info!("skipped shared-info page at {:#x}", va.bits());
                va = va + PAGE_SIZE;
                continue;
            }
            let Some(slot) = self.pagetable.lookup(&self.store, va) else {
                va = va + PAGE_SIZE;
                continue;
            };
            let entry = self.store.read(slot.ptr());
            if entry.present() {
                batch.push(MmuUpdate {
                    ptr: slot.ptr(),
                    val: PtEntry::new(entry.frame(), entry.flags() & !PtEntryFlags::WRITABLE),
                });
                if batch.is_full() {
                    self.flush_batch(&mut batch);
                }
            }
            va = if slot.level == 1 {
                VirtAddr::new((va.bits() + PAGE_SIZE_2M) & !(PAGE_SIZE_2M - 1))
            } else {
                va + PAGE_SIZE
            };
        }
        self.flush_batch(&mut batch);
        self.backend.flush_all(&mut self.hv);
    }

    /// Retire the boot identity window's writable view of frame 0: the
    /// frame becomes the shared zero frame and virtual 0 is unmapped so
    /// null dereferences fault.
    pub(crate) fn clear_bootstrap(&mut self) {
        self.zero_mfn = self.p2m.translate(Pfn::new(0));
        if let Some(slot) = self.pagetable.lookup(&self.store, VirtAddr::null()) {
            let batch = [(VirtAddr::null(), slot.ptr())];
            if let Err(err) = self
                .backend
                .clear_leaves(&mut self.hv, &mut self.store, &batch)
            {
                log::error!("Unable to unmap NULL page: {:?}", err);
            }
        }
    }

    /// Reserve `n_pages` of virtual space in the kernel area. The
    /// window is never reclaimed.
    pub fn alloc_virt_kernel(&mut self, n_pages: usize) -> VirtAddr {
        let addr = self.kernel_area_next;
        let next = addr + n_pages * PAGE_SIZE;
        assert!(next <= VIRT_DEMAND_AREA, "kernel virtual area exhausted");
        self.kernel_area_next = next;
        addr
    }
}
