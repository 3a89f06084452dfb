// SPDX-License-Identifier: MIT OR Apache-2.0

//! The frame mapping service: batched installation and removal of leaf
//! mappings, plus the convenience entry points that combine demand-map
//! reservation with mapping.

use crate::address::{Address, VirtAddr};
use crate::error::CoreError;
use crate::hypervisor::{DomId, HvError, Hypervisor, MmuUpdate, UpdatePtr};
use crate::mm::memory::MemoryManager;
use crate::mm::pagetable::{PageTableError, PtEntry, PtEntryFlags};
use crate::types::{Mfn, PAGE_SIZE};

/// Leaf updates staged per submission.
pub const MAP_BATCH: usize = 512;

const UNMAP_BATCH: usize = 64;

/// Fixed-capacity staging buffer for batched page-table updates.
#[derive(Debug)]
pub struct UpdateBatch {
    updates: [MmuUpdate; MAP_BATCH],
    len: usize,
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self {
            updates: [MmuUpdate::EMPTY; MAP_BATCH],
            len: 0,
        }
    }

    pub fn push(&mut self, update: MmuUpdate) {
        debug_assert!(self.len < MAP_BATCH);
        self.updates[self.len] = update;
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == MAP_BATCH
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn as_slice(&self) -> &[MmuUpdate] {
        &self.updates[..self.len]
    }
}

impl Default for UpdateBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hypervisor> MemoryManager<H> {
    /// Submit and drain a staged batch. Used on construction paths
    /// where a rejected update leaves nothing to recover.
    pub(crate) fn flush_batch(&mut self, batch: &mut UpdateBatch) {
        if batch.is_empty() {
            return;
        }
        if let Err(err) =
            self.backend
                .apply_updates(&mut self.hv, &mut self.store, batch.as_slice(), DomId::SELF)
        {
            panic!("page-table update batch rejected: {:?}", err);
        }
        batch.clear();
    }

    /// Map `n` pages starting at `va` onto frames taken from `mfns`:
    /// page `i` maps `mfns[i * stride] + i * incr`. With `err`
    /// supplied, updates are submitted one page at a time and
    /// rejections are recorded per page; without it a rejection is
    /// fatal. Allocation failure for intermediate tables is an error
    /// either way.
    #[allow(clippy::too_many_arguments)]
    pub fn map_frames(
        &mut self,
        va: VirtAddr,
        mfns: &[Mfn],
        n: usize,
        stride: usize,
        incr: u64,
        dom: DomId,
        mut err: Option<&mut [Option<HvError>]>,
        prot: PtEntryFlags,
    ) -> Result<(), CoreError> {
        if n == 0 {
            return Ok(());
        }
        assert!(va.is_page_aligned());
        if let Some(slots) = err.as_deref_mut() {
            assert!(slots.len() >= n);
            for slot in &mut slots[..n] {
                *slot = None;
            }
        }

        let mut batch = UpdateBatch::new();
        let mut done = 0;
        while done < n {
            let todo = if err.is_some() {
                1
            } else {
                (n - done).min(MAP_BATCH)
            };
            batch.clear();
            for i in 0..todo {
                let page = done + i;
                let slot = self.ensure(va + page * PAGE_SIZE)?;
                if slot.level != 0 {
                    return Err(PageTableError::NotLeaf.into());
                }
                let mfn = Mfn::new(mfns[page * stride].bits() + (page as u64) * incr);
                batch.push(MmuUpdate {
                    ptr: slot.ptr(),
                    val: PtEntry::new(mfn, prot),
                });
            }
            if let Err(e) =
                self.backend
                    .apply_updates(&mut self.hv, &mut self.store, batch.as_slice(), dom)
            {
                match err.as_deref_mut() {
                    Some(slots) => slots[done] = Some(e),
                    None => panic!(
                        "mapping batch of {} frames at {:#x} failed: {:?}",
                        todo,
                        va + done * PAGE_SIZE,
                        e
                    ),
                }
            }
            done += todo;
        }
        Ok(())
    }

    /// Remove the leaf mappings of `num` pages starting at `va`,
    /// invalidating each translation. Pages without a mapping are
    /// skipped.
    pub fn unmap_frames(&mut self, va: VirtAddr, num: usize) -> Result<(), CoreError> {
        assert!(va.is_page_aligned());
        let empty = (VirtAddr::null(), MmuUpdate::EMPTY.ptr);
        let mut pending: [(VirtAddr, UpdatePtr); UNMAP_BATCH] = [empty; UNMAP_BATCH];
        let mut count = 0;

        for page in 0..num {
            let addr = va + page * PAGE_SIZE;
            let Some(slot) = self.lookup(addr) else {
                continue;
            };
            if slot.level != 0 {
                return Err(PageTableError::NotLeaf.into());
            }
            pending[count] = (addr, slot.ptr());
            count += 1;
            if count == UNMAP_BATCH {
                self.backend
                    .clear_leaves(&mut self.hv, &mut self.store, &pending[..count])?;
                count = 0;
            }
        }
        if count > 0 {
            self.backend
                .clear_leaves(&mut self.hv, &mut self.store, &pending[..count])?;
        }
        Ok(())
    }

    /// Reserve demand-map space for `n` pages at `align`-page
    /// alignment and map it. On a per-page rejection reported through
    /// `err` the range stays reserved and partially mapped; the caller
    /// inspects the error slots and unmaps.
    #[allow(clippy::too_many_arguments)]
    pub fn map_frames_ex(
        &mut self,
        mfns: &[Mfn],
        n: usize,
        stride: usize,
        incr: u64,
        align: usize,
        dom: DomId,
        err: Option<&mut [Option<HvError>]>,
        prot: PtEntryFlags,
    ) -> Result<VirtAddr, CoreError> {
        let va = self.allocate_ondemand(n, align)?;
        self.map_frames(va, mfns, n, stride, incr, dom, err, prot)?;
        Ok(va)
    }

    /// Map one frame writable at a fixed address.
    pub fn map_frame_rw(&mut self, va: VirtAddr, mfn: Mfn) -> Result<(), CoreError> {
        self.map_frames(va, &[mfn], 1, 0, 0, DomId::SELF, None, PtEntryFlags::data())
    }

    /// Reserve and map `n` pages of demand-map space onto the shared
    /// zero frame, read-only. A write faults and gets a private frame.
    pub fn map_zero(&mut self, n: usize, align: usize) -> Result<VirtAddr, CoreError> {
        let zero = self.zero_frame();
        self.map_frames_ex(
            &[zero],
            n,
            0,
            0,
            align,
            DomId::SELF,
            None,
            PtEntryFlags::data_ro(),
        )
    }
}
