// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test doubles for the hypervisor interface and canned boot setups.

use crate::address::VirtAddr;
use crate::backend::HypercallBackend;
use crate::hypervisor::{DomId, FlushMode, HvError, Hypervisor, MmuUpdate};
use crate::mm::memory::{BootConfig, MemoryManager};
use crate::mm::pagetable::PtEntry;
use crate::types::Mfn;
use crate::utils::MemoryRegion;
use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;

/// Machine frame numbers start far away from guest frame numbers so a
/// mixup of the two spaces shows up immediately.
const MFN_BASE: u64 = 0x1_0000;

#[derive(Debug)]
pub struct MockHypervisor {
    next_mfn: u64,
    handed_out: BTreeSet<u64>,
    rejected: BTreeSet<u64>,
    pub initial_reservation: usize,
    pub max_reservation: usize,
    /// Frames `populate_physmap` may still grant in total.
    pub grant_limit: usize,
    pub fail_reservation_query: bool,
    pub mmu_update_calls: usize,
    pub updates_applied: usize,
    pub va_mapping_calls: usize,
    pub flushes: usize,
    pub populate_calls: usize,
    pub published_root: Option<(Mfn, usize)>,
}

impl MockHypervisor {
    pub fn new(initial: usize, max: usize) -> Self {
        Self {
            next_mfn: MFN_BASE,
            handed_out: BTreeSet::new(),
            rejected: BTreeSet::new(),
            initial_reservation: initial,
            max_reservation: max,
            grant_limit: usize::MAX,
            fail_reservation_query: false,
            mmu_update_calls: 0,
            updates_applied: 0,
            va_mapping_calls: 0,
            flushes: 0,
            populate_calls: 0,
            published_root: None,
        }
    }

    fn take_mfn(&mut self) -> Mfn {
        let mfn = self.next_mfn;
        self.next_mfn += 1;
        assert!(
            self.handed_out.insert(mfn),
            "machine frame {:#x} handed out twice",
            mfn
        );
        Mfn::new(mfn)
    }

    /// Machine frame the boot list assigned to guest frame `pfn`.
    pub fn boot_mfn(&self, pfn: usize) -> Mfn {
        Mfn::new(MFN_BASE + pfn as u64)
    }

    /// Reject any future update whose value points at `mfn`.
    pub fn reject_frame(&mut self, mfn: Mfn) {
        self.rejected.insert(mfn.bits());
    }
}

impl Hypervisor for MockHypervisor {
    fn mmu_update(&mut self, updates: &[MmuUpdate], _dom: DomId) -> Result<(), HvError> {
        self.mmu_update_calls += 1;
        for update in updates {
            if self.rejected.contains(&update.val.frame().bits()) {
                return Err(HvError::UpdateRejected);
            }
        }
        self.updates_applied += updates.len();
        Ok(())
    }

    fn update_va_mapping(
        &mut self,
        _va: VirtAddr,
        val: PtEntry,
        _flush: FlushMode,
    ) -> Result<(), HvError> {
        self.va_mapping_calls += 1;
        if self.rejected.contains(&val.frame().bits()) {
            return Err(HvError::UpdateRejected);
        }
        Ok(())
    }

    fn flush_tlb(&mut self) {
        self.flushes += 1;
    }

    fn current_reservation(&mut self, _dom: DomId) -> Result<usize, HvError> {
        if self.fail_reservation_query {
            Err(HvError::QueryFailed)
        } else {
            Ok(self.initial_reservation)
        }
    }

    fn maximum_reservation(&mut self, _dom: DomId) -> Result<usize, HvError> {
        Ok(self.max_reservation)
    }

    fn machine_frame_list(&mut self, count: usize) -> Vec<Mfn> {
        (0..count).map(|_| self.take_mfn()).collect()
    }

    fn populate_physmap(&mut self, _dom: DomId, extents: &mut [u64]) -> usize {
        self.populate_calls += 1;
        let n = extents.len().min(self.grant_limit);
        for slot in extents[..n].iter_mut() {
            *slot = self.take_mfn().bits();
        }
        self.grant_limit -= n;
        n
    }

    fn publish_p2m_root(&mut self, root: Mfn, max_pfn: usize) {
        self.published_root = Some((root, max_pfn));
    }
}

pub fn boot_config() -> BootConfig {
    BootConfig {
        reserved_pfns: 32,
        readonly: MemoryRegion::new(VirtAddr::null(), 0),
        shared_info: VirtAddr::new(0x1000),
    }
}

/// A fully booted manager over the mock, paravirtual backend.
pub fn boot_manager(nr_pages: usize, max_pages: usize) -> MemoryManager<MockHypervisor> {
    let hv = MockHypervisor::new(nr_pages, max_pages);
    MemoryManager::bootstrap(hv, Box::new(HypercallBackend::new()), boot_config())
        .expect("bootstrap failed")
}
