// SPDX-License-Identifier: MIT OR Apache-2.0

//! The paging backend seam. All page-table writes funnel through a
//! [`PagingBackend`] so the same construction and mapping code serves
//! both paravirtual guests (tables owned by the hypervisor, updated by
//! validated batches) and guests with hardware-assisted paging (tables
//! written directly).

use crate::address::VirtAddr;
use crate::hypervisor::{DomId, FlushMode, HvError, Hypervisor, MmuUpdate, UpdatePtr};
use crate::mm::pagetable::{PageStore, PtEntry};
use crate::types::PageSize;

pub trait PagingBackend: core::fmt::Debug {
    /// Apply a batch of page-table updates. `dom` names the domain
    /// owning the mapped frames; almost always [`DomId::SELF`].
    fn apply_updates(
        &mut self,
        hv: &mut dyn Hypervisor,
        store: &mut PageStore,
        updates: &[MmuUpdate],
        dom: DomId,
    ) -> Result<(), HvError>;

    /// Write a single leaf entry and invalidate the translation for the
    /// page it maps.
    fn write_leaf(
        &mut self,
        hv: &mut dyn Hypervisor,
        store: &mut PageStore,
        va: VirtAddr,
        ptr: UpdatePtr,
        val: PtEntry,
    ) -> Result<(), HvError>;

    /// Clear a batch of leaf entries, invalidating each translation.
    fn clear_leaves(
        &mut self,
        hv: &mut dyn Hypervisor,
        store: &mut PageStore,
        batch: &[(VirtAddr, UpdatePtr)],
    ) -> Result<(), HvError>;

    /// Flush all cached translations.
    fn flush_all(&mut self, hv: &mut dyn Hypervisor);

    /// Granularity of the initial physical mapping.
    fn map_granularity(&self) -> PageSize;

    /// Whether page-table pages must be mapped read-only in the 1:1
    /// region before they can be hooked into the hierarchy.
    fn protects_table_pages(&self) -> bool;

    /// Whether the P2M index must be published to the hypervisor.
    fn publishes_p2m(&self) -> bool;
}

/// Backend for paravirtual paging: every update is validated by the
/// hypervisor before it lands in the arena.
#[derive(Clone, Copy, Debug, Default)]
pub struct HypercallBackend;

impl HypercallBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PagingBackend for HypercallBackend {
    fn apply_updates(
        &mut self,
        hv: &mut dyn Hypervisor,
        store: &mut PageStore,
        updates: &[MmuUpdate],
        dom: DomId,
    ) -> Result<(), HvError> {
        hv.mmu_update(updates, dom)?;
        for update in updates {
            store.write(update.ptr, update.val)?;
        }
        Ok(())
    }

    fn write_leaf(
        &mut self,
        hv: &mut dyn Hypervisor,
        store: &mut PageStore,
        va: VirtAddr,
        ptr: UpdatePtr,
        val: PtEntry,
    ) -> Result<(), HvError> {
        hv.update_va_mapping(va, val, FlushMode::Invlpg)?;
        store.write(ptr, val)
    }

    fn clear_leaves(
        &mut self,
        hv: &mut dyn Hypervisor,
        store: &mut PageStore,
        batch: &[(VirtAddr, UpdatePtr)],
    ) -> Result<(), HvError> {
        for &(va, ptr) in batch {
            hv.update_va_mapping(va, PtEntry::empty(), FlushMode::Invlpg)?;
            store.write(ptr, PtEntry::empty())?;
        }
        Ok(())
    }

    fn flush_all(&mut self, hv: &mut dyn Hypervisor) {
        hv.flush_tlb();
    }

    fn map_granularity(&self) -> PageSize {
        PageSize::Regular
    }

    fn protects_table_pages(&self) -> bool {
        true
    }

    fn publishes_p2m(&self) -> bool {
        true
    }
}

/// Backend for hardware-assisted paging: the guest owns its tables and
/// writes them without hypervisor involvement.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectBackend;

impl DirectBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PagingBackend for DirectBackend {
    fn apply_updates(
        &mut self,
        _hv: &mut dyn Hypervisor,
        store: &mut PageStore,
        updates: &[MmuUpdate],
        _dom: DomId,
    ) -> Result<(), HvError> {
        for update in updates {
            store.write(update.ptr, update.val)?;
        }
        Ok(())
    }

    fn write_leaf(
        &mut self,
        _hv: &mut dyn Hypervisor,
        store: &mut PageStore,
        _va: VirtAddr,
        ptr: UpdatePtr,
        val: PtEntry,
    ) -> Result<(), HvError> {
        store.write(ptr, val)
    }

    fn clear_leaves(
        &mut self,
        _hv: &mut dyn Hypervisor,
        store: &mut PageStore,
        batch: &[(VirtAddr, UpdatePtr)],
    ) -> Result<(), HvError> {
        for &(_va, ptr) in batch {
            store.write(ptr, PtEntry::empty())?;
        }
        Ok(())
    }

    fn flush_all(&mut self, _hv: &mut dyn Hypervisor) {
        // A root reload on the hardware path; nothing to track here.
    }

    fn map_granularity(&self) -> PageSize {
        PageSize::Huge
    }

    fn protects_table_pages(&self) -> bool {
        false
    }

    fn publishes_p2m(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address_space::pfn_to_virt;
    use crate::mm::memory::MemoryManager;
    use crate::mm::pagetable::PtEntryFlags;
    use crate::testutils::{boot_config, boot_manager, MockHypervisor};
    use crate::types::{Mfn, Pfn};
    use alloc::boxed::Box;

    fn direct_manager() -> MemoryManager<MockHypervisor> {
        MemoryManager::bootstrap(
            MockHypervisor::new(1024, 2048),
            Box::new(DirectBackend::new()),
            boot_config(),
        )
        .unwrap()
    }

    #[test]
    fn direct_backend_needs_no_hypercalls() {
        let mgr = direct_manager();
        assert_eq!(mgr.hv.mmu_update_calls, 0);
        assert_eq!(mgr.hv.va_mapping_calls, 0);
        assert!(mgr.hv.published_root.is_none());
    }

    #[test]
    fn direct_backend_maps_superpages() {
        let mgr = direct_manager();
        let slot = mgr.lookup(pfn_to_virt(Pfn::new(600))).unwrap();
        assert_eq!(slot.level, 1);
        let entry = mgr.read_entry(slot);
        assert!(entry.huge());
        assert_eq!(entry.frame(), mgr.p2m().translate(Pfn::new(512)));
    }

    #[test]
    fn hypercall_backend_validates_before_applying() {
        let mut mgr = boot_manager(256, 1024);
        mgr.hv.reject_frame(Mfn::new(0x4242));

        let va = mgr.allocate_ondemand(1, 1).unwrap();
        let mut errs = [None];
        mgr.map_frames(
            va,
            &[Mfn::new(0x4242)],
            1,
            0,
            0,
            DomId::SELF,
            Some(&mut errs),
            PtEntryFlags::data(),
        )
        .unwrap();

        assert_eq!(errs[0], Some(HvError::UpdateRejected));
        // the rejected update never landed in the arena
        assert!(!mgr.is_mapped(va));
    }
}
