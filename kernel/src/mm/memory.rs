// SPDX-License-Identifier: MIT OR Apache-2.0

//! The memory-management context. One [`MemoryManager`] owns the
//! hypervisor connection, the paging backend, the page-table arena and
//! all bookkeeping; every operation goes through it instead of global
//! singletons.

use crate::address::VirtAddr;
use crate::backend::PagingBackend;
use crate::error::CoreError;
use crate::hypervisor::{DomId, Hypervisor, UpdatePtr};
use crate::mm::address_space::{
    pfn_to_virt, DEMAND_MAP_PAGES, MAX_PHYSMAP_PAGES, VIRT_DEMAND_AREA, VIRT_KERNEL_AREA,
};
use crate::mm::alloc::FrameAllocator;
use crate::mm::balloon::Balloon;
use crate::mm::demand::DemandMapArea;
use crate::mm::p2m::P2m;
use crate::mm::pagetable::{PageStore, PageTable, PtEntry, PtEntryFlags};
use crate::types::{Mfn, Pfn, P2M_ENTRIES, PAGE_SIZE};
use crate::utils::MemoryRegion;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Frames past the reserved image the boot tables pre-map, so table
/// frames taken from the cursor are always reachable 1:1.
const BOOT_PT_SLACK: usize = 64;

/// Boot-time facts the embedding environment provides.
#[derive(Clone, Copy, Debug)]
pub struct BootConfig {
    /// Frames below this index hold the kernel image and boot
    /// structures; they are never returned to the pool.
    pub reserved_pfns: usize,
    /// Virtual span remapped read-only once construction is done
    /// (text and rodata).
    pub readonly: MemoryRegion<VirtAddr>,
    /// The hypervisor shared-info page; stays writable.
    pub shared_info: VirtAddr,
}

#[derive(Debug)]
pub struct MemoryManager<H: Hypervisor> {
    pub(crate) hv: H,
    pub(crate) backend: Box<dyn PagingBackend>,
    pub(crate) store: PageStore,
    pub(crate) pagetable: PageTable,
    pub(crate) p2m: P2m,
    pub(crate) alloc: FrameAllocator,
    pub(crate) demand: DemandMapArea,
    pub(crate) balloon: Balloon,
    pub(crate) zero_mfn: Mfn,
    pub(crate) kernel_area_next: VirtAddr,
    pub(crate) fault_depth: usize,
    pub(crate) irqs_disabled: bool,
    pub(crate) shared_info: VirtAddr,
}

impl<H: Hypervisor> MemoryManager<H> {
    /// Bring up the memory core: rebuild the boot mapping state, map
    /// the rest of the reservation, seed the allocator, publish the
    /// P2M index and size the bookkeeping for the reservation ceiling.
    ///
    /// Hypervisor rejections on this path leave nothing to recover and
    /// are fatal; only the initial reservation query reports an error.
    pub fn bootstrap(
        mut hv: H,
        backend: Box<dyn PagingBackend>,
        config: BootConfig,
    ) -> Result<Self, CoreError> {
        let nr_pages = hv.current_reservation(DomId::SELF)?;
        let max_pfn = nr_pages.min(MAX_PHYSMAP_PAGES);
        if max_pfn < nr_pages {
            log::warn!(
                "Trimming reservation to {} pages, the most the 1:1 window can map",
                max_pfn
            );
        }
        assert!(
            max_pfn > config.reserved_pfns + BOOT_PT_SLACK,
            "not enough memory to boot"
        );

        let mut frames = hv.machine_frame_list(max_pfn);
        frames.truncate(max_pfn);
        let p2m = P2m::seed(frames);
        let mut store = PageStore::new();

        // The hypervisor enters us with the first frames already
        // mapped; rebuild that state in the arena. The cursor walks
        // the frames just past the image, handing them out as table
        // frames.
        let mut cursor = config.reserved_pfns;
        let boot_mapped = (config.reserved_pfns + BOOT_PT_SLACK).min(max_pfn);
        let root_pfn = cursor;
        cursor += 1;
        let root_mfn = p2m.translate(Pfn::new(root_pfn));
        store.insert_zeroed(root_mfn);
        build_boot_tables(&mut store, &p2m, root_mfn, &mut cursor, boot_mapped);

        let mut mgr = Self {
            hv,
            backend,
            store,
            pagetable: PageTable::new(root_mfn),
            p2m,
            alloc: FrameAllocator::new_all_used(0, VirtAddr::null(), Vec::new()),
            demand: DemandMapArea::new(VIRT_DEMAND_AREA, DEMAND_MAP_PAGES),
            balloon: Balloon {
                nr_max_pages: 0,
                nr_mem_pages: 0,
                in_progress: false,
            },
            zero_mfn: Mfn::INVALID,
            kernel_area_next: VIRT_KERNEL_AREA,
            fault_depth: 0,
            irqs_disabled: false,
            shared_info: config.shared_info,
        };

        mgr.build_initial_mapping(&mut cursor, max_pfn);
        mgr.clear_bootstrap();
        if config.readonly.len() > 0 {
            mgr.mark_read_only(config.readonly);
        }

        // The boot frame list occupies the next cursor frames, 1:1.
        let chunks = max_pfn.div_ceil(P2M_ENTRIES);
        let p2m_base = pfn_to_virt(Pfn::new(cursor));
        for _ in 0..chunks {
            let mfn = mgr.p2m.translate(Pfn::new(cursor));
            mgr.p2m.push_backing(mfn);
            cursor += 1;
        }
        mgr.p2m.set_base(p2m_base);
        mgr.p2m.set_capacity_pages(chunks);
        mgr.p2m.pad_to_chunk();

        // Allocator bitmap, likewise from cursor frames.
        let bitmap_pages = max_pfn.div_ceil(PAGE_SIZE * 8).max(1);
        let bitmap_base = pfn_to_virt(Pfn::new(cursor));
        let mut bitmap_backing = Vec::new();
        for _ in 0..bitmap_pages {
            bitmap_backing.push(mgr.p2m.translate(Pfn::new(cursor)));
            cursor += 1;
        }
        mgr.alloc =
            FrameAllocator::new_all_used(bitmap_pages * PAGE_SIZE * 8, bitmap_base, bitmap_backing);
        mgr.alloc.free_range(cursor, max_pfn);

        mgr.balloon.nr_mem_pages = max_pfn;
        mgr.balloon.nr_max_pages = max_pfn;
        mgr.query_ceiling();

        mgr.init_p2m(max_pfn);
        mgr.remap_alloc_bitmap();

        log::info!(
            "Demand map pfns at {:#x}-{:#x}",
            VIRT_DEMAND_AREA,
            VIRT_DEMAND_AREA + DEMAND_MAP_PAGES * PAGE_SIZE
        );
        Ok(mgr)
    }

    pub fn nr_free_pages(&self) -> usize {
        self.alloc.nr_free_pages()
    }

    /// Frames the allocator bitmap can account for.
    pub fn alloc_capacity(&self) -> usize {
        self.alloc.capacity()
    }

    /// Take a frame from the pool. The frame is zeroed.
    pub fn alloc_page(&mut self) -> Option<Pfn> {
        self.alloc.alloc_page()
    }

    pub fn free_page(&mut self, pfn: Pfn) {
        self.alloc.free_page(pfn);
    }

    /// The shared all-zero frame backing copy-on-write mappings.
    pub fn zero_frame(&self) -> Mfn {
        self.zero_mfn
    }

    /// Whether `mfn` currently backs a page-table page.
    pub fn is_table_frame(&self, mfn: Mfn) -> bool {
        self.store.contains(mfn)
    }

    pub fn set_irqs_disabled(&mut self, disabled: bool) {
        self.irqs_disabled = disabled;
    }
}

/// Rebuild the hypervisor-provided boot tables: a 1:1 writable map of
/// `[0, end_pfn)`, with table frames taken from the cursor.
fn build_boot_tables(
    store: &mut PageStore,
    p2m: &P2m,
    root: Mfn,
    cursor: &mut usize,
    end_pfn: usize,
) {
    for pfn in 0..end_pfn {
        let va = pfn_to_virt(Pfn::new(pfn));
        let mut table = root;
        let indices = [
            va.to_pgtbl_idx::<3>(),
            va.to_pgtbl_idx::<2>(),
            va.to_pgtbl_idx::<1>(),
        ];
        for index in indices {
            let ptr = UpdatePtr { table, index };
            let entry = store.read(ptr);
            table = if entry.present() {
                entry.frame()
            } else {
                let mfn = p2m.translate(Pfn::new(*cursor));
                *cursor += 1;
                store.insert_zeroed(mfn);
                store.set(ptr, PtEntry::new(mfn, PtEntryFlags::table()));
                mfn
            };
        }
        store.set(
            UpdatePtr {
                table,
                index: va.to_pgtbl_idx::<0>(),
            },
            PtEntry::new(p2m.translate(Pfn::new(pfn)), PtEntryFlags::data()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::boot_manager;

    #[test]
    fn boot_small_domain() {
        // 256-frame domain, ceiling 1024: the canonical boot scenario.
        let mgr = boot_manager(256, 1024);

        assert_eq!(mgr.nr_mem_pages(), 256);
        assert_eq!(mgr.nr_max_pages(), 1024);
        assert!(!mgr.p2m().translate(Pfn::new(255)).is_invalid());
        assert!(mgr.p2m().get(Pfn::new(256)).is_none());

        // every owned frame has a 1:1 mapping
        for pfn in 0..256usize {
            assert!(mgr.lookup(pfn_to_virt(Pfn::new(pfn))).is_some());
        }

        // the index went out with the boot reservation size
        assert_eq!(mgr.hv.published_root.unwrap().1, 256);
    }

    #[test]
    fn boot_frees_everything_past_bookkeeping() {
        let mgr = boot_manager(256, 1024);
        // reserved image + root + boot tables + p2m chunk + bitmap
        // page + index pages are all accounted as used
        let used = 256 - mgr.nr_free_pages();
        assert!(used > 32, "used only {} frames", used);
        assert!(used < 64, "used {} frames", used);
    }

    #[test]
    fn reservation_query_failure_is_reported() {
        use crate::backend::HypercallBackend;
        use crate::testutils::MockHypervisor;

        let mut hv = MockHypervisor::new(256, 1024);
        hv.fail_reservation_query = true;
        let result = MemoryManager::bootstrap(
            hv,
            Box::new(HypercallBackend::new()),
            crate::testutils::boot_config(),
        );
        assert!(result.is_err());
    }
}
