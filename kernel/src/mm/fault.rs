// SPDX-License-Identifier: MIT OR Apache-2.0

//! Page-fault handling. The only fault resolved here is a write to a
//! page mapped read-only onto the shared zero frame; everything else
//! is fatal, with a page-table walk dumped for diagnosis.

use crate::address::{Address, VirtAddr};
use crate::hypervisor::{Hypervisor, UpdatePtr};
use crate::mm::memory::MemoryManager;
use crate::mm::pagetable::{PtEntry, PtEntryFlags};
use bitfield_struct::bitfield;

/// Hardware error code pushed for a page fault.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultCode {
    pub present: bool,
    pub write: bool,
    pub user: bool,
    #[bits(29)]
    _rsvd: u32,
}

impl<H: Hypervisor> MemoryManager<H> {
    /// Page-fault entry point. Returns normally only when the fault
    /// was a resolvable copy-on-write; anything else does not come
    /// back.
    pub fn handle_page_fault(&mut self, va: VirtAddr, code: PageFaultCode) {
        if code.write() && self.handle_cow(va) {
            return;
        }
        if self.fault_depth > 0 {
            panic!(
                "page fault at {:#x} while handling a page fault (access to invalid memory?)",
                va
            );
        }
        self.fault_depth += 1;
        log::error!("Page fault at {:#x}, error code {:#x}", va, u32::from(code));
        self.dump_walk(va);
        panic!("unhandled page fault at {:#x}", va);
    }

    /// Give a zero-backed page its own writable frame. Exactly one
    /// page changes; other mappings of the zero frame are untouched.
    /// Returns false when the fault is not ours to fix.
    pub fn handle_cow(&mut self, va: VirtAddr) -> bool {
        let va = va.page_align();
        let Some(slot) = self.lookup(va) else {
            return false;
        };
        let entry = self.read_entry(slot);
        if !entry.present() || slot.level != 0 || entry.frame() != self.zero_frame() {
            return false;
        }

        // The replacement arrives zeroed, so contents are preserved.
        let Some(pfn) = self.alloc_page() else {
            return false;
        };
        let mfn = self.p2m.translate(pfn);
        let val = PtEntry::new(mfn, PtEntryFlags::data());
        match self
            .backend
            .write_leaf(&mut self.hv, &mut self.store, va, slot.ptr(), val)
        {
            Ok(()) => true,
            Err(err) => {
                log::error!("Map of private frame at {:#x} failed: {:?}", va, err);
                self.free_page(pfn);
                false
            }
        }
    }

    /// Log the page-table entries on the walk to `va`.
    pub fn dump_walk(&self, va: VirtAddr) {
        let mut table = self.pagetable.root();
        let indices = [
            (3usize, va.to_pgtbl_idx::<3>()),
            (2, va.to_pgtbl_idx::<2>()),
            (1, va.to_pgtbl_idx::<1>()),
            (0, va.to_pgtbl_idx::<0>()),
        ];
        log::error!("Page walk for {:#x}:", va);
        for (level, index) in indices {
            let entry: PtEntry = self.store.read(UpdatePtr { table, index });
            log::error!("  L{}[{:#05x}] = {:#018x}", level + 1, index, entry.raw());
            if !entry.present() || (level == 1 && entry.huge()) {
                break;
            }
            table = entry.frame();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::boot_manager;
    use crate::types::PAGE_SIZE;

    fn write_fault() -> PageFaultCode {
        PageFaultCode::new().with_present(true).with_write(true)
    }

    #[test]
    fn cow_write_gets_private_frame() {
        let mut mgr = boot_manager(256, 1024);
        let va = mgr.map_zero(3, 1).unwrap();
        let free_before = mgr.nr_free_pages();

        mgr.handle_page_fault(va + PAGE_SIZE + 0x123, write_fault());

        // one frame copied, neighbours still shared and read-only
        assert_eq!(mgr.nr_free_pages(), free_before - 1);
        let entry = mgr.read_entry(mgr.lookup(va + PAGE_SIZE).unwrap());
        assert!(entry.writable());
        assert!(entry.frame() != mgr.zero_frame());
        for off in [0, 2 * PAGE_SIZE] {
            let entry = mgr.read_entry(mgr.lookup(va + off).unwrap());
            assert!(!entry.writable());
            assert_eq!(entry.frame(), mgr.zero_frame());
        }
    }

    #[test]
    fn cow_is_idempotent_per_page() {
        let mut mgr = boot_manager(256, 1024);
        let va = mgr.map_zero(1, 1).unwrap();
        assert!(mgr.handle_cow(va));
        let frame = mgr.read_entry(mgr.lookup(va).unwrap()).frame();
        // second write fault on the same page is not a CoW any more
        assert!(!mgr.handle_cow(va));
        assert_eq!(mgr.read_entry(mgr.lookup(va).unwrap()).frame(), frame);
    }

    #[test]
    fn cow_ignores_ordinary_mappings() {
        let mut mgr = boot_manager(256, 1024);
        let pfn = mgr.alloc_page().unwrap();
        let mfn = mgr.p2m().translate(pfn);
        let va = mgr.map_zero(1, 1).unwrap() + PAGE_SIZE;
        // an unrelated writable mapping right after the zero page
        mgr.map_frame_rw(va, mfn).unwrap();
        assert!(!mgr.handle_cow(va));
    }

    #[test]
    #[should_panic(expected = "unhandled page fault")]
    fn unmapped_access_is_fatal() {
        let mut mgr = boot_manager(256, 1024);
        mgr.handle_page_fault(VirtAddr::new(0xdead_b000), PageFaultCode::new());
    }

    #[test]
    #[should_panic(expected = "unhandled page fault")]
    fn read_of_zero_page_does_not_cow() {
        // A read fault never allocates; only writes trigger CoW.
        let mut mgr = boot_manager(256, 1024);
        let va = mgr.map_zero(1, 1).unwrap();
        mgr.handle_page_fault(va, PageFaultCode::new().with_present(true));
    }
}
