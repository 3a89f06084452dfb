// SPDX-License-Identifier: MIT OR Apache-2.0

//! The balloon controller: grow-only extension of the guest's memory
//! reservation up to the hypervisor's ceiling, driven reactively by
//! allocation pressure.

use crate::address::Address;
use crate::error::CoreError;
use crate::hypervisor::{DomId, Hypervisor};
use crate::mm::alloc::AllocError;
use crate::mm::memory::MemoryManager;
use crate::types::{Mfn, Pfn, PAGE_SIZE};

/// Most frames requested from the hypervisor in one batch.
pub const BALLOON_BATCH_FRAMES: usize = 64;

/// Frames kept free for the grow path's own bookkeeping needs, so
/// growing never starves itself.
pub const BALLOON_EMERGENCY_PAGES: usize = 64;

#[derive(Debug)]
pub(crate) struct Balloon {
    pub(crate) nr_max_pages: usize,
    pub(crate) nr_mem_pages: usize,
    pub(crate) in_progress: bool,
}

impl<H: Hypervisor> MemoryManager<H> {
    /// Frames currently in the reservation.
    pub fn nr_mem_pages(&self) -> usize {
        self.balloon.nr_mem_pages
    }

    /// Administrative reservation ceiling.
    pub fn nr_max_pages(&self) -> usize {
        self.balloon.nr_max_pages
    }

    /// Ask the hypervisor for the reservation ceiling. On failure the
    /// ceiling stays at the current reservation and the balloon is
    /// effectively disabled.
    pub(crate) fn query_ceiling(&mut self) {
        match self.hv.maximum_reservation(DomId::SELF) {
            Ok(max) => {
                self.balloon.nr_max_pages = max;
                log::info!("Maximum memory size: {} pages", max);
            }
            Err(err) => log::error!("Could not get maximum reservation: {:?}", err),
        }
    }

    /// Grow the frame bitmap until it covers `target_frames`, one page
    /// at a time. A failed page mapping is rolled back.
    pub(crate) fn ensure_bitmap_capacity(&mut self, target_frames: usize) -> Result<(), CoreError> {
        while self.alloc.capacity() < target_frames {
            let pfn = self.alloc.alloc_page().ok_or(AllocError::OutOfMemory)?;
            let mfn = self.p2m.translate(pfn);
            let va = self.alloc.base() + self.alloc.size_bytes();
            if let Err(err) = self.map_frame_rw(va, mfn) {
                self.alloc.free_page(pfn);
                return Err(err);
            }
            self.alloc.grow_page(mfn);
        }
        Ok(())
    }

    /// Move the frame bitmap into the kernel virtual area when the
    /// reservation ceiling outgrows the boot placement.
    pub(crate) fn remap_alloc_bitmap(&mut self) {
        let ceiling = self.balloon.nr_max_pages;
        if self.alloc.capacity() >= ceiling {
            return;
        }
        let pages = ceiling.div_ceil(PAGE_SIZE * 8);
        let va = self.alloc_virt_kernel(pages);
        let backing = self.alloc.backing().to_vec();
        for (i, &mfn) in backing.iter().enumerate() {
            if let Err(err) = self.map_frame_rw(va + i * PAGE_SIZE, mfn) {
                panic!("cannot relocate the frame bitmap: {:?}", err);
            }
        }
        self.alloc.set_base(va);
        log::info!("Frame bitmap relocated to {:#x}", va.bits());
    }

    /// Ask the hypervisor for up to `n_pages` more frames, clamped to
    /// the batch size and the remaining ceiling headroom. Bookkeeping
    /// (bitmap, translation table) is extended before the request so a
    /// grant can never arrive untracked. Returns the number of frames
    /// actually granted; the reservation never shrinks.
    pub fn grow(&mut self, n_pages: usize) -> Result<usize, CoreError> {
        let headroom = self
            .balloon
            .nr_max_pages
            .saturating_sub(self.balloon.nr_mem_pages);
        let n = n_pages.min(headroom).min(BALLOON_BATCH_FRAMES);
        if n == 0 {
            return Ok(0);
        }

        let first = self.balloon.nr_mem_pages;
        self.ensure_bitmap_capacity(first + n)?;
        self.expand_p2m(first + n)?;

        let mut extents = [0u64; BALLOON_BATCH_FRAMES];
        for (i, slot) in extents[..n].iter_mut().enumerate() {
            *slot = (first + i) as u64;
        }
        let granted = self.hv.populate_physmap(DomId::SELF, &mut extents[..n]);

        for (i, &mfn) in extents[..granted].iter().enumerate() {
            let pfn = Pfn::new(first + i);
            self.pfn_add(pfn, Mfn::new(mfn));
            self.alloc.free_page(pfn);
        }
        self.balloon.nr_mem_pages += granted;
        if granted < n {
            log::error!("Balloon: got {} frames of {} requested", granted, n);
        }
        Ok(granted)
    }

    /// Make sure `needed` frames can be allocated, growing the
    /// reservation on demand while keeping the emergency reserve.
    /// Answers optimistically while a grow is already underway or
    /// interrupts are off, since growing is not possible then.
    pub fn check_pressure(&mut self, needed: usize) -> bool {
        if self.alloc.nr_free_pages() >= needed + BALLOON_EMERGENCY_PAGES {
            return true;
        }
        if self.balloon.in_progress || self.irqs_disabled {
            return true;
        }

        self.balloon.in_progress = true;
        while self.alloc.nr_free_pages() < needed + BALLOON_EMERGENCY_PAGES {
            let want = needed + BALLOON_EMERGENCY_PAGES - self.alloc.nr_free_pages();
            match self.grow(want) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) => {
                    log::warn!("Balloon grow failed: {:?}", err);
                    break;
                }
            }
        }
        self.balloon.in_progress = false;

        self.alloc.nr_free_pages() >= needed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::boot_manager;

    #[test]
    fn grow_clamps_to_batch() {
        let mut mgr = boot_manager(256, 1024);
        let free_before = mgr.nr_free_pages();
        let granted = mgr.grow(1000).unwrap();
        assert_eq!(granted, BALLOON_BATCH_FRAMES);
        assert_eq!(mgr.nr_mem_pages(), 256 + BALLOON_BATCH_FRAMES);
        assert_eq!(mgr.nr_free_pages(), free_before + BALLOON_BATCH_FRAMES);
    }

    #[test]
    fn grow_clamps_to_ceiling() {
        let mut mgr = boot_manager(256, 288);
        assert_eq!(mgr.grow(1000).unwrap(), 32);
        assert_eq!(mgr.nr_mem_pages(), 288);
        // at the ceiling nothing more is requested
        let calls = mgr.hv.populate_calls;
        assert_eq!(mgr.grow(1).unwrap(), 0);
        assert_eq!(mgr.hv.populate_calls, calls);
    }

    #[test]
    fn reservation_is_monotonic() {
        let mut mgr = boot_manager(256, 1024);
        let mut last = mgr.nr_mem_pages();
        for _ in 0..5 {
            let granted = mgr.grow(50).unwrap();
            assert!(mgr.nr_mem_pages() == last + granted);
            assert!(mgr.nr_mem_pages() >= last);
            last = mgr.nr_mem_pages();
        }
    }

    #[test]
    fn partial_grants_are_accepted() {
        let mut mgr = boot_manager(256, 4096);
        mgr.hv.grant_limit = 10;
        assert_eq!(mgr.grow(64).unwrap(), 10);
        assert_eq!(mgr.nr_mem_pages(), 266);
        assert_eq!(mgr.grow(64).unwrap(), 0);
        assert_eq!(mgr.nr_mem_pages(), 266);
    }

    #[test]
    fn pressure_loop_stops_when_grants_dry_up() {
        let mut mgr = boot_manager(256, 100_000);
        mgr.hv.grant_limit = 500;
        let free_before = mgr.nr_free_pages();

        assert!(!mgr.check_pressure(1000));

        // several clamped batches ran, then the well ran dry
        assert!(mgr.hv.populate_calls > 1);
        assert_eq!(mgr.nr_mem_pages(), 256 + 500);
        assert!(mgr.nr_free_pages() < free_before + 500 + BALLOON_EMERGENCY_PAGES);
    }

    #[test]
    fn pressure_is_satisfied_within_ceiling() {
        let mut mgr = boot_manager(256, 4096);
        let needed = mgr.nr_free_pages() + 100;
        assert!(mgr.check_pressure(needed));
        assert!(mgr.nr_free_pages() >= needed);
    }

    #[test]
    fn pressure_is_optimistic_with_interrupts_off() {
        let mut mgr = boot_manager(256, 1024);
        mgr.set_irqs_disabled(true);
        let calls = mgr.hv.populate_calls;
        assert!(mgr.check_pressure(1_000_000));
        assert_eq!(mgr.hv.populate_calls, calls);
    }

    #[test]
    fn bitmap_grows_with_reservation() {
        // A tiny boot bitmap page covers 32768 frames; push past it.
        let mut mgr = boot_manager(256, 40_000);
        let mut granted = 0;
        while granted < 33_000 {
            let n = mgr.grow(BALLOON_BATCH_FRAMES).unwrap();
            assert!(n > 0);
            granted += n;
        }
        assert!(mgr.alloc_capacity() >= 256 + 33_000);
    }
}
