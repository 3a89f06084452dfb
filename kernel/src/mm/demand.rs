// SPDX-License-Identifier: MIT OR Apache-2.0

//! Demand-map virtual allocator. There is no free list: a page of the
//! window is free exactly when its leaf entry is not present, so state
//! is rediscovered from the page table on every allocation.

use crate::address::VirtAddr;
use crate::error::CoreError;
use crate::hypervisor::Hypervisor;
use crate::mm::memory::MemoryManager;
use crate::types::PAGE_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DemandMapError {
    /// No run of free pages large enough in the window.
    OutOfSpace,
}

impl From<DemandMapError> for CoreError {
    fn from(err: DemandMapError) -> Self {
        Self::DemandMap(err)
    }
}

/// The demand-map window.
#[derive(Clone, Copy, Debug)]
pub struct DemandMapArea {
    start: VirtAddr,
    pages: usize,
}

impl DemandMapArea {
    pub fn new(start: VirtAddr, pages: usize) -> Self {
        Self { start, pages }
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    pub fn pages(&self) -> usize {
        self.pages
    }
}

impl<H: Hypervisor> MemoryManager<H> {
    /// First-fit scan for `n` unmapped pages at `align`-page
    /// alignment (`align` is a power-of-two page count). The scan
    /// restarts past the colliding mapping, rounded up to alignment.
    pub fn allocate_ondemand(&mut self, n: usize, align: usize) -> Result<VirtAddr, CoreError> {
        let total = self.demand.pages();
        if n == 0 || n > total {
            return Err(DemandMapError::OutOfSpace.into());
        }
        let align = align.max(1);
        debug_assert!(align.is_power_of_two());

        let mut x = 0usize;
        while x + n <= total {
            let mut y = 0;
            while y < n {
                let addr = self.demand.start() + (x + y) * PAGE_SIZE;
                if self.is_mapped(addr) {
                    break;
                }
                y += 1;
            }
            if y == n {
                return Ok(self.demand.start() + x * PAGE_SIZE);
            }
            x = (x + y + 1).next_multiple_of(align);
        }
        log::warn!("Failed to find {} frames in the demand-map area!", n);
        Err(DemandMapError::OutOfSpace.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address_space::{DEMAND_MAP_PAGES, VIRT_DEMAND_AREA};
    use crate::testutils::boot_manager;

    #[test]
    fn allocations_do_not_overlap() {
        let mut mgr = boot_manager(256, 1024);
        let a = mgr.map_zero(3, 1).unwrap();
        let b = mgr.map_zero(3, 1).unwrap();
        assert_eq!(a, VIRT_DEMAND_AREA);
        assert_eq!(b, a + 3 * PAGE_SIZE);
    }

    #[test]
    fn alignment_is_honoured() {
        let mut mgr = boot_manager(256, 1024);
        let _ = mgr.map_zero(1, 1).unwrap();
        let b = mgr.map_zero(4, 4).unwrap();
        assert_eq!(b, VIRT_DEMAND_AREA + 4 * PAGE_SIZE);
    }

    #[test]
    fn exhaustion_reports_out_of_space() {
        let mut mgr = boot_manager(256, 1024);
        let err = mgr.allocate_ondemand(DEMAND_MAP_PAGES + 1, 1).unwrap_err();
        assert_eq!(err, CoreError::DemandMap(DemandMapError::OutOfSpace));
    }

    #[test]
    fn freed_space_is_rediscovered() {
        let mut mgr = boot_manager(256, 1024);
        let a = mgr.map_zero(2, 1).unwrap();
        mgr.unmap_frames(a, 2).unwrap();
        let b = mgr.map_zero(2, 1).unwrap();
        assert_eq!(a, b);
    }
}
