// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixed virtual-address layout. Guest frames are mapped 1:1 starting
//! at virtual zero; the windows above it hold relocated bookkeeping
//! structures, the demand-map area and the heap.

use crate::address::VirtAddr;
use crate::types::{Pfn, PAGE_SHIFT};

const PHYSMAP_BASE: usize = 0;
const KERNEL_AREA_BASE: usize = 0x3000_0000_0000;
const DEMAND_AREA_BASE: usize = 0x4000_0000_0000;
const HEAP_AREA_BASE: usize = 0x5000_0000_0000;

/// Base of the 1:1 physical mapping.
pub const VIRT_PHYSMAP_BASE: VirtAddr = VirtAddr::new(PHYSMAP_BASE);

/// Bump-allocated window for relocated kernel structures (P2M list,
/// allocator bitmap).
pub const VIRT_KERNEL_AREA: VirtAddr = VirtAddr::new(KERNEL_AREA_BASE);

/// Window served by the demand-map allocator.
pub const VIRT_DEMAND_AREA: VirtAddr = VirtAddr::new(DEMAND_AREA_BASE);
pub const DEMAND_MAP_PAGES: usize = 0x10000;

/// Reserved for the heap; not managed here.
pub const VIRT_HEAP_AREA: VirtAddr = VirtAddr::new(HEAP_AREA_BASE);
pub const HEAP_PAGES: usize = 0x10000;

/// Largest frame number the 1:1 window can map.
pub const MAX_PHYSMAP_PAGES: usize = (KERNEL_AREA_BASE - PHYSMAP_BASE) >> PAGE_SHIFT;

#[inline]
pub fn pfn_to_virt(pfn: Pfn) -> VirtAddr {
    VirtAddr::new(PHYSMAP_BASE + (pfn.index() << PAGE_SHIFT))
}

#[inline]
pub fn virt_to_pfn(vaddr: VirtAddr) -> Pfn {
    Pfn::new((Into::<usize>::into(vaddr) - PHYSMAP_BASE) >> PAGE_SHIFT)
}
