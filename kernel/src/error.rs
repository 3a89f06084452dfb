// SPDX-License-Identifier: MIT OR Apache-2.0

//! Everything that can go wrong when interacting with the memory core
//! funnels into [`CoreError`]. Modules define their own leaf error
//! enums and provide `From` impls so `?` works across boundaries; only
//! conditions a caller can meaningfully react to get a variant of their
//! own.

use crate::hypervisor::HvError;
use crate::mm::alloc::AllocError;
use crate::mm::demand::DemandMapError;
use crate::mm::pagetable::PageTableError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoreError {
    // Errors from the hypervisor interface
    Hv(HvError),
    // Errors from the frame allocator
    Alloc(AllocError),
    // Errors from page-table walks and updates
    PageTable(PageTableError),
    // Errors from the demand-map virtual allocator
    DemandMap(DemandMapError),
    // Generic memory error
    Mem,
    // Invalid address, usually provided by the caller
    InvalidAddress,
}
