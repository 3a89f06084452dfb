// SPDX-License-Identifier: MIT OR Apache-2.0

//! The hypervisor interface the memory core consumes. The guest never
//! issues hypercalls directly; everything goes through [`Hypervisor`],
//! which a platform crate implements over the real transport and the
//! test suite implements with a mock.

use crate::address::VirtAddr;
use crate::error::CoreError;
use crate::mm::pagetable::PtEntry;
use crate::types::Mfn;
use alloc::vec::Vec;

/// Domain identifier for targeted memory operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct DomId(pub u16);

impl DomId {
    /// The calling domain itself.
    pub const SELF: Self = Self(0x7ff0);
}

/// Machine location of one page-table entry: the machine frame holding
/// the table page plus the entry index within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpdatePtr {
    pub table: Mfn,
    pub index: usize,
}

/// A single element of a batched page-table update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmuUpdate {
    pub ptr: UpdatePtr,
    pub val: PtEntry,
}

impl MmuUpdate {
    pub const EMPTY: Self = Self {
        ptr: UpdatePtr {
            table: Mfn::INVALID,
            index: 0,
        },
        val: PtEntry::empty(),
    };
}

/// TLB maintenance requested alongside a single-entry update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    None,
    Invlpg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HvError {
    /// The hypervisor refused a page-table update batch.
    UpdateRejected,
    /// An update named a frame the hypervisor does not consider a valid
    /// target for this domain.
    BadTarget,
    /// A reservation query failed.
    QueryFailed,
}

impl From<HvError> for CoreError {
    fn from(err: HvError) -> Self {
        Self::Hv(err)
    }
}

pub trait Hypervisor: core::fmt::Debug {
    /// Validate and apply a batch of page-table updates. The batch is
    /// all-or-nothing: on error none of the updates took effect.
    fn mmu_update(&mut self, updates: &[MmuUpdate], dom: DomId) -> Result<(), HvError>;

    /// Update the leaf entry mapping `va` and perform the requested TLB
    /// maintenance in a single operation.
    fn update_va_mapping(
        &mut self,
        va: VirtAddr,
        val: PtEntry,
        flush: FlushMode,
    ) -> Result<(), HvError>;

    /// Flush all of the calling vCPU's cached translations.
    fn flush_tlb(&mut self);

    /// Number of frames currently granted to `dom`.
    fn current_reservation(&mut self, dom: DomId) -> Result<usize, HvError>;

    /// Administrative upper bound on the frames `dom` may ever hold.
    fn maximum_reservation(&mut self, dom: DomId) -> Result<usize, HvError>;

    /// The boot-time list of machine frames backing guest frames
    /// `0..count`, in guest-frame order.
    fn machine_frame_list(&mut self, count: usize) -> Vec<Mfn>;

    /// Ask for machine backing for the guest frame numbers in
    /// `extents`. Grants may be partial: the first `n` slots are
    /// rewritten with the granted machine frames and `n` is returned.
    fn populate_physmap(&mut self, dom: DomId, extents: &mut [u64]) -> usize;

    /// Tell the hypervisor where the published P2M index lives so
    /// external tooling can translate guest frames.
    fn publish_p2m_root(&mut self, root: Mfn, max_pfn: usize);
}
