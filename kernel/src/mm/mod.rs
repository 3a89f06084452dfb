// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod address_space;
pub mod alloc;
pub mod balloon;
pub mod demand;
pub mod fault;
pub mod mapping;
pub mod memory;
pub mod p2m;
pub mod pagetable;

pub use address_space::{pfn_to_virt, virt_to_pfn};
pub use memory::{BootConfig, MemoryManager};
pub use pagetable::{PtEntry, PtEntryFlags};
