// SPDX-License-Identifier: MIT OR Apache-2.0

//! Memory-management core of a minimal hypervisor-guest kernel:
//! page-table construction over an arena of table pages, the frame
//! translation table (P2M) with its published index, a demand-map
//! virtual allocator, batched frame mapping, zero-page copy-on-write
//! and a grow-only memory balloon.
//!
//! The hypervisor is reached only through the [`hypervisor::Hypervisor`]
//! trait and all table writes go through a [`backend::PagingBackend`],
//! so the whole core runs unchanged under a mock in the test suite.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address;
pub mod backend;
pub mod error;
pub mod hypervisor;
pub mod mm;
pub mod types;
pub mod utils;

#[cfg(test)]
pub mod testutils;
