// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod memory_region;

pub use memory_region::MemoryRegion;
