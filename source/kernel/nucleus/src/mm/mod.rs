// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory substrate beneath the environment core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FramePool, FrameNumber, PageTable, PageFlags, Mapping, MapError, AddressSpace, AccessFault
//! DEPENDS_ON: nucleus_abi::layout
//! INVARIANTS: Frames are shared only through refcounted leaf entries; table pages are owned
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod address_space;
pub mod frame;
pub mod page_table;

#[cfg(test)]
mod tests_prop;

pub use address_space::{AccessFault, AddressSpace};
pub use frame::{FrameNumber, FramePool, PHYS_BASE};
pub use page_table::{MapError, Mapping, PageFlags, PageTable};

/// Size of a page in bytes.
pub use nucleus_abi::layout::PAGE_SIZE;
