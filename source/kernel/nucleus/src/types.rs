// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Small newtypes for safer syscall decoding
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, CpuId, Asid
//! DEPENDS_ON: nucleus_abi::layout
//! INVARIANTS: User pages are page aligned and below UTOP; ASID 0 is the kernel template
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt;

use nucleus_abi::layout::{PAGE_SIZE, UTOP};

/// Virtual address as received from a syscall register.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Accepts only page-aligned addresses strictly below `UTOP`.
    #[inline]
    pub fn user_page(addr: usize) -> Option<Self> {
        if addr < UTOP && addr % PAGE_SIZE == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < UTOP
    }

    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Logical CPU identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    /// Boot CPU.
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    /// Returns the CPU as an index into per-CPU arrays.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address space identifier placed in `satp`.
///
/// **Invariant**: ASID 0 belongs to the kernel template; environments use slot + 1.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Asid(u16);

impl Asid {
    #[inline]
    pub const fn for_slot(slot: usize) -> Self {
        Self(slot as u16 + 1)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }
}
