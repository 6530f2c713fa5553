// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-environment address space and checked user-memory access
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace (new/map/unmap/lookup/check_user/read_user/write_user/destroy), AccessFault
//! DEPENDS_ON: mm::page_table, mm::frame
//! INVARIANTS: Exclusively owned by one environment; kernel half shared from the template;
//!             user access succeeds only through VALID|USER leaves (WRITE for stores)
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::vec::Vec;

use nucleus_abi::fec;
use nucleus_abi::layout::UTOP;

use super::frame::{FrameNumber, FramePool};
use super::page_table::{MapError, Mapping, PageFlags, PageTable};
use super::PAGE_SIZE;
use crate::types::Asid;

const SATP_MODE_SV39: usize = 8 << 60;

/// A user access that the MMU would refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessFault {
    /// First offending address.
    pub va: usize,
    /// A leaf existed but lacked the needed permission.
    pub present: bool,
    /// The access was a store.
    pub write: bool,
}

impl AccessFault {
    /// Fault error code (`nucleus_abi::fec`) reported to the user handler.
    pub const fn error_code(&self) -> usize {
        let mut code = fec::USER;
        if self.present {
            code |= fec::PRESENT;
        }
        if self.write {
            code |= fec::WRITE;
        }
        code
    }
}

/// Sv39 address space owned by a single environment.
#[derive(Debug)]
pub struct AddressSpace {
    table: PageTable,
    asid: Asid,
}

impl AddressSpace {
    pub fn new(frames: &mut FramePool, template: &PageTable, asid: Asid) -> Result<Self, MapError> {
        Ok(Self { table: PageTable::with_template(frames, template)?, asid })
    }

    /// Value to load into `satp` when this space becomes active.
    pub fn satp_value(&self) -> usize {
        SATP_MODE_SV39 | ((self.asid.as_raw() as usize) << 44) | self.table.root_ppn()
    }

    pub fn lookup(&self, frames: &FramePool, va: usize) -> Option<Mapping> {
        self.table.lookup(frames, va)
    }

    pub fn has_leaf_table(&self, frames: &FramePool, va: usize) -> bool {
        self.table.has_leaf_table(frames, va)
    }

    pub fn map(
        &mut self,
        frames: &mut FramePool,
        va: usize,
        frame: FrameNumber,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        self.table.insert(frames, va, frame, flags)
    }

    /// Removes the mapping at `va`. Unmapped addresses are ignored.
    pub fn unmap(&mut self, frames: &mut FramePool, va: usize) -> bool {
        self.table.remove(frames, va).is_some()
    }

    pub fn mappings(&self, frames: &FramePool) -> Vec<(usize, Mapping)> {
        self.table.mappings(frames)
    }

    pub fn destroy(self, frames: &mut FramePool) {
        self.table.destroy(frames);
    }

    /// Verifies that user code may access `[va, va + len)`.
    pub fn check_user(
        &self,
        frames: &FramePool,
        va: usize,
        len: usize,
        write: bool,
    ) -> Result<(), AccessFault> {
        if len == 0 {
            return Ok(());
        }
        let end = match va.checked_add(len) {
            Some(end) if end <= UTOP => end,
            _ => return Err(AccessFault { va: va.max(UTOP), present: false, write }),
        };
        let mut need = PageFlags::VALID | PageFlags::USER;
        if write {
            need |= PageFlags::WRITE;
        }
        let mut page = va & !(PAGE_SIZE - 1);
        while page < end {
            match self.table.lookup(frames, page) {
                Some(mapping) if mapping.flags.contains(need) => {}
                found => {
                    return Err(AccessFault { va: page.max(va), present: found.is_some(), write })
                }
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Copies user memory into `buf` (copy-from-user).
    pub fn read_user(
        &self,
        frames: &FramePool,
        va: usize,
        buf: &mut [u8],
    ) -> Result<(), AccessFault> {
        self.check_user(frames, va, buf.len(), false)?;
        let mut done = 0;
        while done < buf.len() {
            let at = va + done;
            let offset = at % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(buf.len() - done);
            let mapping = self
                .table
                .lookup(frames, at - offset)
                .ok_or(AccessFault { va: at, present: false, write: false })?;
            buf[done..done + chunk]
                .copy_from_slice(&frames.bytes(mapping.frame)[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copies `bytes` into user memory (copy-to-user). Nothing is written on failure.
    pub fn write_user(
        &self,
        frames: &mut FramePool,
        va: usize,
        bytes: &[u8],
    ) -> Result<(), AccessFault> {
        self.check_user(frames, va, bytes.len(), true)?;
        let mut done = 0;
        while done < bytes.len() {
            let at = va + done;
            let offset = at % PAGE_SIZE;
            let chunk = (PAGE_SIZE - offset).min(bytes.len() - done);
            let mapping = self
                .table
                .lookup(frames, at - offset)
                .ok_or(AccessFault { va: at, present: false, write: true })?;
            frames.bytes_mut(mapping.frame)[offset..offset + chunk]
                .copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }
}
