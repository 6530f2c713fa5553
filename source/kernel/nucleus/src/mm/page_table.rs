// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page tables whose table pages come from the frame pool.
//!
//! Intermediate levels are allocated on demand. Root entries at and above
//! `UTOP` are copied from the kernel template and never owned by a user table.

extern crate alloc;

use alloc::vec::Vec;

use bitflags::bitflags;
use nucleus_abi::{layout::UTOP, Perm};

use super::frame::{FrameNumber, FramePool, PHYS_BASE};
use super::PAGE_SIZE;

/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
/// Root entries that translate user addresses.
const USER_ROOT_ENTRIES: usize = UTOP >> 30;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        // RSW bits, ignored by the MMU.
        const COW = 1 << 8;
        const SHARE = 1 << 9;
    }
}

static_assertions::const_assert_eq!(PageFlags::VALID.bits(), Perm::VALID.bits());
static_assertions::const_assert_eq!(PageFlags::READ.bits(), Perm::READ.bits());
static_assertions::const_assert_eq!(PageFlags::WRITE.bits(), Perm::WRITE.bits());
static_assertions::const_assert_eq!(PageFlags::USER.bits(), Perm::USER.bits());
static_assertions::const_assert_eq!(PageFlags::COW.bits(), Perm::COW.bits());
static_assertions::const_assert_eq!(PageFlags::SHARE.bits(), Perm::SHARE.bits());

impl PageFlags {
    /// Leaf flags for a validated user permission.
    ///
    /// User leaves are always readable; read-only leaves are also executable (W^X).
    pub fn from_user(perm: Perm) -> Self {
        let flags = Self::from_bits_truncate(perm.bits()) | Self::READ;
        if flags.contains(Self::WRITE) {
            flags
        } else {
            flags | Self::EXECUTE
        }
    }

    /// The user-visible subset of these flags.
    pub fn to_user(self) -> Perm {
        Perm::from_bits_truncate(self.bits())
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address was not page aligned.
    Unaligned,
    /// Address lies outside the user half.
    OutOfRange,
    /// A page-table page could not be allocated.
    NoMemory,
}

/// A resolved leaf mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub frame: FrameNumber,
    pub flags: PageFlags,
}

/// Three-level Sv39 page table rooted in a pool frame.
#[derive(Debug)]
pub struct PageTable {
    root: FrameNumber,
}

impl PageTable {
    /// Builds the kernel template: DRAM identity-mapped with a global gigapage.
    pub fn kernel_template(frames: &mut FramePool) -> Result<Self, MapError> {
        let root = frames.allocate().ok_or(MapError::NoMemory)?;
        let flags = PageFlags::VALID
            | LEAF_PERMS
            | PageFlags::GLOBAL
            | PageFlags::ACCESSED
            | PageFlags::DIRTY;
        let index = (PHYS_BASE >> 30) & 0x1ff;
        frames.write_entry(root, index, ((PHYS_BASE / PAGE_SIZE) << 10) | flags.bits());
        Ok(Self { root })
    }

    /// Creates an empty user table sharing the template's kernel entries.
    pub fn with_template(frames: &mut FramePool, template: &PageTable) -> Result<Self, MapError> {
        let root = frames.allocate().ok_or(MapError::NoMemory)?;
        for index in USER_ROOT_ENTRIES..PT_ENTRIES {
            let entry = frames.read_entry(template.root, index);
            frames.write_entry(root, index, entry);
        }
        Ok(Self { root })
    }

    /// Returns the physical page number of the root page suitable for SATP.
    pub fn root_ppn(&self) -> usize {
        self.root.ppn()
    }

    /// Looks up the leaf mapped at `va`.
    pub fn lookup(&self, frames: &FramePool, va: usize) -> Option<Mapping> {
        let (table, index) = self.walk(frames, va)?;
        let entry = frames.read_entry(table, index);
        if entry & PageFlags::VALID.bits() == 0 {
            return None;
        }
        Some(Mapping {
            frame: frames.frame_at(entry_pa(entry))?,
            flags: PageFlags::from_bits_truncate(entry),
        })
    }

    /// True when a last-level table covers the 2 MiB region containing `va`.
    pub fn has_leaf_table(&self, frames: &FramePool, va: usize) -> bool {
        self.walk(frames, va).is_some()
    }

    /// Maps `frame` at `va`, replacing any existing mapping.
    ///
    /// The new frame gains a reference before the old one loses its own, so
    /// re-inserting the same frame with new flags is safe.
    pub fn insert(
        &mut self,
        frames: &mut FramePool,
        va: usize,
        frame: FrameNumber,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        check_user_va(va)?;
        debug_assert!(flags.contains(PageFlags::VALID | PageFlags::READ));
        let (table, index) = self.walk_create(frames, va)?;
        frames.incref(frame);
        let old = frames.read_entry(table, index);
        if old & PageFlags::VALID.bits() != 0 {
            if let Some(previous) = frames.frame_at(entry_pa(old)) {
                frames.decref(previous);
            }
        }
        frames.write_entry(table, index, (frame.ppn() << 10) | flags.bits());
        Ok(())
    }

    /// Removes the mapping at `va`; returns the frame that was mapped, if any.
    pub fn remove(&mut self, frames: &mut FramePool, va: usize) -> Option<FrameNumber> {
        let (table, index) = self.walk(frames, va)?;
        let entry = frames.read_entry(table, index);
        if entry & PageFlags::VALID.bits() == 0 {
            return None;
        }
        frames.write_entry(table, index, 0);
        let frame = frames.frame_at(entry_pa(entry))?;
        frames.decref(frame);
        Some(frame)
    }

    /// Every user leaf mapping in ascending address order.
    pub fn mappings(&self, frames: &FramePool) -> Vec<(usize, Mapping)> {
        let mut out = Vec::new();
        self.for_each_leaf_table(frames, |va_base, table| {
            for i0 in 0..PT_ENTRIES {
                let entry = frames.read_entry(table, i0);
                if entry & PageFlags::VALID.bits() == 0 {
                    continue;
                }
                if let Some(frame) = frames.frame_at(entry_pa(entry)) {
                    let flags = PageFlags::from_bits_truncate(entry);
                    out.push((va_base | (i0 << 12), Mapping { frame, flags }));
                }
            }
        });
        out
    }

    /// Drops every user mapping and frees all table pages, the root included.
    pub fn destroy(self, frames: &mut FramePool) {
        for i2 in 0..USER_ROOT_ENTRIES {
            let Some(mid) = next_table(frames, self.root, i2) else {
                continue;
            };
            for i1 in 0..PT_ENTRIES {
                let Some(leaf) = next_table(frames, mid, i1) else {
                    continue;
                };
                for i0 in 0..PT_ENTRIES {
                    let entry = frames.read_entry(leaf, i0);
                    if entry & PageFlags::VALID.bits() == 0 {
                        continue;
                    }
                    if let Some(frame) = frames.frame_at(entry_pa(entry)) {
                        frames.decref(frame);
                    }
                }
                frames.free(leaf);
            }
            frames.free(mid);
        }
        frames.free(self.root);
    }

    fn for_each_leaf_table(&self, frames: &FramePool, mut f: impl FnMut(usize, FrameNumber)) {
        for i2 in 0..USER_ROOT_ENTRIES {
            let Some(mid) = next_table(frames, self.root, i2) else {
                continue;
            };
            for i1 in 0..PT_ENTRIES {
                if let Some(leaf) = next_table(frames, mid, i1) {
                    f((i2 << 30) | (i1 << 21), leaf);
                }
            }
        }
    }

    fn walk(&self, frames: &FramePool, va: usize) -> Option<(FrameNumber, usize)> {
        check_user_va(va).ok()?;
        let [vpn2, vpn1, vpn0] = vpn_indices(va);
        let mid = next_table(frames, self.root, vpn2)?;
        let leaf = next_table(frames, mid, vpn1)?;
        Some((leaf, vpn0))
    }

    fn walk_create(
        &mut self,
        frames: &mut FramePool,
        va: usize,
    ) -> Result<(FrameNumber, usize), MapError> {
        let [vpn2, vpn1, vpn0] = vpn_indices(va);
        let mid = next_table_or_alloc(frames, self.root, vpn2)?;
        let leaf = next_table_or_alloc(frames, mid, vpn1)?;
        Ok((leaf, vpn0))
    }
}

fn check_user_va(va: usize) -> Result<(), MapError> {
    if va % PAGE_SIZE != 0 {
        return Err(MapError::Unaligned);
    }
    if va >= UTOP {
        return Err(MapError::OutOfRange);
    }
    Ok(())
}

fn entry_pa(entry: usize) -> usize {
    (entry >> 10) << 12
}

fn next_table(frames: &FramePool, table: FrameNumber, index: usize) -> Option<FrameNumber> {
    let entry = frames.read_entry(table, index);
    if entry & PageFlags::VALID.bits() == 0 || entry & LEAF_PERMS.bits() != 0 {
        return None;
    }
    frames.frame_at(entry_pa(entry))
}

fn next_table_or_alloc(
    frames: &mut FramePool,
    table: FrameNumber,
    index: usize,
) -> Result<FrameNumber, MapError> {
    if let Some(next) = next_table(frames, table, index) {
        return Ok(next);
    }
    let next = frames.allocate().ok_or(MapError::NoMemory)?;
    frames.write_entry(table, index, (next.ppn() << 10) | PageFlags::VALID.bits());
    Ok(next)
}

/// Root-first VPN indices.
fn vpn_indices(va: usize) -> [usize; 3] {
    let vpn2 = (va >> 30) & 0x1ff;
    let vpn1 = (va >> 21) & 0x1ff;
    let vpn0 = (va >> 12) & 0x1ff;
    [vpn2, vpn1, vpn0]
}
