// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame pool with per-frame reference counts
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FramePool (allocate/free/incref/decref/refcount), FrameNumber, PHYS_BASE
//! DEPENDS_ON: alloc::Vec
//! INVARIANTS: A frame is on the free list iff it is unallocated; decref to zero frees;
//!             double free and refcount underflow are fatal; allocations are zeroed
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};

use super::PAGE_SIZE;

/// Physical address of the first managed frame (DRAM base on the `virt` machine).
pub const PHYS_BASE: usize = 0x8000_0000;

const WORD: usize = core::mem::size_of::<usize>();

static ZERO_PAGE: [u8; PAGE_SIZE] = [0; PAGE_SIZE];

/// Index of a managed physical frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Physical address of the frame.
    #[inline]
    pub const fn pa(self) -> usize {
        PHYS_BASE + self.0 * PAGE_SIZE
    }

    /// Physical page number as stored in PTEs.
    #[inline]
    pub const fn ppn(self) -> usize {
        self.pa() / PAGE_SIZE
    }
}

struct FrameSlot {
    // Backing bytes are materialised on first allocation and reused afterwards.
    data: Option<Box<[u8; PAGE_SIZE]>>,
    refs: u32,
    free: bool,
}

/// Fixed pool of physical frames.
pub struct FramePool {
    slots: Vec<FrameSlot>,
    free: Vec<usize>,
    #[cfg(feature = "failpoints")]
    fail_after: Option<usize>,
}

impl FramePool {
    /// Creates a pool of `count` frames, all free. Lower frames are handed out first.
    pub fn new(count: usize) -> Self {
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, || FrameSlot { data: None, refs: 0, free: true });
        Self {
            slots,
            free: (0..count).rev().collect(),
            #[cfg(feature = "failpoints")]
            fail_after: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Allocates a zeroed frame with a reference count of zero.
    pub fn allocate(&mut self) -> Option<FrameNumber> {
        #[cfg(feature = "failpoints")]
        match self.fail_after {
            Some(0) => return None,
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        let index = self.free.pop()?;
        let slot = &mut self.slots[index];
        slot.free = false;
        slot.refs = 0;
        match slot.data.as_deref_mut() {
            Some(bytes) => bytes.fill(0),
            None => slot.data = Some(Box::new([0; PAGE_SIZE])),
        }
        Some(FrameNumber(index))
    }

    /// Returns an unreferenced frame to the pool.
    pub fn free(&mut self, frame: FrameNumber) {
        let slot = &mut self.slots[frame.0];
        assert!(!slot.free, "frame {} freed twice", frame.0);
        assert_eq!(slot.refs, 0, "frame {} freed while mapped", frame.0);
        slot.free = true;
        self.free.push(frame.0);
    }

    pub fn incref(&mut self, frame: FrameNumber) {
        let slot = &mut self.slots[frame.0];
        debug_assert!(!slot.free, "incref on free frame {}", frame.0);
        slot.refs += 1;
    }

    /// Drops one reference; the frame returns to the pool when none remain.
    pub fn decref(&mut self, frame: FrameNumber) {
        let slot = &mut self.slots[frame.0];
        assert!(slot.refs > 0, "refcount underflow on frame {}", frame.0);
        slot.refs -= 1;
        if slot.refs == 0 {
            self.free(frame);
        }
    }

    pub fn refcount(&self, frame: FrameNumber) -> u32 {
        self.slots[frame.0].refs
    }

    pub fn is_free(&self, frame: FrameNumber) -> bool {
        self.slots[frame.0].free
    }

    /// Maps a physical address back to a managed frame.
    pub fn frame_at(&self, pa: usize) -> Option<FrameNumber> {
        let offset = pa.checked_sub(PHYS_BASE)?;
        let index = offset / PAGE_SIZE;
        (index < self.slots.len()).then_some(FrameNumber(index))
    }

    pub fn bytes(&self, frame: FrameNumber) -> &[u8; PAGE_SIZE] {
        self.slots[frame.0].data.as_deref().unwrap_or(&ZERO_PAGE)
    }

    pub fn bytes_mut(&mut self, frame: FrameNumber) -> &mut [u8; PAGE_SIZE] {
        self.slots[frame.0].data.get_or_insert_with(|| Box::new([0; PAGE_SIZE]))
    }

    /// Reads the `index`-th machine word of a page-table frame.
    pub fn read_entry(&self, frame: FrameNumber, index: usize) -> usize {
        let mut raw = [0u8; WORD];
        raw.copy_from_slice(&self.bytes(frame)[index * WORD..(index + 1) * WORD]);
        usize::from_le_bytes(raw)
    }

    pub fn write_entry(&mut self, frame: FrameNumber, index: usize, value: usize) {
        self.bytes_mut(frame)[index * WORD..(index + 1) * WORD].copy_from_slice(&value.to_le_bytes());
    }

    /// Makes every allocation after the next `successes` fail until cleared.
    #[cfg(feature = "failpoints")]
    pub fn fail_after(&mut self, successes: usize) {
        self.fail_after = Some(successes);
    }

    #[cfg(feature = "failpoints")]
    pub fn clear_failpoint(&mut self) {
        self.fail_after = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_zeroed_and_ordered() {
        let mut pool = FramePool::new(4);
        let a = pool.allocate().expect("frame");
        assert_eq!(a.index(), 0);
        pool.bytes_mut(a)[17] = 0xaa;
        pool.free(a);
        let b = pool.allocate().expect("frame");
        assert_eq!(b, a);
        assert!(pool.bytes(b).iter().all(|&byte| byte == 0));
    }

    #[test]
    fn decref_to_zero_returns_frame() {
        let mut pool = FramePool::new(2);
        let frame = pool.allocate().expect("frame");
        pool.incref(frame);
        pool.incref(frame);
        pool.decref(frame);
        assert!(!pool.is_free(frame));
        pool.decref(frame);
        assert!(pool.is_free(frame));
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_free_is_fatal() {
        let mut pool = FramePool::new(1);
        let frame = pool.allocate().expect("frame");
        pool.free(frame);
        pool.free(frame);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = FramePool::new(1);
        assert!(pool.allocate().is_some());
        assert!(pool.allocate().is_none());
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn failpoint_denies_after_budget() {
        let mut pool = FramePool::new(8);
        pool.fail_after(1);
        assert!(pool.allocate().is_some());
        assert!(pool.allocate().is_none());
        pool.clear_failpoint();
        assert!(pool.allocate().is_some());
    }

    #[test]
    fn entries_roundtrip_through_bytes() {
        let mut pool = FramePool::new(1);
        let frame = pool.allocate().expect("frame");
        pool.write_entry(frame, 511, 0x1234_5678_9abc);
        assert_eq!(pool.read_entry(frame, 511), 0x1234_5678_9abc);
        assert_eq!(pool.frame_at(frame.pa()), Some(frame));
        assert_eq!(pool.frame_at(PHYS_BASE - 1), None);
    }
}
