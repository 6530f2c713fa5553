// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for frame sharing through page tables
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Map/unmap sequences restore the pool exactly
//!   - Sharing a frame between two tables keeps it alive until the last unmap
//!
//! TEST_SCENARIOS:
//!   - map_unmap_restores_free_count(): any set of pages mapped then unmapped
//!   - shared_frame_survives_partial_unmap(): unmap in B leaves A's data intact

use super::{FramePool, PageFlags, PageTable};
use proptest::prelude::*;

const PAGES: usize = 64;

fn flags() -> PageFlags {
    PageFlags::VALID | PageFlags::READ | PageFlags::WRITE | PageFlags::USER
}

proptest! {
    #[test]
    fn map_unmap_restores_free_count(pages in proptest::collection::btree_set(0usize..4096, 1..24)) {
        let mut pool = FramePool::new(PAGES + 16);
        let template = PageTable::kernel_template(&mut pool).unwrap();
        let mut table = PageTable::with_template(&mut pool, &template).unwrap();
        // warm the table pages so only data frames move
        for &page in &pages {
            let frame = pool.allocate().unwrap();
            table.insert(&mut pool, page << 12, frame, flags()).unwrap();
            table.remove(&mut pool, page << 12);
        }
        let baseline = pool.free_count();
        for &page in &pages {
            let frame = pool.allocate().unwrap();
            table.insert(&mut pool, page << 12, frame, flags()).unwrap();
        }
        for &page in &pages {
            prop_assert!(table.remove(&mut pool, page << 12).is_some());
        }
        prop_assert_eq!(pool.free_count(), baseline);
    }

    #[test]
    fn shared_frame_survives_partial_unmap(src in 0usize..512, dst in 0usize..512, byte in any::<u8>()) {
        let mut pool = FramePool::new(PAGES);
        let template = PageTable::kernel_template(&mut pool).unwrap();
        let mut a = PageTable::with_template(&mut pool, &template).unwrap();
        let mut b = PageTable::with_template(&mut pool, &template).unwrap();
        let frame = pool.allocate().unwrap();
        pool.bytes_mut(frame)[0] = byte;
        a.insert(&mut pool, src << 12, frame, flags()).unwrap();
        b.insert(&mut pool, dst << 12, frame, flags()).unwrap();
        prop_assert_eq!(pool.refcount(frame), 2);
        b.remove(&mut pool, dst << 12);
        let mapping = a.lookup(&pool, src << 12).unwrap();
        prop_assert_eq!(mapping.frame, frame);
        prop_assert_eq!(pool.bytes(frame)[0], byte);
        prop_assert_eq!(pool.refcount(frame), 1);
    }
}
