// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel synchronisation primitives
//! OWNERS: @kernel-sync-team
//! PUBLIC API: BigKernelLock, BigLockGuard
//! DEPENDS_ON: spin
//! INVARIANTS: All shared kernel state sits behind the one big lock
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod big_lock;

pub use big_lock::{BigKernelLock, BigLockGuard};
