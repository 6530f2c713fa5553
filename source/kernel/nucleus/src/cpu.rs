// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-CPU dispatch state
//! OWNERS: @kernel-team
//! PUBLIC API: CpuState, CpuStatus, MAX_CPUS
//! DEPENDS_ON: types::CpuId
//! INVARIANTS: Mutated only under the big kernel lock; `current` names at most one environment
//! ADR: docs/rfcs/RFC-0021-kernel-smp-v1-percpu-runqueues-ipi-contract.md

use nucleus_abi::EnvId;

use crate::types::CpuId;

/// Fixed CPU ceiling for bounded per-CPU state.
pub const MAX_CPUS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuStatus {
    /// Never entered the kernel.
    Unused,
    /// Online and dispatching.
    Started,
    /// Parked in the idle loop until the next interrupt.
    Halted,
}

/// Bookkeeping for one CPU.
#[derive(Clone, Debug)]
pub struct CpuState {
    id: CpuId,
    pub status: CpuStatus,
    /// Environment this CPU last dispatched and has not yet given up.
    pub current: Option<EnvId>,
    /// Dispatches performed, for diagnostics.
    pub dispatches: u64,
}

impl CpuState {
    pub const fn new(id: CpuId) -> Self {
        Self { id, status: CpuStatus::Unused, current: None, dispatches: 0 }
    }

    pub const fn id(&self) -> CpuId {
        self.id
    }
}
