// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Round-robin environment selection
//! OWNERS: @kernel-sched-team
//! PUBLIC API: pick(envs, cpu) -> Pick
//! DEPENDS_ON: env::EnvTable, cpu::CpuState
//! INVARIANTS: Scans every slot once starting after the CPU's current slot; never selects an
//!             environment running on another CPU; falls back to the CPU's own environment only
//!             if it is still Running here
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use nucleus_abi::{EnvId, EnvStatus};

use crate::cpu::CpuState;
use crate::env::EnvTable;

#[cfg(test)]
mod tests_prop;

/// Scheduling decision for one CPU.
#[must_use = "a pick must be dispatched or the CPU halted"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    Run(EnvId),
    Halt,
}

/// Chooses the next environment for `cpu`. Must be called under the big lock.
pub fn pick(envs: &EnvTable, cpu: &CpuState) -> Pick {
    let capacity = envs.capacity();
    let start = cpu.current.map_or(0, |id| id.slot() + 1);
    for step in 0..capacity {
        let slot = (start + step) % capacity;
        if let Some(env) = envs.at_slot(slot) {
            if env.status == EnvStatus::Runnable {
                trace_pick(cpu, "runnable", env.id());
                return Pick::Run(env.id());
            }
        }
    }

    // The status is re-read here: the environment may have been stopped or
    // marked dying by another CPU since this CPU dispatched it.
    if let Some(current) = cpu.current {
        if let Some(env) = envs.get(current) {
            if env.status == EnvStatus::Running && env.cpu == Some(cpu.id()) {
                trace_pick(cpu, "resume", current);
                return Pick::Run(current);
            }
        }
    }
    Pick::Halt
}

#[inline]
fn trace_pick(cpu: &CpuState, why: &str, id: EnvId) {
    if cfg!(feature = "sched_trace") {
        crate::log_trace!(target: "sched", "cpu {} picks {} ({})", cpu.id(), id, why);
    }
}
