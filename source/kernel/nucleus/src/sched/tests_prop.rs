// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property-based tests for round-robin fairness
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Every runnable environment is chosen exactly once per pass
//!   - Parked environments are never chosen
//!
//! TEST_SCENARIOS:
//!   - each_runnable_env_runs_once_per_pass(): n picks over n runnable envs cover all of them

use super::{pick, Pick};
use crate::cpu::CpuState;
use crate::env::EnvTable;
use crate::mm::{FramePool, PageTable};
use crate::types::CpuId;
use nucleus_abi::{EnvId, EnvStatus};
use proptest::prelude::*;
use std::collections::BTreeSet;

proptest! {
    #[test]
    fn each_runnable_env_runs_once_per_pass(
        runnable in proptest::collection::vec(any::<bool>(), 1..16),
        passes in 1usize..4,
    ) {
        let mut frames = FramePool::new(64);
        let template = PageTable::kernel_template(&mut frames).unwrap();
        let mut envs = EnvTable::new(runnable.len());
        let mut eligible = BTreeSet::new();
        for &is_runnable in &runnable {
            let id = envs.allocate(EnvId::SELF, &mut frames, &template).unwrap();
            if is_runnable {
                envs.get_mut(id).unwrap().status = EnvStatus::Runnable;
                eligible.insert(id);
            }
        }
        let mut cpu = CpuState::new(CpuId::BOOT);
        for _ in 0..passes {
            let mut seen = BTreeSet::new();
            for _ in 0..eligible.len() {
                let Pick::Run(next) = pick(&envs, &cpu) else {
                    return Err(TestCaseError::fail("halted with runnable envs"));
                };
                // dispatch: yield the previous env, run the next
                if let Some(prev) = cpu.current {
                    envs.get_mut(prev).unwrap().status = EnvStatus::Runnable;
                }
                let env = envs.get_mut(next).unwrap();
                env.status = EnvStatus::Running;
                env.cpu = Some(cpu.id());
                cpu.current = Some(next);
                prop_assert!(seen.insert(next), "env picked twice in one pass");
            }
            prop_assert_eq!(&seen, &eligible);
        }
        if eligible.is_empty() {
            prop_assert_eq!(pick(&envs, &cpu), Pick::Halt);
        }
    }
}
