// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time kernel sizing knobs
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig (default/with_*/validate), ConfigError
//! DEPENDS_ON: nucleus_abi::NENV, cpu::MAX_CPUS
//! INVARIANTS: max_envs <= NENV; 1 <= cpus <= MAX_CPUS; default values stable across boots
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! Compile-time switches live in Cargo features (`failpoints`, `sched_trace`,
//! `panic_handler`); everything sized at boot lives here.

use core::fmt;

use nucleus_abi::NENV;

use crate::cpu::MAX_CPUS;

const DEFAULT_FRAMES: usize = 4096; // 16 MiB

/// Sizing of the kernel's fixed tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Environment table slots.
    pub max_envs: usize,
    /// CPUs that may enter the kernel.
    pub cpus: usize,
    /// Physical frames handed to the frame pool.
    pub frames: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { max_envs: NENV, cpus: MAX_CPUS, frames: DEFAULT_FRAMES }
    }
}

impl KernelConfig {
    pub const fn with_max_envs(mut self, max_envs: usize) -> Self {
        self.max_envs = max_envs;
        self
    }

    pub const fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    pub const fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_envs == 0 || self.max_envs > NENV {
            return Err(ConfigError::MaxEnvs(self.max_envs));
        }
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(ConfigError::Cpus(self.cpus));
        }
        // template root + at least one environment root
        if self.frames < 2 {
            return Err(ConfigError::Frames(self.frames));
        }
        Ok(())
    }
}

/// Rejected configuration value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    MaxEnvs(usize),
    Cpus(usize),
    Frames(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
