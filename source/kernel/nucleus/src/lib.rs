// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Nucleus kernel core: environments, round-robin scheduling, page-level memory
//! syscalls, rendezvous IPC and page-fault upcalls behind a big kernel lock
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, KernelGuard, Dispatch, KernelConfig, ProgramImage, log_* macros
//! DEPENDS_ON: nucleus-abi, spin, bitflags, static_assertions
//! INVARIANTS: All mutable kernel state lives behind one lock; user memory is only touched
//!             through checked copy-in/copy-out; errors cross the syscall boundary as
//!             negated nucleus_abi::Error codes
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

#[macro_use]
mod diag;
pub use diag::log;

pub mod config;
pub mod cpu;
pub mod env;
pub mod hal;
pub mod ipc;
pub mod kernel;
pub mod loader;
pub mod mm;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod trap;
pub mod types;

#[cfg(all(feature = "panic_handler", target_os = "none", not(test)))]
mod panic;

pub use config::{ConfigError, KernelConfig};
pub use cpu::{CpuStatus, MAX_CPUS};
pub use hal::{Console, MemoryConsole};
pub use kernel::{Dispatch, Kernel, KernelGuard};
pub use loader::{LoadError, ProgramImage, Segment};
pub use trap::TrapFrame;
pub use types::CpuId;
