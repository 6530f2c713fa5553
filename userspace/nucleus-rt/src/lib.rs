// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User runtime for nucleus environments
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: 12 unit tests + tests/fork_cow.rs against the host kernel
//!
//! PUBLIC API:
//!   - Platform / Sys: trap backend and typed syscall wrappers
//!   - fork: copy-on-write fork and its page-fault handler
//!   - ipc: blocking send/recv helpers
//!   - os::Ecall (riscv64, target_os = "none"): the real backend
//!
//! DEPENDENCIES:
//!   - nucleus-abi: syscall numbers, errors, layout, UTrapFrame
//!
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]
#![deny(clippy::all)]

pub mod fork;
pub mod ipc;
pub mod sys;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod os;

#[cfg(test)]
mod mock;

pub use fork::{fork, Forked};
pub use sys::{Platform, Sys, SysResult};
