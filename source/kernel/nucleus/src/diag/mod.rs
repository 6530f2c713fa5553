// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel diagnostics (structured logging)
//! OWNERS: @kernel-team
//! PUBLIC API: log (emit, set_sink, Level, Sink), log_* macros
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: One line per emission; no allocation on the emit path

#[macro_use]
pub mod log;
