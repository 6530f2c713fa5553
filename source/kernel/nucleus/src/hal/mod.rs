// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.

pub mod buffer;

pub use buffer::MemoryConsole;

/// Console device behind the `CPUTS`/`CGETC` syscalls.
pub trait Console: Send {
    /// Writes raw bytes to the console.
    fn write_bytes(&mut self, bytes: &[u8]);
    /// Returns the next pending input byte without blocking.
    fn read_byte(&mut self) -> Option<u8>;
}
