// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory console used for host runs and tests. Clones share the same buffers.

extern crate alloc;

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};

use spin::Mutex;

use super::Console;

#[derive(Default)]
struct Buffers {
    output: Vec<u8>,
    input: VecDeque<u8>,
}

#[derive(Clone, Default)]
pub struct MemoryConsole {
    inner: Arc<Mutex<Buffers>>,
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes for `read_byte`.
    pub fn push_input(&self, bytes: &[u8]) {
        self.inner.lock().input.extend(bytes.iter().copied());
    }

    /// Everything written so far.
    pub fn output(&self) -> Vec<u8> {
        self.inner.lock().output.clone()
    }
}

impl Console for MemoryConsole {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.inner.lock().output.extend_from_slice(bytes);
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.inner.lock().input.pop_front()
    }
}
