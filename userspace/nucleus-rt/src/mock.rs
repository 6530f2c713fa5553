// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Scripted platform for unit tests
//! OWNERS: @runtime
//! NOTE: Tests only; replies are consumed in call order and every call is recorded.

use std::collections::VecDeque;
use std::fmt;
use std::string::String;
use std::vec::Vec;

use crate::sys::Platform;

pub const ENTRY: usize = 0x0080_0400;

#[derive(Default)]
pub struct Scripted {
    replies: VecDeque<[usize; 4]>,
    pub calls: Vec<(usize, [usize; 5])>,
    pub copies: Vec<(usize, usize)>,
    pub reports: Vec<String>,
}

impl Scripted {
    /// Queues a reply with `a0 = ret` and the remaining registers zero.
    pub fn reply(&mut self, ret: isize) -> &mut Self {
        self.replies.push_back([ret as usize, 0, 0, 0]);
        self
    }

    pub fn reply_regs(&mut self, regs: [usize; 4]) -> &mut Self {
        self.replies.push_back(regs);
        self
    }

    pub fn numbers(&self) -> Vec<usize> {
        self.calls.iter().map(|(number, _)| *number).collect()
    }
}

impl Platform for Scripted {
    fn ecall(&mut self, number: usize, args: [usize; 5]) -> [usize; 4] {
        self.calls.push((number, args));
        self.replies.pop_front().unwrap_or([0; 4])
    }

    fn copy_page(&mut self, dst: usize, src: usize) {
        self.copies.push((dst, src));
    }

    fn pgfault_entry(&self) -> usize {
        ENTRY
    }

    fn report(&mut self, msg: fmt::Arguments<'_>) {
        self.reports.push(std::format!("{}", msg));
    }
}
