// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Saved trap state and page-fault reflection to user handlers
//! OWNERS: @kernel-team
//! PUBLIC API: TrapFrame, FaultUpcall, reflect_page_fault(), UpcallError, SSTATUS_*
//! DEPENDS_ON: env::Env, mm::AddressSpace, nucleus_abi::UTrapFrame
//! INVARIANTS: Frames installed for user mode never carry SPP; reflected frames land wholly
//!             inside the exception-stack page; nested faults keep one scratch word
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use nucleus_abi::layout::{PAGE_SIZE, UXSTACKTOP};
use nucleus_abi::{reg, UTrapFrame, TRAPFRAME_WORDS};

use crate::env::Env;
use crate::mm::FramePool;
use crate::syscall::Args;

/// Supervisor interrupt enable.
pub const SSTATUS_SIE: usize = 1 << 1;
/// Interrupt enable restored by `sret`.
pub const SSTATUS_SPIE: usize = 1 << 5;
/// Previous privilege (set = supervisor).
pub const SSTATUS_SPP: usize = 1 << 8;

const WORD: usize = core::mem::size_of::<usize>();

/// Saved register state for an S-mode trap.
/// Must match the trap-entry save/restore layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// x0..x31 (x0 is always 0; we never write it).
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
}

static_assertions::const_assert_eq!(core::mem::size_of::<TrapFrame>(), TRAPFRAME_WORDS * WORD);

impl TrapFrame {
    /// Fresh user-mode frame starting at `entry` with stack `sp`.
    pub fn user(entry: usize, sp: usize) -> Self {
        let mut frame = Self { sepc: entry, sstatus: SSTATUS_SPIE, ..Self::default() };
        frame.x[reg::SP] = sp;
        frame
    }

    #[inline]
    pub fn syscall_number(&self) -> usize {
        self.x[reg::A7]
    }

    /// Arguments in a0..a5.
    pub fn syscall_args(&self) -> Args {
        let mut regs = [0usize; 6];
        regs.copy_from_slice(&self.x[reg::A0..reg::A0 + 6]);
        Args::new(regs)
    }

    #[inline]
    pub fn set_return(&mut self, value: isize) {
        self.x[reg::A0] = value as usize;
    }

    /// Forces user mode with interrupts enabled after `sret`.
    pub fn sanitize_user(&mut self) {
        self.sstatus = (self.sstatus & !(SSTATUS_SPP | SSTATUS_SIE)) | SSTATUS_SPIE;
    }

    /// Decodes the little-endian word image user code passes to `ENV_SET_TRAPFRAME`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TRAPFRAME_WORDS * WORD {
            return None;
        }
        let mut words = [0usize; TRAPFRAME_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(WORD)) {
            let mut raw = [0u8; WORD];
            raw.copy_from_slice(chunk);
            *word = usize::from_le_bytes(raw);
        }
        let mut frame = Self::default();
        frame.x.copy_from_slice(&words[..32]);
        frame.x[0] = 0;
        frame.sepc = words[32];
        frame.sstatus = words[33];
        frame.scause = words[34];
        frame.stval = words[35];
        Some(frame)
    }
}

/// Registered user entry point for page faults.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultUpcall {
    entry: usize,
}

impl FaultUpcall {
    pub const fn new(entry: usize) -> Self {
        Self { entry }
    }

    pub const fn entry(&self) -> usize {
        self.entry
    }
}

/// Why a page fault could not be reflected to user space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpcallError {
    /// No handler registered.
    NoUpcall,
    /// The frame would fall below the exception-stack page.
    ExceptionStackOverflow,
    /// The exception stack is not mapped user-writable.
    ExceptionStackUnmapped { va: usize },
}

/// Pushes a [`UTrapFrame`] on the exception stack and redirects `env` to its handler.
///
/// On success the handler starts with `sp` and `a0` pointing at the frame.
pub fn reflect_page_fault(
    env: &mut Env,
    frames: &mut FramePool,
    fault_va: usize,
    err: usize,
) -> Result<(), UpcallError> {
    let upcall = env.upcall.ok_or(UpcallError::NoUpcall)?;
    let base = UXSTACKTOP - PAGE_SIZE;
    let sp = env.frame.x[reg::SP];
    let top = if (base..UXSTACKTOP).contains(&sp) { sp - WORD } else { UXSTACKTOP };
    let at = top
        .checked_sub(UTrapFrame::SIZE)
        .map(|va| va & !0xf)
        .filter(|va| *va >= base)
        .ok_or(UpcallError::ExceptionStackOverflow)?;

    let utf = UTrapFrame {
        fault_va,
        err,
        regs: env.frame.x,
        pc: env.frame.sepc,
        status: env.frame.sstatus,
    };
    env.space
        .write_user(frames, at, &utf.to_bytes())
        .map_err(|fault| UpcallError::ExceptionStackUnmapped { va: fault.va })?;

    env.frame.sepc = upcall.entry();
    env.frame.x[reg::SP] = at;
    env.frame.x[reg::A0] = at;
    Ok(())
}
