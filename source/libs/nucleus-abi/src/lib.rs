// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared ABI definitions between the nucleus kernel and its userland runtime
//! OWNERS: @runtime
//! PUBLIC API: Error, decode(), EnvId, EnvStatus, Perm, nr::*, layout::*, UTrapFrame, fec::*
//! DEPENDS_ON: no_std, bitflags
//! INVARIANTS: Error codes are negated on the wire; syscall numbers and perm bits are stable
//! ADR: docs/adr/0016-kernel-libs-architecture.md

use core::fmt;

use bitflags::bitflags;

/// Errors reported by the kernel through negative syscall return values.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Environment does not exist or the caller may not act on it.
    BadEnvironment = 2,
    /// Argument failed validation (alignment, range, permissions, unmapped source).
    InvalidArgument = 3,
    /// Frame or page-table allocation failed.
    NoMemory = 4,
    /// Environment table has no free slot.
    NoFreeSlot = 5,
    /// IPC target is not blocked in a receive.
    TargetNotReceiving = 6,
    /// Syscall number is not implemented.
    NoSuchOperation = 7,
}

impl Error {
    /// Returns the positive error code.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Returns the value placed in the return register (`-code`).
    pub const fn to_ret(self) -> isize {
        -(self as i32 as isize)
    }

    /// Maps a positive error code back onto the enum.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            2 => Some(Self::BadEnvironment),
            3 => Some(Self::InvalidArgument),
            4 => Some(Self::NoMemory),
            5 => Some(Self::NoFreeSlot),
            6 => Some(Self::TargetNotReceiving),
            7 => Some(Self::NoSuchOperation),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Decodes a raw syscall return value.
///
/// Negative values that do not name a known error decode as
/// [`Error::NoSuchOperation`].
pub fn decode(ret: isize) -> Result<usize, Error> {
    if ret >= 0 {
        return Ok(ret as usize);
    }
    let code = ret.unsigned_abs();
    match i32::try_from(code).ok().and_then(Error::from_code) {
        Some(err) => Err(err),
        None => Err(Error::NoSuchOperation),
    }
}

/// Syscall numbers (`a7`).
pub mod nr {
    /// Write a user buffer to the console.
    pub const CPUTS: usize = 0;
    /// Read one console character without blocking (0 when none).
    pub const CGETC: usize = 1;
    /// Return the caller's environment id.
    pub const GETENVID: usize = 2;
    /// Destroy an environment.
    pub const ENV_DESTROY: usize = 3;
    /// Give up the CPU.
    pub const YIELD: usize = 4;
    /// Create a blank child environment.
    pub const EXOFORK: usize = 5;
    /// Set an environment's status.
    pub const ENV_SET_STATUS: usize = 6;
    /// Install a trap frame.
    pub const ENV_SET_TRAPFRAME: usize = 7;
    /// Install the page-fault upcall entry.
    pub const ENV_SET_PGFAULT_UPCALL: usize = 8;
    /// Allocate and map a zeroed page.
    pub const PAGE_ALLOC: usize = 9;
    /// Share a page between address spaces.
    pub const PAGE_MAP: usize = 10;
    /// Remove a mapping.
    pub const PAGE_UNMAP: usize = 11;
    /// Attempt to complete a pending receive.
    pub const IPC_TRY_SEND: usize = 12;
    /// Block until a value arrives.
    pub const IPC_RECV: usize = 13;
    /// Read-only view of the caller's page tables.
    pub const PAGE_QUERY: usize = 14;
}

/// Number of bits of an [`EnvId`] that select the table slot.
pub const LOG2NENV: u32 = 10;
/// Upper bound on the environment table size.
pub const NENV: usize = 1 << LOG2NENV;

/// Generation-stamped environment identifier.
///
/// Raw value 0 is [`EnvId::SELF`] and always names the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct EnvId(i32);

impl EnvId {
    /// The calling environment.
    pub const SELF: Self = Self(0);

    /// Wraps a raw identifier.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Decodes an identifier passed in a register.
    pub const fn from_reg(reg: usize) -> Self {
        Self(reg as u32 as i32)
    }

    /// Returns the raw identifier.
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Encodes the identifier for a register.
    pub const fn to_reg(self) -> usize {
        self.0 as u32 as usize
    }

    /// Table slot encoded in the low bits.
    pub const fn slot(self) -> usize {
        (self.0 as u32 as usize) & (NENV - 1)
    }

    /// True for [`EnvId::SELF`].
    pub const fn is_self(self) -> bool {
        self.0 == 0
    }

    /// Identifier for the next occupant of `slot`, given its previous occupant.
    ///
    /// The generation advances by one step per allocation and restarts at the
    /// first generation instead of turning non-positive.
    pub const fn next(previous: Self, slot: usize) -> Self {
        let step = 1i32 << LOG2NENV;
        let mut generation = previous.0.wrapping_add(step) & !((NENV as i32) - 1);
        if generation <= 0 {
            generation = step;
        }
        Self(generation | (slot & (NENV - 1)) as i32)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Environment lifecycle status as exchanged with `ENV_SET_STATUS`.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EnvStatus {
    /// Slot unused.
    Free = 0,
    /// Destroyed while running elsewhere; reclaimed on its CPU's next kernel entry.
    Dying = 1,
    /// Eligible for dispatch.
    Runnable = 2,
    /// Dispatched on exactly one CPU.
    Running = 3,
    /// Parked (newly forked, blocked in receive, or stopped by its parent).
    NotRunnable = 4,
}

impl EnvStatus {
    /// Decodes a raw status value.
    pub const fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }

    /// Short lowercase label used in diagnostics.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Dying => "dying",
            Self::Runnable => "runnable",
            Self::Running => "running",
            Self::NotRunnable => "not-runnable",
        }
    }
}

bitflags! {
    /// Page permissions accepted by the memory and IPC syscalls.
    ///
    /// Bit positions match the kernel's Sv39 PTE layout; `COW` and `SHARE`
    /// live in the two software (RSW) bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Perm: usize {
        /// Mapping present.
        const VALID = 1 << 0;
        /// Readable (always granted for user mappings).
        const READ = 1 << 1;
        /// Writable.
        const WRITE = 1 << 2;
        /// Accessible from user mode.
        const USER = 1 << 4;
        /// Copy-on-write marker interpreted by the user fault handler.
        const COW = 1 << 8;
        /// Shared across fork instead of copied.
        const SHARE = 1 << 9;
    }
}

/// Every bit a user permission argument may carry.
pub const PERM_SYSCALL: Perm = Perm::all();

impl Perm {
    /// Validates a raw permission argument: `VALID | USER` present and no
    /// bit outside [`PERM_SYSCALL`].
    pub const fn from_user(raw: usize) -> Option<Self> {
        let required = Self::VALID.bits() | Self::USER.bits();
        if raw & required != required || raw & !PERM_SYSCALL.bits() != 0 {
            return None;
        }
        Some(Self::from_bits_retain(raw))
    }
}

/// User address-space layout.
pub mod layout {
    /// Size of one page.
    pub const PAGE_SIZE: usize = 4096;
    /// Top of user-controlled memory; everything above belongs to the kernel.
    pub const UTOP: usize = 0x8000_0000;
    /// Top of the one-page exception stack used for fault upcalls.
    pub const UXSTACKTOP: usize = UTOP;
    /// Top of the normal user stack; one guard page sits below the exception stack.
    pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;
    /// Start of program text for boot-loaded images.
    pub const UTEXT: usize = 0x0080_0000;
    /// Scratch area for temporary mappings.
    pub const UTEMP: usize = 0x0040_0000;
    /// Scratch page used by the copy-on-write fault handler.
    pub const PFTEMP: usize = UTEMP + 0x0040_0000 - PAGE_SIZE;

    /// Rounds `va` down to its page base.
    pub const fn page_base(va: usize) -> usize {
        va & !(PAGE_SIZE - 1)
    }
}

/// Page-fault error-code bits delivered in [`UTrapFrame::err`].
pub mod fec {
    /// Fault on a present mapping (protection violation).
    pub const PRESENT: usize = 1 << 0;
    /// Faulting access was a store.
    pub const WRITE: usize = 1 << 1;
    /// Fault raised in user mode.
    pub const USER: usize = 1 << 2;
}

/// General-purpose register indices within saved register files.
pub mod reg {
    /// Return address.
    pub const RA: usize = 1;
    /// Stack pointer.
    pub const SP: usize = 2;
    /// First argument / return value.
    pub const A0: usize = 10;
    /// Second argument.
    pub const A1: usize = 11;
    /// Third argument.
    pub const A2: usize = 12;
    /// Fourth argument.
    pub const A3: usize = 13;
    /// Fifth argument.
    pub const A4: usize = 14;
    /// Syscall number.
    pub const A7: usize = 17;
}

/// Number of machine words in a kernel trap frame (`x0..x31, sepc, sstatus, scause, stval`).
pub const TRAPFRAME_WORDS: usize = 36;

const WORD: usize = core::mem::size_of::<usize>();

/// Frame pushed onto the user exception stack when a page fault is reflected.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapFrame {
    /// Faulting virtual address.
    pub fault_va: usize,
    /// Error code built from [`fec`] bits.
    pub err: usize,
    /// Trap-time general-purpose registers (`regs[reg::SP]` is the trap-time stack).
    pub regs: [usize; 32],
    /// Trap-time program counter.
    pub pc: usize,
    /// Trap-time status word.
    pub status: usize,
}

static_assertions::const_assert_eq!(core::mem::size_of::<UTrapFrame>(), UTrapFrame::SIZE);

impl UTrapFrame {
    /// Encoded size in bytes.
    pub const SIZE: usize = 36 * WORD;

    /// Trap-time stack pointer.
    pub const fn sp(&self) -> usize {
        self.regs[reg::SP]
    }

    /// Little-endian encoding as stored on the exception stack.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let words = core::iter::once(self.fault_va)
            .chain(core::iter::once(self.err))
            .chain(self.regs.iter().copied())
            .chain(core::iter::once(self.pc))
            .chain(core::iter::once(self.status));
        for (chunk, word) in out.chunks_exact_mut(WORD).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Decodes a frame from exception-stack bytes; `None` when `bytes` is short.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let mut words = [0usize; 36];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(WORD)) {
            let mut raw = [0u8; WORD];
            raw.copy_from_slice(chunk);
            *word = usize::from_le_bytes(raw);
        }
        let mut regs = [0usize; 32];
        regs.copy_from_slice(&words[2..34]);
        Some(Self { fault_va: words[0], err: words[1], regs, pc: words[34], status: words[35] })
    }
}
