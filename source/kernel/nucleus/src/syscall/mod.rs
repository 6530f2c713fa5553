// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SysResult
//! DEPENDS_ON: env, ipc, mm, syscall::api, nucleus_abi::nr
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; decode/check/execute discipline;
//!             every in-kernel error maps onto exactly one ABI error code
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod api;

use core::fmt;

use nucleus_abi::Error as AbiError;

use crate::env::{EnvError, ShareError};
use crate::ipc::IpcError;
use crate::mm::MapError;

/// Size of the dispatch window.
const MAX_SYSCALL: usize = 16;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    NoSuchOperation,
    /// Malformed argument (address, permission, status or user buffer).
    InvalidArgument,
    /// Environment table operation failed.
    Env(EnvError),
    /// Page-table insert failed.
    Map(MapError),
    /// Page sharing failed.
    Share(ShareError),
    /// Rendezvous failed.
    Ipc(IpcError),
}

impl Error {
    /// Wire error reported to user space.
    pub fn to_abi(self) -> AbiError {
        match self {
            Self::NoSuchOperation => AbiError::NoSuchOperation,
            Self::InvalidArgument => AbiError::InvalidArgument,
            Self::Env(err) => env_to_abi(err),
            Self::Map(err) => map_to_abi(err),
            Self::Share(err) => share_to_abi(err),
            Self::Ipc(IpcError::NotReceiving) => AbiError::TargetNotReceiving,
            Self::Ipc(IpcError::Env(err)) => env_to_abi(err),
            Self::Ipc(IpcError::Share(err)) => share_to_abi(err),
            Self::Ipc(IpcError::Unaligned | IpcError::BadPermission) => AbiError::InvalidArgument,
        }
    }
}

fn env_to_abi(err: EnvError) -> AbiError {
    match err {
        EnvError::BadEnvironment => AbiError::BadEnvironment,
        EnvError::NoFreeSlot => AbiError::NoFreeSlot,
        EnvError::NoMemory => AbiError::NoMemory,
    }
}

fn map_to_abi(err: MapError) -> AbiError {
    match err {
        MapError::NoMemory => AbiError::NoMemory,
        MapError::Unaligned | MapError::OutOfRange => AbiError::InvalidArgument,
    }
}

fn share_to_abi(err: ShareError) -> AbiError {
    match err {
        ShareError::Env(err) => env_to_abi(err),
        ShareError::Map(err) => map_to_abi(err),
        ShareError::NotMapped | ShareError::ReadOnlySource => AbiError::InvalidArgument,
    }
}

impl From<EnvError> for Error {
    fn from(value: EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<MapError> for Error {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl From<ShareError> for Error {
    fn from(value: ShareError) -> Self {
        Self::Share(value)
    }
}

impl From<IpcError> for Error {
    fn from(value: IpcError) -> Self {
        Self::Ipc(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(
        &self,
        number: usize,
        ctx: &mut api::Context<'_>,
        args: &Args,
    ) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::NoSuchOperation)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        let mut table = Self::new();
        api::install_handlers(&mut table);
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_onto_wire_codes() {
        assert_eq!(Error::NoSuchOperation.to_abi(), AbiError::NoSuchOperation);
        assert_eq!(Error::Env(EnvError::NoFreeSlot).to_abi(), AbiError::NoFreeSlot);
        assert_eq!(Error::Map(MapError::NoMemory).to_abi(), AbiError::NoMemory);
        assert_eq!(Error::Map(MapError::Unaligned).to_abi(), AbiError::InvalidArgument);
        assert_eq!(
            Error::Share(ShareError::Map(MapError::NoMemory)).to_abi(),
            AbiError::NoMemory
        );
        assert_eq!(Error::Share(ShareError::ReadOnlySource).to_abi(), AbiError::InvalidArgument);
        assert_eq!(Error::Ipc(IpcError::NotReceiving).to_abi(), AbiError::TargetNotReceiving);
        assert_eq!(
            Error::Ipc(IpcError::Env(EnvError::BadEnvironment)).to_abi(),
            AbiError::BadEnvironment
        );
        assert_eq!(Error::Ipc(IpcError::Unaligned).to_abi(), AbiError::InvalidArgument);
    }

    #[test]
    fn empty_table_reports_unknown_operation() {
        let table = SyscallTable::new();
        assert!(table.handlers.iter().all(Option::is_none));
    }
}
