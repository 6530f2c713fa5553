// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous rendezvous IPC (one value plus an optional page)
//! OWNERS: @kernel-ipc-team
//! PUBLIC API: recv(env, dst_va), try_send(envs, frames, sender, target, value, src_va, perm), IpcError
//! DEPENDS_ON: env::EnvTable::{resolve, share_page}, nucleus_abi::{Perm, layout}
//! INVARIANTS: Exactly one send completes a receive; only a parked receiver is woken; send never
//!             blocks; a failed send leaves the receiver untouched; the receiver wakes with
//!             a0=0 a1=from a2=value a3=perm
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use nucleus_abi::layout::{PAGE_SIZE, UTOP};
use nucleus_abi::{reg, EnvId, EnvStatus, Perm};

use crate::env::{Env, EnvError, EnvTable, ShareError};
use crate::mm::{FramePool, PageFlags};


/// Errors raised by the rendezvous primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Receiver is not blocked in `recv`.
    NotReceiving,
    /// Address below `UTOP` that is not page aligned.
    Unaligned,
    /// Permission argument outside the syscall-permitted set.
    BadPermission,
    /// Target lookup failed.
    Env(EnvError),
    /// Page transfer failed.
    Share(ShareError),
}

impl From<EnvError> for IpcError {
    fn from(value: EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<ShareError> for IpcError {
    fn from(value: ShareError) -> Self {
        Self::Share(value)
    }
}

/// Parks `env` until a sender completes the rendezvous.
///
/// `dst_va >= UTOP` means the receiver does not want a page. On error the
/// environment keeps running.
pub fn recv(env: &mut Env, dst_va: usize) -> Result<(), IpcError> {
    if dst_va < UTOP && dst_va % PAGE_SIZE != 0 {
        return Err(IpcError::Unaligned);
    }
    env.ipc.receiving = true;
    env.ipc.dst_va = dst_va;
    env.status = EnvStatus::NotRunnable;
    crate::log_trace!(target: "ipc", "env {} receiving at 0x{:x}", env.id(), dst_va);
    Ok(())
}

/// Completes a pending receive in `target`, or fails with `NotReceiving`.
///
/// The target is looked up without an authority check: any environment may
/// send to any receiver. A page moves only when `src_va < UTOP` and the
/// receiver asked for one.
pub fn try_send(
    envs: &mut EnvTable,
    frames: &mut FramePool,
    sender: EnvId,
    target: EnvId,
    value: usize,
    src_va: usize,
    perm: usize,
) -> Result<(), IpcError> {
    let target = envs.resolve(target, sender, false)?;
    let dst_va = match envs.get(target) {
        Some(env) if env.ipc.receiving && env.status == EnvStatus::NotRunnable => env.ipc.dst_va,
        Some(_) => return Err(IpcError::NotReceiving),
        None => return Err(IpcError::Env(EnvError::BadEnvironment)),
    };

    let mut moved = 0;
    if src_va < UTOP {
        if src_va % PAGE_SIZE != 0 {
            return Err(IpcError::Unaligned);
        }
        let perm = Perm::from_user(perm).ok_or(IpcError::BadPermission)?;
        if dst_va < UTOP {
            envs.share_page(frames, sender, src_va, target, dst_va, perm)?;
            moved = perm.bits();
        } else {
            // the offered page is validated even when the receiver takes none
            let source = envs.get(sender).ok_or(IpcError::Env(EnvError::BadEnvironment))?;
            let mapping = source.space.lookup(frames, src_va).ok_or(ShareError::NotMapped)?;
            if perm.contains(Perm::WRITE) && !mapping.flags.contains(PageFlags::WRITE) {
                return Err(ShareError::ReadOnlySource.into());
            }
        }
    }

    let receiver = envs.get_mut(target).ok_or(IpcError::Env(EnvError::BadEnvironment))?;
    receiver.ipc.receiving = false;
    receiver.ipc.from = sender;
    receiver.ipc.value = value;
    receiver.ipc.perm = moved;
    receiver.status = EnvStatus::Runnable;
    receiver.frame.x[reg::A0] = 0;
    receiver.frame.x[reg::A1] = sender.to_reg();
    receiver.frame.x[reg::A2] = value;
    receiver.frame.x[reg::A3] = moved;
    crate::log_trace!(target: "ipc", "env {} -> env {} value {} perm 0x{:x}", sender, target, value, moved);
    Ok(())
}
