// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Blocking IPC helpers over the rendezvous syscalls
//! OWNERS: @runtime
//! PUBLIC API: send(), recv(), Message
//! DEPENDS_ON: sys::Sys
//! INVARIANTS: send() retries only on TargetNotReceiving and yields between attempts

use nucleus_abi::layout::UTOP;
use nucleus_abi::{EnvId, Error, Perm};

use crate::sys::{Platform, Sys, SysResult};

/// A completed receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    pub from: EnvId,
    pub value: usize,
    /// Permission of the transferred page; empty when none was mapped.
    pub perm: Perm,
}

/// Sends `value` to `target`, optionally offering the page at `page.0` with
/// permission `page.1`, yielding until the target is receiving.
pub fn send<P: Platform + ?Sized>(
    p: &mut P,
    target: EnvId,
    value: usize,
    page: Option<(usize, Perm)>,
) -> SysResult<()> {
    let (src_va, perm) = page.map_or((UTOP, 0), |(va, perm)| (va, perm.bits()));
    loop {
        match p.ipc_try_send(target, value, src_va, perm) {
            Err(Error::TargetNotReceiving) => p.yield_cpu(),
            other => return other,
        }
    }
}

/// Waits for a message, accepting a page at `dst_va` when one is given.
pub fn recv<P: Platform + ?Sized>(p: &mut P, dst_va: Option<usize>) -> SysResult<Message> {
    let [from, value, perm] = p.ipc_recv_raw(dst_va.unwrap_or(UTOP))?;
    Ok(Message { from: EnvId::from_reg(from), value, perm: Perm::from_bits_retain(perm) })
}
