// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Typed syscall wrappers over a pluggable trap backend
//! OWNERS: @runtime
//! PUBLIC API: Platform, Sys (blanket impl), SysResult
//! DEPENDS_ON: nucleus-abi (nr, Error, EnvId, Perm)
//! INVARIANTS: Arguments are passed in a0..a4 and the number in a7; a negative a0 decodes
//!             to nucleus_abi::Error

use core::fmt;

use nucleus_abi::{decode, nr, EnvId, EnvStatus, Error, Perm};

/// Result of a syscall wrapper.
pub type SysResult<T> = Result<T, Error>;

/// Trap backend the runtime runs on.
///
/// The OS build issues `ecall`; host tests route the call into a kernel
/// instance.
pub trait Platform {
    /// Performs syscall `number` and returns `a0..a3` as they stand when the caller resumes.
    fn ecall(&mut self, number: usize, args: [usize; 5]) -> [usize; 4];

    /// Copies one page of the caller's address space from `src` to `dst`.
    fn copy_page(&mut self, dst: usize, src: usize);

    /// User address of the page-fault upcall entry point.
    fn pgfault_entry(&self) -> usize;

    /// Diagnostic output for fatal runtime conditions.
    fn report(&mut self, _msg: fmt::Arguments<'_>) {}
}

fn ret(regs: [usize; 4]) -> SysResult<usize> {
    decode(regs[0] as isize)
}

/// Syscall surface available on every [`Platform`].
pub trait Sys: Platform {
    /// Writes `len` bytes at user address `va` to the console.
    fn cputs(&mut self, va: usize, len: usize) -> SysResult<()> {
        ret(self.ecall(nr::CPUTS, [va, len, 0, 0, 0])).map(drop)
    }

    /// Next console byte, or `None` when no input is pending.
    fn cgetc(&mut self) -> Option<u8> {
        match ret(self.ecall(nr::CGETC, [0; 5])) {
            Ok(0) | Err(_) => None,
            Ok(ch) => Some(ch as u8),
        }
    }

    fn getenvid(&mut self) -> EnvId {
        EnvId::from_reg(self.ecall(nr::GETENVID, [0; 5])[0])
    }

    fn env_destroy(&mut self, env: EnvId) -> SysResult<()> {
        ret(self.ecall(nr::ENV_DESTROY, [env.to_reg(), 0, 0, 0, 0])).map(drop)
    }

    fn yield_cpu(&mut self) {
        let _ = self.ecall(nr::YIELD, [0; 5]);
    }

    /// Creates a blank child. Returns the child's id in the parent and
    /// [`EnvId::SELF`] (raw 0) in the child.
    fn exofork(&mut self) -> SysResult<EnvId> {
        ret(self.ecall(nr::EXOFORK, [0; 5])).map(EnvId::from_reg)
    }

    fn env_set_status(&mut self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        ret(self.ecall(nr::ENV_SET_STATUS, [env.to_reg(), status as usize, 0, 0, 0])).map(drop)
    }

    /// Installs the trap-frame image stored at user address `frame`.
    fn env_set_trapframe(&mut self, env: EnvId, frame: usize) -> SysResult<()> {
        ret(self.ecall(nr::ENV_SET_TRAPFRAME, [env.to_reg(), frame, 0, 0, 0])).map(drop)
    }

    fn env_set_pgfault_upcall(&mut self, env: EnvId, entry: usize) -> SysResult<()> {
        ret(self.ecall(nr::ENV_SET_PGFAULT_UPCALL, [env.to_reg(), entry, 0, 0, 0])).map(drop)
    }

    fn page_alloc(&mut self, env: EnvId, va: usize, perm: Perm) -> SysResult<()> {
        ret(self.ecall(nr::PAGE_ALLOC, [env.to_reg(), va, perm.bits(), 0, 0])).map(drop)
    }

    fn page_map(
        &mut self,
        src: EnvId,
        src_va: usize,
        dst: EnvId,
        dst_va: usize,
        perm: Perm,
    ) -> SysResult<()> {
        let args = [src.to_reg(), src_va, dst.to_reg(), dst_va, perm.bits()];
        ret(self.ecall(nr::PAGE_MAP, args)).map(drop)
    }

    fn page_unmap(&mut self, env: EnvId, va: usize) -> SysResult<()> {
        ret(self.ecall(nr::PAGE_UNMAP, [env.to_reg(), va, 0, 0, 0])).map(drop)
    }

    /// Permission bits of the caller's mapping at `va` (empty when unmapped).
    fn page_perm(&mut self, va: usize) -> SysResult<Perm> {
        ret(self.ecall(nr::PAGE_QUERY, [va, 0, 0, 0, 0])).map(Perm::from_bits_retain)
    }

    /// True when the 2 MiB region holding `va` has a last-level table.
    fn region_mapped(&mut self, va: usize) -> SysResult<bool> {
        ret(self.ecall(nr::PAGE_QUERY, [va, 1, 0, 0, 0])).map(|present| present != 0)
    }

    fn ipc_try_send(
        &mut self,
        target: EnvId,
        value: usize,
        src_va: usize,
        perm: usize,
    ) -> SysResult<()> {
        ret(self.ecall(nr::IPC_TRY_SEND, [target.to_reg(), value, src_va, perm, 0])).map(drop)
    }

    /// Blocks in a receive; on success returns the receiver's `a1..a3`
    /// (sender, value, perm).
    fn ipc_recv_raw(&mut self, dst_va: usize) -> SysResult<[usize; 3]> {
        let regs = self.ecall(nr::IPC_RECV, [dst_va, 0, 0, 0, 0]);
        ret(regs)?;
        Ok([regs[1], regs[2], regs[3]])
    }
}

impl<P: Platform + ?Sized> Sys for P {}
