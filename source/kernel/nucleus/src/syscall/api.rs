// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: env::EnvTable, ipc, mm::{FramePool, PageTable}, hal::Console, cpu::CpuState
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; all validation completes
//!             before the first mutation; handlers never switch environments themselves
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use nucleus_abi::layout::UTOP;
use nucleus_abi::{nr, EnvId, EnvStatus, Perm, TRAPFRAME_WORDS};

use super::{Args, Error, SysResult, SyscallTable};
use crate::cpu::CpuState;
use crate::env::{EnvError, EnvTable, Teardown};
use crate::hal::Console;
use crate::ipc;
use crate::mm::{FramePool, MapError, PageFlags, PageTable};
use crate::trap::{FaultUpcall, TrapFrame};
use crate::types::{CpuId, VirtAddr};

/// Bytes copied per console write.
const CPUTS_CHUNK: usize = 128;
const FRAME_BYTES: usize = TRAPFRAME_WORDS * core::mem::size_of::<usize>();

// Typed decoders for seL4-style Decode→Check→Execute

#[derive(Copy, Clone)]
struct CputsArgsTyped {
    ptr: usize,
    len: usize,
}

impl CputsArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { ptr: args.get(0), len: args.get(1) })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        match self.ptr.checked_add(self.len) {
            Some(end) if end <= UTOP => Ok(()),
            _ => Err(Error::InvalidArgument),
        }
    }
}

#[derive(Copy, Clone)]
struct SetStatusArgsTyped {
    id: EnvId,
    status: EnvStatus,
}

impl SetStatusArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let status = EnvStatus::from_raw(args.get(1)).ok_or(Error::InvalidArgument)?;
        Ok(Self { id: EnvId::from_reg(args.get(0)), status })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        match self.status {
            EnvStatus::Runnable | EnvStatus::NotRunnable => Ok(()),
            _ => Err(Error::InvalidArgument),
        }
    }
}

#[derive(Copy, Clone)]
struct SetTrapFrameArgsTyped {
    id: EnvId,
    ptr: usize,
}

impl SetTrapFrameArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { id: EnvId::from_reg(args.get(0)), ptr: args.get(1) })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        match self.ptr.checked_add(FRAME_BYTES) {
            Some(end) if end <= UTOP => Ok(()),
            _ => Err(Error::InvalidArgument),
        }
    }
}

#[derive(Copy, Clone)]
struct UpcallArgsTyped {
    id: EnvId,
    entry: usize,
}

impl UpcallArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { id: EnvId::from_reg(args.get(0)), entry: args.get(1) })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if self.entry >= UTOP {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

#[derive(Copy, Clone)]
struct PageArgsTyped {
    id: EnvId,
    va: VirtAddr,
    perm: Perm,
}

impl PageArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            id: EnvId::from_reg(args.get(0)),
            va: VirtAddr::user_page(args.get(1)).ok_or(Error::InvalidArgument)?,
            perm: Perm::from_user(args.get(2)).ok_or(Error::InvalidArgument)?,
        })
    }
}

#[derive(Copy, Clone)]
struct PageMapArgsTyped {
    src: EnvId,
    src_va: VirtAddr,
    dst: EnvId,
    dst_va: VirtAddr,
    perm: Perm,
}

impl PageMapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            src: EnvId::from_reg(args.get(0)),
            src_va: VirtAddr::user_page(args.get(1)).ok_or(Error::InvalidArgument)?,
            dst: EnvId::from_reg(args.get(2)),
            dst_va: VirtAddr::user_page(args.get(3)).ok_or(Error::InvalidArgument)?,
            perm: Perm::from_user(args.get(4)).ok_or(Error::InvalidArgument)?,
        })
    }
}

#[derive(Copy, Clone)]
struct UnmapArgsTyped {
    id: EnvId,
    va: VirtAddr,
}

impl UnmapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            id: EnvId::from_reg(args.get(0)),
            va: VirtAddr::user_page(args.get(1)).ok_or(Error::InvalidArgument)?,
        })
    }
}

#[derive(Copy, Clone)]
struct SendArgsTyped {
    target: EnvId,
    value: usize,
    src_va: usize,
    perm: usize,
}

impl SendArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            target: EnvId::from_reg(args.get(0)),
            value: args.get(1),
            src_va: args.get(2),
            perm: args.get(3),
        })
    }
}

#[derive(Copy, Clone)]
struct QueryArgsTyped {
    va: VirtAddr,
    level: usize,
}

impl QueryArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self { va: VirtAddr::new(args.get(0)), level: args.get(1) })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        if !self.va.is_user() || self.level > 1 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// Kernel state one syscall may touch, borrowed from the locked kernel.
pub struct Context<'a> {
    pub caller: EnvId,
    pub cpu: CpuId,
    pub envs: &'a mut EnvTable,
    pub frames: &'a mut FramePool,
    pub template: &'a PageTable,
    pub cpus: &'a mut [CpuState],
    pub console: &'a mut dyn Console,
    reschedule: bool,
    keep_frame: bool,
}

impl<'a> Context<'a> {
    /// Creates a new context for `caller` running on `cpu`.
    pub fn new(
        caller: EnvId,
        cpu: CpuId,
        envs: &'a mut EnvTable,
        frames: &'a mut FramePool,
        template: &'a PageTable,
        cpus: &'a mut [CpuState],
        console: &'a mut dyn Console,
    ) -> Self {
        Self {
            caller,
            cpu,
            envs,
            frames,
            template,
            cpus,
            console,
            reschedule: false,
            keep_frame: false,
        }
    }

    /// The caller must give up this CPU before returning to user mode.
    pub fn reschedule_requested(&self) -> bool {
        self.reschedule
    }

    /// The caller's saved frame was replaced and must resume without a return value.
    pub fn keeps_frame(&self) -> bool {
        self.keep_frame
    }

    fn resolve(&self, id: EnvId) -> Result<EnvId, Error> {
        Ok(self.envs.resolve(id, self.caller, true)?)
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(nr::CPUTS, sys_cputs);
    table.register(nr::CGETC, sys_cgetc);
    table.register(nr::GETENVID, sys_getenvid);
    table.register(nr::ENV_DESTROY, sys_env_destroy);
    table.register(nr::YIELD, sys_yield);
    table.register(nr::EXOFORK, sys_exofork);
    table.register(nr::ENV_SET_STATUS, sys_env_set_status);
    table.register(nr::ENV_SET_TRAPFRAME, sys_env_set_trapframe);
    table.register(nr::ENV_SET_PGFAULT_UPCALL, sys_env_set_pgfault_upcall);
    table.register(nr::PAGE_ALLOC, sys_page_alloc);
    table.register(nr::PAGE_MAP, sys_page_map);
    table.register(nr::PAGE_UNMAP, sys_page_unmap);
    table.register(nr::IPC_TRY_SEND, sys_ipc_try_send);
    table.register(nr::IPC_RECV, sys_ipc_recv);
    table.register(nr::PAGE_QUERY, sys_page_query);
}

fn sys_cputs(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = CputsArgsTyped::decode(args)?;
    typed.check()?;
    let env = ctx.envs.get(ctx.caller).ok_or(EnvError::BadEnvironment)?;
    env.space
        .check_user(ctx.frames, typed.ptr, typed.len, false)
        .map_err(|_| Error::InvalidArgument)?;

    let mut chunk = [0u8; CPUTS_CHUNK];
    let mut done = 0;
    while done < typed.len {
        let n = (typed.len - done).min(CPUTS_CHUNK);
        env.space
            .read_user(ctx.frames, typed.ptr + done, &mut chunk[..n])
            .map_err(|_| Error::InvalidArgument)?;
        ctx.console.write_bytes(&chunk[..n]);
        done += n;
    }
    Ok(0)
}

fn sys_cgetc(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.console.read_byte().map_or(0, usize::from))
}

fn sys_getenvid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.caller.to_reg())
}

fn sys_env_destroy(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let id = ctx.resolve(EnvId::from_reg(args.get(0)))?;
    if id == ctx.caller {
        log_info!(target: "sys", "[{}] exiting gracefully", ctx.caller);
    } else {
        log_info!(target: "sys", "[{}] destroying {}", ctx.caller, id);
    }
    if ctx.envs.destroy(id, ctx.cpu, ctx.frames)? == Teardown::Freed {
        for cpu in ctx.cpus.iter_mut().filter(|cpu| cpu.current == Some(id)) {
            cpu.current = None;
        }
    }
    if id == ctx.caller {
        ctx.reschedule = true;
    }
    Ok(0)
}

fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ctx.reschedule = true;
    Ok(0)
}

fn sys_exofork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let frame = ctx.envs.get(ctx.caller).ok_or(EnvError::BadEnvironment)?.frame;
    let child = ctx.envs.allocate(ctx.caller, ctx.frames, ctx.template)?;
    let env = ctx.envs.get_mut(child).ok_or(EnvError::BadEnvironment)?;
    env.frame = frame;
    env.frame.set_return(0);
    Ok(child.to_reg())
}

fn sys_env_set_status(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SetStatusArgsTyped::decode(args)?;
    typed.check()?;
    let id = ctx.resolve(typed.id)?;
    let caller = ctx.caller;
    let env = ctx.envs.get_mut(id).ok_or(EnvError::BadEnvironment)?;
    match (env.status, typed.status) {
        (EnvStatus::Dying, _) => return Err(EnvError::BadEnvironment.into()),
        (EnvStatus::Running, EnvStatus::Runnable) => env.stop_requested = false,
        (EnvStatus::Running, _) if id == caller => {
            env.status = EnvStatus::NotRunnable;
            ctx.reschedule = true;
        }
        (EnvStatus::Running, _) => env.stop_requested = true,
        (_, EnvStatus::Runnable) => {
            // waking a blocked receiver cancels its receive
            env.ipc.receiving = false;
            env.status = EnvStatus::Runnable;
        }
        (_, status) => env.status = status,
    }
    log_debug!(target: "sys", "[{}] set status of {} to {}", caller, id, typed.status.label());
    Ok(0)
}

fn sys_env_set_trapframe(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SetTrapFrameArgsTyped::decode(args)?;
    typed.check()?;
    let id = ctx.resolve(typed.id)?;
    let mut image = [0u8; FRAME_BYTES];
    ctx.envs
        .get(ctx.caller)
        .ok_or(EnvError::BadEnvironment)?
        .space
        .read_user(ctx.frames, typed.ptr, &mut image)
        .map_err(|_| Error::InvalidArgument)?;
    let mut frame = TrapFrame::from_bytes(&image).ok_or(Error::InvalidArgument)?;
    frame.sanitize_user();

    let env = ctx.envs.get_mut(id).ok_or(EnvError::BadEnvironment)?;
    if id == ctx.caller {
        env.frame = frame;
        ctx.keep_frame = true;
    } else if env.status == EnvStatus::Running {
        // the target's CPU owns its frame until it traps again
        env.pending_frame = Some(frame);
    } else {
        env.frame = frame;
    }
    Ok(0)
}

fn sys_env_set_pgfault_upcall(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = UpcallArgsTyped::decode(args)?;
    typed.check()?;
    let id = ctx.resolve(typed.id)?;
    ctx.envs.get_mut(id).ok_or(EnvError::BadEnvironment)?.upcall =
        Some(FaultUpcall::new(typed.entry));
    Ok(0)
}

fn sys_page_alloc(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageArgsTyped::decode(args)?;
    let id = ctx.resolve(typed.id)?;
    let env = ctx.envs.get_mut(id).ok_or(EnvError::BadEnvironment)?;
    let frame = ctx.frames.allocate().ok_or(MapError::NoMemory)?;
    if let Err(err) = env.space.map(ctx.frames, typed.va.raw(), frame, PageFlags::from_user(typed.perm))
    {
        ctx.frames.free(frame);
        return Err(err.into());
    }
    Ok(0)
}

fn sys_page_map(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = PageMapArgsTyped::decode(args)?;
    let src = ctx.resolve(typed.src)?;
    let dst = ctx.resolve(typed.dst)?;
    ctx.envs.share_page(
        ctx.frames,
        src,
        typed.src_va.raw(),
        dst,
        typed.dst_va.raw(),
        typed.perm,
    )?;
    Ok(0)
}

fn sys_page_unmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = UnmapArgsTyped::decode(args)?;
    let id = ctx.resolve(typed.id)?;
    let env = ctx.envs.get_mut(id).ok_or(EnvError::BadEnvironment)?;
    // idempotent
    let _ = env.space.unmap(ctx.frames, typed.va.raw());
    Ok(0)
}

fn sys_ipc_try_send(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = SendArgsTyped::decode(args)?;
    ipc::try_send(
        ctx.envs,
        ctx.frames,
        ctx.caller,
        typed.target,
        typed.value,
        typed.src_va,
        typed.perm,
    )?;
    Ok(0)
}

fn sys_ipc_recv(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let env = ctx.envs.get_mut(ctx.caller).ok_or(EnvError::BadEnvironment)?;
    ipc::recv(env, args.get(0))?;
    ctx.reschedule = true;
    Ok(0)
}

fn sys_page_query(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = QueryArgsTyped::decode(args)?;
    typed.check()?;
    let env = ctx.envs.get(ctx.caller).ok_or(EnvError::BadEnvironment)?;
    let va = typed.va.page_base().raw();
    Ok(match typed.level {
        0 => env.space.lookup(ctx.frames, va).map_or(0, |m| m.flags.to_user().bits()),
        _ => usize::from(env.space.has_leaf_table(ctx.frames, va)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemoryConsole;
    use nucleus_abi::reg;
    use crate::types::CpuId;
    use alloc::vec::Vec;

    struct Harness {
        envs: EnvTable,
        frames: FramePool,
        template: PageTable,
        cpus: Vec<CpuState>,
        console: MemoryConsole,
        table: SyscallTable,
        caller: EnvId,
    }

    impl Harness {
        fn new(slots: usize) -> Self {
            let mut frames = FramePool::new(64);
            let template = PageTable::kernel_template(&mut frames).expect("template");
            let mut envs = EnvTable::new(slots);
            let caller = envs.allocate(EnvId::SELF, &mut frames, &template).expect("caller");
            let env = envs.get_mut(caller).expect("caller");
            env.status = EnvStatus::Running;
            env.cpu = Some(CpuId::BOOT);
            let mut cpu = CpuState::new(CpuId::BOOT);
            cpu.current = Some(caller);
            Self {
                envs,
                frames,
                template,
                cpus: alloc::vec![cpu],
                console: MemoryConsole::new(),
                table: SyscallTable::default(),
                caller,
            }
        }

        fn call(&mut self, number: usize, regs: [usize; 6]) -> (SysResult<usize>, bool) {
            let mut ctx = Context::new(
                self.caller,
                CpuId::BOOT,
                &mut self.envs,
                &mut self.frames,
                &self.template,
                &mut self.cpus,
                &mut self.console,
            );
            let result = self.table.dispatch(number, &mut ctx, &Args::new(regs));
            (result, ctx.reschedule_requested())
        }
    }

    const RW: usize = Perm::VALID.bits() | Perm::USER.bits() | Perm::WRITE.bits();

    #[test]
    fn unknown_number_is_rejected() {
        let mut h = Harness::new(2);
        assert_eq!(h.call(15, [0; 6]).0, Err(Error::NoSuchOperation));
        assert_eq!(h.call(usize::MAX, [0; 6]).0, Err(Error::NoSuchOperation));
    }

    #[test]
    fn exofork_copies_frame_with_zero_return() {
        let mut h = Harness::new(2);
        h.envs.get_mut(h.caller).expect("caller").frame.x[reg::A0] = 77;
        h.envs.get_mut(h.caller).expect("caller").frame.sepc = 0x80_0010;
        let child = EnvId::from_reg(h.call(nr::EXOFORK, [0; 6]).0.expect("fork"));
        let env = h.envs.get(child).expect("child");
        assert_eq!(env.status, EnvStatus::NotRunnable);
        assert_eq!(env.parent(), h.caller);
        assert_eq!(env.frame.x[reg::A0], 0);
        assert_eq!(env.frame.sepc, 0x80_0010);
    }

    #[test]
    fn set_status_rejects_other_codes() {
        let mut h = Harness::new(2);
        let child = EnvId::from_reg(h.call(nr::EXOFORK, [0; 6]).0.expect("fork"));
        for status in [EnvStatus::Free, EnvStatus::Dying, EnvStatus::Running] {
            let regs = [child.to_reg(), status as usize, 0, 0, 0, 0];
            assert_eq!(h.call(nr::ENV_SET_STATUS, regs).0, Err(Error::InvalidArgument));
        }
        assert_eq!(h.call(nr::ENV_SET_STATUS, [child.to_reg(), 99, 0, 0, 0, 0]).0, Err(Error::InvalidArgument));
        let regs = [child.to_reg(), EnvStatus::Runnable as usize, 0, 0, 0, 0];
        assert_eq!(h.call(nr::ENV_SET_STATUS, regs).0, Ok(0));
        assert_eq!(h.envs.get(child).expect("child").status, EnvStatus::Runnable);
    }

    #[test]
    fn stopping_self_requests_reschedule() {
        let mut h = Harness::new(2);
        let regs = [0, EnvStatus::NotRunnable as usize, 0, 0, 0, 0];
        assert_eq!(h.call(nr::ENV_SET_STATUS, regs), (Ok(0), true));
        assert_eq!(h.envs.get(h.caller).expect("caller").status, EnvStatus::NotRunnable);
    }

    #[test]
    fn page_alloc_validates_before_allocating() {
        let mut h = Harness::new(2);
        let free = h.frames.free_count();
        assert_eq!(h.call(nr::PAGE_ALLOC, [0, 0x1001, RW, 0, 0, 0]).0, Err(Error::InvalidArgument));
        assert_eq!(h.call(nr::PAGE_ALLOC, [0, UTOP, RW, 0, 0, 0]).0, Err(Error::InvalidArgument));
        assert_eq!(
            h.call(nr::PAGE_ALLOC, [0, 0x1000, Perm::VALID.bits(), 0, 0, 0]).0,
            Err(Error::InvalidArgument)
        );
        assert_eq!(h.frames.free_count(), free);
    }

    #[test]
    fn page_query_reports_permissions_and_tables() {
        let mut h = Harness::new(2);
        assert_eq!(h.call(nr::PAGE_QUERY, [0x1000, 0, 0, 0, 0, 0]).0, Ok(0));
        assert_eq!(h.call(nr::PAGE_QUERY, [0x1000, 1, 0, 0, 0, 0]).0, Ok(0));
        h.call(nr::PAGE_ALLOC, [0, 0x1000, RW, 0, 0, 0]).0.expect("alloc");
        assert_eq!(h.call(nr::PAGE_QUERY, [0x1234, 0, 0, 0, 0, 0]).0, Ok(RW | Perm::READ.bits()));
        assert_eq!(h.call(nr::PAGE_QUERY, [0x1f_f000, 1, 0, 0, 0, 0]).0, Ok(1));
        assert_eq!(h.call(nr::PAGE_QUERY, [0x20_0000, 1, 0, 0, 0, 0]).0, Ok(0));
        assert_eq!(h.call(nr::PAGE_QUERY, [UTOP, 0, 0, 0, 0, 0]).0, Err(Error::InvalidArgument));
        assert_eq!(h.call(nr::PAGE_QUERY, [0x1000, 2, 0, 0, 0, 0]).0, Err(Error::InvalidArgument));
    }

    #[test]
    fn cputs_writes_user_bytes_and_rejects_unmapped_buffers() {
        let mut h = Harness::new(2);
        h.call(nr::PAGE_ALLOC, [0, 0x1000, RW, 0, 0, 0]).0.expect("alloc");
        let env = h.envs.get(h.caller).expect("caller");
        env.space.write_user(&mut h.frames, 0x1ffe, b"hi").expect("write");
        assert_eq!(h.call(nr::CPUTS, [0x1ffe, 2, 0, 0, 0, 0]).0, Ok(0));
        assert_eq!(h.console.output(), b"hi");
        assert_eq!(h.call(nr::CPUTS, [0x1ffe, 3, 0, 0, 0, 0]).0, Err(Error::InvalidArgument));
        assert_eq!(h.console.output(), b"hi");
        assert!(h.envs.get(h.caller).is_some());
    }

    #[test]
    fn cgetc_is_non_blocking() {
        let mut h = Harness::new(2);
        assert_eq!(h.call(nr::CGETC, [0; 6]).0, Ok(0));
        h.console.push_input(b"x");
        assert_eq!(h.call(nr::CGETC, [0; 6]).0, Ok(usize::from(b'x')));
    }
}
