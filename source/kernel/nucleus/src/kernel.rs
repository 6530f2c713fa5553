// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state behind the big kernel lock and the trap-facing entry points
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::{new, enter, config}, KernelGuard (syscall/timer/page_fault/schedule/
//!             invoke/create_env + inspection helpers), Dispatch
//! DEPENDS_ON: sync::BigKernelLock, env, sched, syscall, trap, loader
//! INVARIANTS: Every kernel entry holds the lock until a Dispatch is produced; the trap frame
//!             is saved into the current environment before any other work; a Dispatch is
//!             built from copied state after the lock is released; an environment is Running
//!             on at most one CPU; remote stops and frame installs land at the next entry
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write as _;
use core::marker::PhantomData;

use nucleus_abi::{EnvId, EnvStatus, Error as AbiError};

use crate::config::{ConfigError, KernelConfig};
use crate::cpu::{CpuState, CpuStatus};
use crate::env::{EnvTable, Teardown};
use crate::hal::Console;
use crate::loader::{self, LoadError, ProgramImage};
use crate::mm::{AccessFault, FrameNumber, FramePool, Mapping, PageTable};
use crate::sched::{self, Pick};
use crate::sync::{BigKernelLock, BigLockGuard};
use crate::syscall::{api::Context, Args, SyscallTable};
use crate::trap::{self, TrapFrame};
use crate::types::CpuId;

/// Everything the big kernel lock protects.
pub struct KernelState {
    envs: EnvTable,
    frames: FramePool,
    template: PageTable,
    cpus: Vec<CpuState>,
    console: Box<dyn Console>,
    syscalls: SyscallTable,
}

/// The kernel: one lock around all mutable state.
pub struct Kernel {
    config: KernelConfig,
    state: BigKernelLock<KernelState>,
}

static_assertions::assert_impl_all!(Kernel: Send, Sync);
static_assertions::assert_not_impl_any!(KernelGuard<'static>: Send);

/// What the trap layer does after leaving the kernel.
#[must_use = "the CPU must either resume an environment or idle"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Install `satp`, restore `frame` and `sret` into `env`.
    Run { env: EnvId, frame: TrapFrame, satp: usize },
    /// Nothing to run on this CPU; `idle` when no environment needs a CPU anywhere.
    Halt { idle: bool },
}

impl Kernel {
    /// Builds the frame pool, kernel template, environment table and CPU records.
    pub fn new(config: KernelConfig, console: Box<dyn Console>) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut frames = FramePool::new(config.frames);
        let template = PageTable::kernel_template(&mut frames)
            .map_err(|_| ConfigError::Frames(config.frames))?;
        let cpus = (0..config.cpus).map(|i| CpuState::new(CpuId::from_raw(i as u16))).collect();
        log_info!(
            target: "kernel",
            "nucleus: {} env slots, {} cpus, {} frames",
            config.max_envs,
            config.cpus,
            config.frames
        );
        Ok(Self {
            config,
            state: BigKernelLock::new(KernelState {
                envs: EnvTable::new(config.max_envs),
                frames,
                template,
                cpus,
                console,
                syscalls: SyscallTable::default(),
            }),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Trap entry on `cpu`: takes the big lock.
    ///
    /// An environment this CPU was running that another CPU destroyed in the
    /// meantime is reclaimed here, before anything else.
    pub fn enter(&self, cpu: CpuId) -> KernelGuard<'_> {
        assert!(cpu.as_index() < self.config.cpus, "cpu {} outside the configured set", cpu);
        let mut state = self.state.lock(cpu);
        let this = &mut state.cpus[cpu.as_index()];
        this.status = CpuStatus::Started;
        let current = this.current;
        if let Some(id) = current {
            let state = &mut *state;
            if state.envs.get(id).map(|env| env.status) == Some(EnvStatus::Dying) {
                log_info!(target: "kernel", "cpu {} reclaims dying env {}", cpu, id);
                if state.envs.free(id, &mut state.frames).is_ok() {
                    state.cpus[cpu.as_index()].current = None;
                }
            }
        }
        KernelGuard { state, cpu, _not_send: PhantomData }
    }
}

/// Scoped hold of the big kernel lock on one CPU. Dropping it releases the lock.
pub struct KernelGuard<'a> {
    state: BigLockGuard<'a, KernelState>,
    cpu: CpuId,
    _not_send: PhantomData<*const ()>,
}

impl<'a> KernelGuard<'a> {
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Environment this CPU is running, if any.
    pub fn current(&self) -> Option<EnvId> {
        self.state.cpus[self.cpu.as_index()].current
    }

    /// Creates a runnable root environment from a boot image.
    pub fn create_env(&mut self, image: &ProgramImage<'_>) -> Result<EnvId, LoadError> {
        let state = &mut *self.state;
        loader::load(&mut state.envs, &mut state.frames, &state.template, image)
    }

    /// System call from the current environment.
    ///
    /// `frame` is the state saved on trap entry; the return value lands in `a0`
    /// of the saved copy and the pc moves past the `ecall`. A call that traps
    /// into a pending stop or frame install is not executed.
    pub fn syscall(mut self, frame: &TrapFrame) -> Dispatch {
        let caller = match self.save_frame(frame) {
            Some(Entry::Trap(id)) => id,
            Some(Entry::Superseded(id)) => return self.continue_superseded(id),
            None => return self.schedule(),
        };
        let (number, args) = {
            let env = self.state.envs.get_mut(caller);
            let Some(env) = env else {
                return self.schedule();
            };
            env.frame.sepc += 4;
            (env.frame.syscall_number(), env.frame.syscall_args())
        };
        let outcome = self.run_syscall(caller, number, &args);
        match self.state.envs.get_mut(caller) {
            Some(env) => {
                if !outcome.keep_frame {
                    env.frame.set_return(outcome.ret);
                }
                if outcome.reschedule || env.status != EnvStatus::Running {
                    return self.schedule();
                }
                self.resume(caller)
            }
            None => self.schedule(),
        }
    }

    /// Timer interrupt: the current environment's slice is over.
    pub fn timer(mut self, frame: &TrapFrame) -> Dispatch {
        let _ = self.save_frame(frame);
        self.schedule()
    }

    /// User page fault at `fault_va` with `fec` error bits `err`.
    ///
    /// The fault is reflected to the environment's upcall; without a usable
    /// upcall the environment is destroyed.
    pub fn page_fault(mut self, frame: &TrapFrame, fault_va: usize, err: usize) -> Dispatch {
        let id = match self.save_frame(frame) {
            Some(Entry::Trap(id)) => id,
            Some(Entry::Superseded(id)) => return self.continue_superseded(id),
            None => return self.schedule(),
        };
        let state = &mut *self.state;
        let Some(env) = state.envs.get_mut(id) else {
            return self.schedule();
        };
        match trap::reflect_page_fault(env, &mut state.frames, fault_va, err) {
            Ok(()) if env.status == EnvStatus::Running => self.resume(id),
            Ok(()) => self.schedule(),
            Err(reason) => {
                log_warn!(
                    target: "trap",
                    "[{}] user fault va {:08x} ip {:08x}: {:?}",
                    id,
                    fault_va,
                    env.frame.sepc,
                    reason
                );
                self.destroy_current(id);
                self.schedule()
            }
        }
    }

    /// Picks the next environment for this CPU and releases the lock.
    pub fn schedule(mut self) -> Dispatch {
        let this = self.cpu;
        let state = &mut *self.state;
        let cpu = &mut state.cpus[this.as_index()];
        match sched::pick(&state.envs, cpu) {
            Pick::Run(next) => {
                if let Some(prev) = cpu.current {
                    if let Some(env) = state.envs.get_mut(prev) {
                        if env.status == EnvStatus::Running && env.cpu == Some(this) {
                            env.status = EnvStatus::Runnable;
                        }
                    }
                }
                let Some(env) = state.envs.get_mut(next) else {
                    unreachable!("picked env {} vanished under the lock", next);
                };
                assert_eq!(env.status, EnvStatus::Runnable, "dispatching env {} in wrong state", next);
                env.status = EnvStatus::Running;
                env.cpu = Some(this);
                env.runs += 1;
                cpu.current = Some(next);
                cpu.dispatches += 1;
                self.resume(next)
            }
            Pick::Halt => {
                cpu.current = None;
                cpu.status = CpuStatus::Halted;
                let idle = !state.envs.has_work();
                if idle {
                    log_info!(target: "sched", "no runnable environments; cpu {} idle", this);
                }
                drop(self);
                Dispatch::Halt { idle }
            }
        }
    }

    /// Runs syscall `number` on behalf of the current environment without trap bookkeeping.
    ///
    /// Returns the encoded result (non-negative value or negated error code).
    pub fn invoke(&mut self, number: usize, args: [usize; 6]) -> isize {
        match self.current() {
            Some(caller) => self.run_syscall(caller, number, &Args::new(args)).ret,
            None => AbiError::BadEnvironment.to_ret(),
        }
    }

    /// Copies user memory of `env` (copy-from-user).
    pub fn read_user(&self, env: EnvId, va: usize, buf: &mut [u8]) -> Result<(), AccessFault> {
        let state = &*self.state;
        match state.envs.get(env) {
            Some(env) => env.space.read_user(&state.frames, va, buf),
            None => Err(AccessFault { va, present: false, write: false }),
        }
    }

    /// User store into `env`, as the MMU would perform it.
    ///
    /// A refused store reports the fault that the trap layer turns into
    /// [`KernelGuard::page_fault`]; nothing is written in that case.
    pub fn write_user(&mut self, env: EnvId, va: usize, bytes: &[u8]) -> Result<(), AccessFault> {
        let state = &mut *self.state;
        match state.envs.get(env) {
            Some(env) => env.space.write_user(&mut state.frames, va, bytes),
            None => Err(AccessFault { va, present: false, write: true }),
        }
    }

    pub fn lookup(&self, env: EnvId, va: usize) -> Option<Mapping> {
        let state = &*self.state;
        state.envs.get(env)?.space.lookup(&state.frames, va)
    }

    pub fn frame_refcount(&self, frame: FrameNumber) -> u32 {
        self.state.frames.refcount(frame)
    }

    pub fn free_frames(&self) -> usize {
        self.state.frames.free_count()
    }

    pub fn free_env_slots(&self) -> usize {
        self.state.envs.free_slots()
    }

    pub fn env_status(&self, env: EnvId) -> Option<EnvStatus> {
        self.state.envs.get(env).map(|env| env.status)
    }

    /// Saved user state of `env`.
    pub fn saved_frame(&self, env: EnvId) -> Option<TrapFrame> {
        self.state.envs.get(env).map(|env| env.frame)
    }

    pub fn cpu_status(&self, cpu: CpuId) -> Option<CpuStatus> {
        self.state.cpus.get(cpu.as_index()).map(|cpu| cpu.status)
    }

    /// Environment `cpu` is currently running, if any.
    pub fn cpu_current(&self, cpu: CpuId) -> Option<EnvId> {
        self.state.cpus.get(cpu.as_index()).and_then(|cpu| cpu.current)
    }

    /// Makes frame allocation fail after `successes` more allocations.
    #[cfg(feature = "failpoints")]
    pub fn fail_frames_after(&mut self, successes: usize) {
        self.state.frames.fail_after(successes);
    }

    #[cfg(feature = "failpoints")]
    pub fn clear_frame_failpoint(&mut self) {
        self.state.frames.clear_failpoint();
    }

    /// Monitor listing of live environments.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{}", self.state.envs);
        out
    }

    fn run_syscall(&mut self, caller: EnvId, number: usize, args: &Args) -> SyscallOutcome {
        let state = &mut *self.state;
        let mut ctx = Context::new(
            caller,
            self.cpu,
            &mut state.envs,
            &mut state.frames,
            &state.template,
            &mut state.cpus,
            state.console.as_mut(),
        );
        let result = state.syscalls.dispatch(number, &mut ctx, args);
        let outcome = SyscallOutcome {
            ret: match result {
                Ok(value) => value as isize,
                Err(err) => err.to_abi().to_ret(),
            },
            reschedule: ctx.reschedule_requested(),
            keep_frame: ctx.keeps_frame(),
        };
        if let Err(err) = result {
            log_debug!(target: "sys", "[{}] syscall {} failed: {}", caller, number, err);
        }
        outcome
    }

    /// Stores `frame` into the current environment, then applies a frame
    /// installed by another environment and a pending stop.
    ///
    /// A stopped environment keeps its trap-time pc, so an interrupted
    /// `ecall` is issued again once it is made runnable.
    fn save_frame(&mut self, frame: &TrapFrame) -> Option<Entry> {
        let this = self.cpu;
        let state = &mut *self.state;
        let id = state.cpus[this.as_index()].current?;
        let env = state.envs.get_mut(id)?;
        if env.status != EnvStatus::Running || env.cpu != Some(this) {
            return None;
        }
        env.frame = *frame;
        let mut superseded = false;
        if let Some(installed) = env.pending_frame.take() {
            env.frame = installed;
            superseded = true;
        }
        if env.stop_requested {
            env.stop_requested = false;
            env.status = EnvStatus::NotRunnable;
            superseded = true;
        }
        if superseded {
            log_debug!(target: "kernel", "[{}] trap dropped on cpu {}", id, this);
            Some(Entry::Superseded(id))
        } else {
            Some(Entry::Trap(id))
        }
    }

    /// Leaves the kernel after a trap that [`Self::save_frame`] dropped.
    fn continue_superseded(self, id: EnvId) -> Dispatch {
        let running = self.state.envs.get(id).is_some_and(|env| env.status == EnvStatus::Running);
        if running {
            self.resume(id)
        } else {
            self.schedule()
        }
    }

    fn destroy_current(&mut self, id: EnvId) {
        let state = &mut *self.state;
        if let Ok(Teardown::Freed) = state.envs.destroy(id, self.cpu, &mut state.frames) {
            state.cpus[self.cpu.as_index()].current = None;
        }
    }

    /// Releases the lock and hands `id`'s state to the trap layer.
    fn resume(self, id: EnvId) -> Dispatch {
        let dispatch = match self.state.envs.get(id) {
            Some(env) => Dispatch::Run { env: id, frame: env.frame, satp: env.space.satp_value() },
            None => Dispatch::Halt { idle: !self.state.envs.has_work() },
        };
        drop(self);
        dispatch
    }
}

/// What became of the trapping environment on kernel entry.
enum Entry {
    /// Frame saved; the trap is handled for this environment.
    Trap(EnvId),
    /// A stop or an installed frame took effect; the trap itself is dropped.
    Superseded(EnvId),
}

struct SyscallOutcome {
    ret: isize,
    reschedule: bool,
    keep_frame: bool,
}
