// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host harness that plays the trap layer for integration tests
//! OWNERS: @kernel-team
//! NOTE: Tests only; a `Hart` stands in for one CPU leaving and re-entering the kernel.

#![allow(dead_code)]

use nucleus::mm::AccessFault;
use nucleus::{CpuId, Dispatch, Kernel, KernelConfig, MemoryConsole, ProgramImage, Segment};
use nucleus_abi::layout::{PAGE_SIZE, UTEXT};
use nucleus_abi::{reg, EnvId, Perm};

pub const TEXT: [u8; 4] = [0x73, 0, 0, 0];
pub const RW: usize = Perm::VALID.bits() | Perm::USER.bits() | Perm::WRITE.bits();
pub const RO: usize = Perm::VALID.bits() | Perm::USER.bits();

pub fn boot(slots: usize, cpus: usize) -> (Kernel, MemoryConsole) {
    let console = MemoryConsole::new();
    let config = KernelConfig::default().with_max_envs(slots).with_cpus(cpus).with_frames(256);
    let kernel = Kernel::new(config, Box::new(console.clone())).expect("kernel");
    (kernel, console)
}

/// Loads the one-page test program plus a writable data page.
pub fn spawn(kernel: &Kernel) -> EnvId {
    let segments = [
        Segment { va: UTEXT, data: &TEXT, mem_len: TEXT.len(), writable: false },
        Segment { va: UTEXT + PAGE_SIZE, data: b"seed", mem_len: PAGE_SIZE, writable: true },
    ];
    kernel
        .enter(CpuId::BOOT)
        .create_env(&ProgramImage { entry: UTEXT, segments: &segments })
        .expect("create env")
}

/// One CPU as seen by the trap layer.
pub struct Hart<'k> {
    kernel: &'k Kernel,
    pub id: CpuId,
    /// Environment dispatched on this hart and the frame it resumed with.
    pub running: Option<(EnvId, nucleus::TrapFrame)>,
    pub idle: bool,
}

impl<'k> Hart<'k> {
    pub fn new(kernel: &'k Kernel, id: u16) -> Self {
        Self { kernel, id: CpuId::from_raw(id), running: None, idle: false }
    }

    pub fn current(&self) -> Option<EnvId> {
        self.running.map(|(env, _)| env)
    }

    fn apply(&mut self, dispatch: Dispatch) -> Option<EnvId> {
        match dispatch {
            Dispatch::Run { env, frame, .. } => {
                self.running = Some((env, frame));
                self.idle = false;
            }
            Dispatch::Halt { idle } => {
                self.running = None;
                self.idle = idle;
            }
        }
        self.current()
    }

    /// Scheduler entry without a trapping environment (boot or idle wakeup).
    pub fn schedule(&mut self) -> Option<EnvId> {
        let dispatch = self.kernel.enter(self.id).schedule();
        self.apply(dispatch)
    }

    /// Timer interrupt while running.
    pub fn tick(&mut self) -> Option<EnvId> {
        let (_, frame) = self.running.expect("hart is running an environment");
        let dispatch = self.kernel.enter(self.id).timer(&frame);
        self.apply(dispatch)
    }

    /// `ecall` from the running environment; returns the caller's saved `a0`.
    pub fn syscall(&mut self, number: usize, args: &[usize]) -> isize {
        let (caller, mut frame) = self.running.expect("hart is running an environment");
        frame.x[reg::A7] = number;
        for (i, arg) in args.iter().enumerate() {
            frame.x[reg::A0 + i] = *arg;
        }
        let dispatch = self.kernel.enter(self.id).syscall(&frame);
        self.apply(dispatch);
        self.saved_a0(caller).expect("caller still exists")
    }

    /// Like [`Hart::syscall`] for calls that may destroy the caller.
    pub fn syscall_unchecked(&mut self, number: usize, args: &[usize]) -> Option<isize> {
        let (caller, mut frame) = self.running.expect("hart is running an environment");
        frame.x[reg::A7] = number;
        for (i, arg) in args.iter().enumerate() {
            frame.x[reg::A0 + i] = *arg;
        }
        let dispatch = self.kernel.enter(self.id).syscall(&frame);
        self.apply(dispatch);
        self.saved_a0(caller)
    }

    pub fn saved_a0(&self, env: EnvId) -> Option<isize> {
        self.kernel.enter(self.id).saved_frame(env).map(|frame| frame.x[reg::A0] as isize)
    }

    /// User store from the running environment.
    pub fn store(&mut self, va: usize, bytes: &[u8]) -> Result<(), AccessFault> {
        let (env, _) = self.running.expect("hart is running an environment");
        self.kernel.enter(self.id).write_user(env, va, bytes)
    }

    pub fn load(&self, env: EnvId, va: usize, len: usize) -> Result<Vec<u8>, AccessFault> {
        let mut buf = vec![0; len];
        self.kernel.enter(self.id).read_user(env, va, &mut buf)?;
        Ok(buf)
    }

    /// Delivers a page fault for `fault` to the running environment.
    pub fn fault(&mut self, fault: AccessFault) -> Option<EnvId> {
        let (_, frame) = self.running.expect("hart is running an environment");
        let dispatch = self.kernel.enter(self.id).page_fault(&frame, fault.va, fault.error_code());
        self.apply(dispatch)
    }
}
