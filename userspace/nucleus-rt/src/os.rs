// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: RISC-V `ecall` backend and the page-fault upcall trampoline
//! OWNERS: @runtime
//! PUBLIC API: Ecall, fork(), puts()
//! DEPENDS_ON: fork::{dispatch_fault, resume_image}, nucleus-abi
//! INVARIANTS: The trampoline enters with sp = a0 = the UTrapFrame on the exception stack
//!             and never returns; resumption goes through ENV_SET_TRAPFRAME(SELF)

#![allow(unsafe_code)]

use core::fmt;

use nucleus_abi::layout::PAGE_SIZE;
use nucleus_abi::{EnvId, UTrapFrame};

use crate::fork::{self, Forked};
use crate::sys::{Platform, Sys, SysResult};

core::arch::global_asm!(
    ".section .text.nucleus_rt_pgfault",
    ".globl nucleus_rt_pgfault_trampoline",
    ".align 2",
    "nucleus_rt_pgfault_trampoline:",
    "    call {upcall}",
    "1:  j 1b",
    upcall = sym pgfault_upcall,
);

extern "C" {
    fn nucleus_rt_pgfault_trampoline();
}

/// The calling environment's own trap interface.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ecall;

impl Platform for Ecall {
    #[inline(always)]
    fn ecall(&mut self, number: usize, args: [usize; 5]) -> [usize; 4] {
        let (mut a0, mut a1, mut a2, mut a3) = (args[0], args[1], args[2], args[3]);
        // SAFETY: the kernel only reads the argument registers and writes a0..a3;
        // buffers named by address are validated against the caller's page tables.
        unsafe {
            core::arch::asm!(
                "ecall",
                inout("a0") a0,
                inout("a1") a1,
                inout("a2") a2,
                inout("a3") a3,
                in("a4") args[4],
                in("a7") number,
                clobber_abi("C"),
                options(nostack)
            );
        }
        [a0, a1, a2, a3]
    }

    fn copy_page(&mut self, dst: usize, src: usize) {
        // SAFETY: both pages are mapped in the caller (src faulted as present, dst was just
        // allocated) and distinct, so the ranges do not overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, PAGE_SIZE);
        }
    }

    fn pgfault_entry(&self) -> usize {
        nucleus_rt_pgfault_trampoline as usize
    }

    fn report(&mut self, msg: fmt::Arguments<'_>) {
        let _ = fmt::write(&mut Console(self), msg);
        let _ = fmt::write(&mut Console(self), format_args!("\n"));
    }
}

struct Console<'a>(&'a mut Ecall);

impl fmt::Write for Console<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.cputs(s.as_ptr() as usize, s.len()).map_err(|_| fmt::Error)
    }
}

/// Writes `s` to the console.
pub fn puts(s: &str) -> SysResult<()> {
    Ecall.cputs(s.as_ptr() as usize, s.len())
}

/// Copy-on-write fork of the calling environment.
pub fn fork() -> SysResult<Forked> {
    fork::fork(&mut Ecall)
}

extern "C" fn pgfault_upcall(utf: *const UTrapFrame) -> ! {
    // SAFETY: the kernel pushed a complete frame at this address on the exception stack.
    let utf = unsafe { &*utf };
    let mut p = Ecall;
    if fork::dispatch_fault(&mut p, utf).is_ok() {
        let image = fork::resume_image(utf);
        let _ = p.env_set_trapframe(EnvId::SELF, image.as_ptr() as usize);
    }
    let _ = p.env_destroy(EnvId::SELF);
    loop {
        p.yield_cpu();
    }
}
