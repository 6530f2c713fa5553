// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Copy-on-write fork built from the kernel's primitive syscalls
//! OWNERS: @runtime
//! PUBLIC API: fork(), set_pgfault_handler(), handle_cow_fault(), dispatch_fault(),
//!             resume_image(), Forked, FaultError
//! DEPENDS_ON: sys::{Platform, Sys}, nucleus-abi (layout, Perm, UTrapFrame, fec)
//! INVARIANTS:
//!   - A page writable before fork is COW in both parent and child afterwards
//!   - The child's pages are mapped before the parent's own page is downgraded
//!   - The exception-stack page is never shared with the child
//!   - The child becomes Runnable only after its upcall and exception stack exist
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt;

use nucleus_abi::layout::{page_base, PAGE_SIZE, PFTEMP, USTACKTOP, UXSTACKTOP};
use nucleus_abi::{fec, EnvId, EnvStatus, Error, Perm, UTrapFrame, PERM_SYSCALL, TRAPFRAME_WORDS};

use crate::sys::{Platform, Sys, SysResult};

/// Span covered by one last-level page table.
const REGION: usize = 512 * PAGE_SIZE;

const USER_PAGE: Perm = Perm::VALID.union(Perm::USER);
const COW_PAGE: Perm = USER_PAGE.union(Perm::COW);
const WRITABLE_PAGE: Perm = USER_PAGE.union(Perm::WRITE);

/// Which side of a successful fork the caller is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Forked {
    /// The caller is the parent; the child is runnable.
    Parent(EnvId),
    /// The caller is the new child.
    Child,
}

/// Page fault the copy-on-write handler refuses to resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// The faulting access was not a store.
    NotWrite { va: usize, pc: usize },
    /// The faulting page is not marked copy-on-write.
    NotCow { va: usize, pc: usize },
    /// A syscall failed while copying the page.
    Sys(Error),
}

impl From<Error> for FaultError {
    fn from(err: Error) -> Self {
        Self::Sys(err)
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotWrite { va, pc } => write!(f, "read fault at {:08x} (pc {:08x})", va, pc),
            Self::NotCow { va, pc } => {
                write!(f, "write to non-cow page {:08x} (pc {:08x})", va, pc)
            }
            Self::Sys(err) => write!(f, "cow copy failed: {}", err),
        }
    }
}

/// Installs the platform's fault entry for the caller and maps its
/// exception stack if it is not already present.
pub fn set_pgfault_handler<P: Platform + ?Sized>(p: &mut P) -> SysResult<()> {
    let xstack = UXSTACKTOP - PAGE_SIZE;
    if !p.page_perm(xstack)?.contains(Perm::VALID) {
        p.page_alloc(EnvId::SELF, xstack, WRITABLE_PAGE)?;
    }
    let entry = p.pgfault_entry();
    p.env_set_pgfault_upcall(EnvId::SELF, entry)
}

/// Duplicates the caller into a new environment sharing its pages copy-on-write.
///
/// On failure after the child exists, the child is destroyed before the
/// error is returned.
pub fn fork<P: Platform + ?Sized>(p: &mut P) -> SysResult<Forked> {
    set_pgfault_handler(p)?;
    let child = p.exofork()?;
    if child.is_self() {
        return Ok(Forked::Child);
    }
    match populate(p, child) {
        Ok(()) => Ok(Forked::Parent(child)),
        Err(err) => {
            let _ = p.env_destroy(child);
            Err(err)
        }
    }
}

fn populate<P: Platform + ?Sized>(p: &mut P, child: EnvId) -> SysResult<()> {
    let mut va = 0;
    while va < USTACKTOP {
        if va % REGION == 0 && !p.region_mapped(va)? {
            va += REGION;
            continue;
        }
        let perm = p.page_perm(va)?;
        if perm.contains(USER_PAGE) {
            duppage(p, child, va, perm)?;
        }
        va += PAGE_SIZE;
    }
    p.page_alloc(child, UXSTACKTOP - PAGE_SIZE, WRITABLE_PAGE)?;
    let entry = p.pgfault_entry();
    p.env_set_pgfault_upcall(child, entry)?;
    p.env_set_status(child, EnvStatus::Runnable)
}

/// Maps the caller's page at `va` into `child`.
fn duppage<P: Platform + ?Sized>(p: &mut P, child: EnvId, va: usize, perm: Perm) -> SysResult<()> {
    if perm.contains(Perm::SHARE) {
        return p.page_map(EnvId::SELF, va, child, va, perm & PERM_SYSCALL);
    }
    if perm.intersects(Perm::WRITE | Perm::COW) {
        p.page_map(EnvId::SELF, va, child, va, COW_PAGE)?;
        return p.page_map(EnvId::SELF, va, EnvId::SELF, va, COW_PAGE);
    }
    p.page_map(EnvId::SELF, va, child, va, USER_PAGE)
}

/// Gives the caller a private writable copy of the COW page `utf` faulted on.
pub fn handle_cow_fault<P: Platform + ?Sized>(p: &mut P, utf: &UTrapFrame) -> Result<(), FaultError> {
    let va = utf.fault_va;
    if utf.err & fec::WRITE == 0 {
        return Err(FaultError::NotWrite { va, pc: utf.pc });
    }
    let base = page_base(va);
    if !p.page_perm(base)?.contains(Perm::COW) {
        return Err(FaultError::NotCow { va, pc: utf.pc });
    }
    p.page_alloc(EnvId::SELF, PFTEMP, WRITABLE_PAGE)?;
    p.copy_page(PFTEMP, base);
    p.page_map(EnvId::SELF, PFTEMP, EnvId::SELF, base, WRITABLE_PAGE)?;
    p.page_unmap(EnvId::SELF, PFTEMP)?;
    Ok(())
}

/// Upcall body: resolves a COW fault or destroys the caller.
///
/// Returns only when the fault was resolved, or when the platform outlives
/// its own destruction (host tests).
pub fn dispatch_fault<P: Platform + ?Sized>(p: &mut P, utf: &UTrapFrame) -> Result<(), FaultError> {
    let Err(err) = handle_cow_fault(p, utf) else {
        return Ok(());
    };
    let id = p.getenvid();
    p.report(format_args!("[{}] fatal page fault: {}", id, err));
    let _ = p.env_destroy(EnvId::SELF);
    Err(err)
}

/// Trap-frame image that resumes the code interrupted by `utf`.
///
/// Installing it with `ENV_SET_TRAPFRAME(SELF, ..)` returns to `utf.pc` with
/// every trap-time register restored.
pub fn resume_image(utf: &UTrapFrame) -> [usize; TRAPFRAME_WORDS] {
    let mut words = [0usize; TRAPFRAME_WORDS];
    words[..32].copy_from_slice(&utf.regs);
    words[32] = utf.pc;
    words[33] = utf.status;
    words
}
