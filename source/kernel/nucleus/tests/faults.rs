// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-fault reflection and trap-frame installation tests
//! OWNERS: @kernel-team
//! STATUS: Functional
//! TEST_COVERAGE: 5 integration tests
//!
//! TEST_SCOPE:
//!   - Fault delivery to the registered upcall on the exception stack
//!   - Nested faults and exception-stack exhaustion
//!   - Environments without a usable upcall are destroyed
//!   - ENV_SET_TRAPFRAME on self resumes the installed frame
//!
//! TEST_SCENARIOS:
//!   - fault_without_upcall_destroys_the_env()
//!   - fault_is_reflected_onto_the_exception_stack(): UTrapFrame contents, pc, sp, a0
//!   - nested_fault_keeps_a_scratch_word(): second frame lands below the first
//!   - unmapped_exception_stack_destroys_the_env()
//!   - set_trapframe_on_self_resumes_installed_frame(): no return value written, SPP cleared
//!
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

mod common;

use common::{boot, spawn, Hart, RW};
use nucleus::trap::{SSTATUS_SIE, SSTATUS_SPIE, SSTATUS_SPP};
use nucleus::TrapFrame;
use nucleus_abi::layout::{PAGE_SIZE, UTEXT, UXSTACKTOP};
use nucleus_abi::{fec, nr, reg, Error, UTrapFrame, TRAPFRAME_WORDS};

const HANDLER: usize = UTEXT + 0x100;

fn with_upcall(hart: &mut Hart<'_>) {
    assert_eq!(hart.syscall(nr::PAGE_ALLOC, &[0, UXSTACKTOP - PAGE_SIZE, RW]), 0);
    assert_eq!(hart.syscall(nr::ENV_SET_PGFAULT_UPCALL, &[0, HANDLER]), 0);
}

fn read_utf(hart: &Hart<'_>, at: usize) -> UTrapFrame {
    let (env, _) = hart.running.expect("running");
    let bytes = hart.load(env, at, UTrapFrame::SIZE).expect("exception stack");
    UTrapFrame::from_bytes(&bytes).expect("frame")
}

#[test]
fn fault_without_upcall_destroys_the_env() {
    let (kernel, _) = boot(2, 1);
    let env = spawn(&kernel);
    let mut hart = Hart::new(&kernel, 0);
    hart.schedule();
    let fault = hart.store(0x5000, b"x").expect_err("unmapped");
    assert_eq!(hart.fault(fault), None);
    assert!(hart.idle);
    assert_eq!(kernel.enter(hart.id).env_status(env), None);
}

#[test]
fn fault_is_reflected_onto_the_exception_stack() {
    let (kernel, _) = boot(2, 1);
    let env = spawn(&kernel);
    let mut hart = Hart::new(&kernel, 0);
    hart.schedule();
    with_upcall(&mut hart);
    let (_, before) = hart.running.expect("running");

    let fault = hart.store(UTEXT, b"x").expect_err("text is read-only");
    assert_eq!(fault.error_code(), fec::PRESENT | fec::WRITE | fec::USER);
    assert_eq!(hart.fault(fault), Some(env));

    let (_, frame) = hart.running.expect("still running");
    let at = frame.x[reg::SP];
    assert_eq!(frame.sepc, HANDLER);
    assert_eq!(frame.x[reg::A0], at);
    assert_eq!(at % 16, 0);
    assert!(at >= UXSTACKTOP - PAGE_SIZE && at + UTrapFrame::SIZE <= UXSTACKTOP);

    let utf = read_utf(&hart, at);
    assert_eq!(utf.fault_va, UTEXT);
    assert_eq!(utf.err, fec::PRESENT | fec::WRITE | fec::USER);
    assert_eq!(utf.pc, before.sepc);
    assert_eq!(utf.sp(), before.x[reg::SP]);
}

#[test]
fn nested_fault_keeps_a_scratch_word() {
    let (kernel, _) = boot(2, 1);
    spawn(&kernel);
    let mut hart = Hart::new(&kernel, 0);
    hart.schedule();
    with_upcall(&mut hart);
    let fault = hart.store(UTEXT, b"x").expect_err("read-only");
    hart.fault(fault);
    let first = hart.running.expect("running").1.x[reg::SP];

    // the handler itself faults
    let fault = hart.store(0x5000, b"y").expect_err("unmapped");
    hart.fault(fault);
    let (_, frame) = hart.running.expect("running");
    let second = frame.x[reg::SP];
    let word = core::mem::size_of::<usize>();
    assert_eq!(second, (first - word - UTrapFrame::SIZE) & !0xf);
    assert_eq!(read_utf(&hart, second).sp(), first);
    assert_eq!(read_utf(&hart, second).fault_va, 0x5000);
    assert_eq!(read_utf(&hart, first).fault_va, UTEXT);
}

#[test]
fn unmapped_exception_stack_destroys_the_env() {
    let (kernel, _) = boot(2, 1);
    let env = spawn(&kernel);
    let mut hart = Hart::new(&kernel, 0);
    hart.schedule();
    assert_eq!(hart.syscall(nr::ENV_SET_PGFAULT_UPCALL, &[0, HANDLER]), 0);
    let fault = hart.store(0x5000, b"x").expect_err("unmapped");
    assert_eq!(hart.fault(fault), None);
    assert_eq!(kernel.enter(hart.id).env_status(env), None);
}

#[test]
fn set_trapframe_on_self_resumes_installed_frame() {
    let (kernel, _) = boot(2, 1);
    let env = spawn(&kernel);
    let mut hart = Hart::new(&kernel, 0);
    hart.schedule();
    assert_eq!(hart.syscall(nr::PAGE_ALLOC, &[0, 0x6000, RW]), 0);

    let mut words = [0usize; TRAPFRAME_WORDS];
    words[reg::A0] = 0x1234;
    words[reg::SP] = 0x7000;
    words[32] = UTEXT + 0x40;
    words[33] = SSTATUS_SPP | SSTATUS_SIE;
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    hart.store(0x6000, &bytes).expect("store image");

    let too_high = hart.syscall(nr::ENV_SET_TRAPFRAME, &[0, UXSTACKTOP - 8]);
    assert_eq!(too_high, Error::InvalidArgument.to_ret());

    assert_eq!(hart.syscall(nr::ENV_SET_TRAPFRAME, &[0, 0x6000]), 0x1234);
    let (running, frame): (_, TrapFrame) = hart.running.expect("resumed");
    assert_eq!(running, env);
    assert_eq!(frame.sepc, UTEXT + 0x40);
    assert_eq!(frame.x[reg::SP], 0x7000);
    assert_eq!(frame.x[reg::A0], 0x1234);
    assert_eq!(frame.sstatus & (SSTATUS_SPP | SSTATUS_SIE), 0);
    assert_ne!(frame.sstatus & SSTATUS_SPIE, 0);
}
