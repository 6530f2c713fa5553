// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler for bare-metal kernel images
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: diag::log::try_emit
//! INVARIANTS: No allocation; never waits on the log sink; parks the hart afterwards
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::panic::PanicInfo;

use crate::log::{try_emit, Level};

/// Emits a single diagnostic line and parks the hart.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    match info.location() {
        Some(location) => try_emit(
            Level::Error,
            "panic",
            format_args!("{}:{}: {}", location.file(), location.line(), info.message()),
        ),
        None => try_emit(Level::Error, "panic", format_args!("{}", info.message())),
    }
    loop {
        #[cfg(target_arch = "riscv64")]
        // SAFETY: `wfi` only stalls the hart until the next interrupt.
        unsafe {
            core::arch::asm!("wfi")
        };
        #[cfg(not(target_arch = "riscv64"))]
        core::hint::spin_loop();
    }
}
