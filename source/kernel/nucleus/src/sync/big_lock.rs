// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Big kernel lock with lockdep-style re-entry detection
//! OWNERS: @kernel-sync-team
//! PUBLIC API: BigKernelLock::new(), BigKernelLock::lock(cpu), BigLockGuard
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: Held by at most one CPU; a CPU never re-acquires it (checked in debug builds);
//!             released when the guard drops
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::types::CpuId;

const NO_HOLDER: usize = 0;

/// Serialises all kernel-state mutation across CPUs.
pub struct BigKernelLock<T> {
    inner: spin::Mutex<T>,
    // CPU index + 1 of the holder, NO_HOLDER when free.
    holder: AtomicUsize,
}

impl<T> BigKernelLock<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: spin::Mutex::new(value), holder: AtomicUsize::new(NO_HOLDER) }
    }

    /// Spins until the lock is free, then records `cpu` as the holder.
    pub fn lock(&self, cpu: CpuId) -> BigLockGuard<'_, T> {
        let tag = cpu.as_index() + 1;
        if cfg!(debug_assertions) && self.holder.load(Ordering::Acquire) == tag {
            crate::log_error!(target: "sync", "LOCKDEP: cpu {} re-entered the big kernel lock", cpu);
            panic!("lockdep: recursive big kernel lock");
        }
        let guard = self.inner.lock();
        self.holder.store(tag, Ordering::Release);
        BigLockGuard { parent: self, guard }
    }

    /// CPU currently holding the lock.
    pub fn holder(&self) -> Option<CpuId> {
        match self.holder.load(Ordering::Acquire) {
            NO_HOLDER => None,
            tag => Some(CpuId::from_raw((tag - 1) as u16)),
        }
    }
}

pub struct BigLockGuard<'a, T> {
    parent: &'a BigKernelLock<T>,
    guard: spin::MutexGuard<'a, T>,
}

impl<'a, T> Deref for BigLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> DerefMut for BigLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<'a, T> Drop for BigLockGuard<'a, T> {
    fn drop(&mut self) {
        // cleared before the inner guard unlocks
        self.parent.holder.store(NO_HOLDER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn holder_tracks_guard_lifetime() {
        let lock = BigKernelLock::new(0u32);
        assert_eq!(lock.holder(), None);
        {
            let mut guard = lock.lock(CpuId::from_raw(2));
            *guard += 1;
            assert_eq!(lock.holder(), Some(CpuId::from_raw(2)));
        }
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn cpus_serialise_updates() {
        let lock = Arc::new(BigKernelLock::new(0u64));
        let workers: Vec<_> = (0..4u16)
            .map(|cpu| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock(CpuId::from_raw(cpu)) += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker");
        }
        assert_eq!(*lock.lock(CpuId::BOOT), 4000);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "recursive big kernel lock")]
    fn reentry_is_detected() {
        let lock = BigKernelLock::new(());
        let _outer = lock.lock(CpuId::BOOT);
        let _inner = lock.lock(CpuId::BOOT);
    }
}
