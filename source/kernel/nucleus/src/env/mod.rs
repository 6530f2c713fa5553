// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Environment table (process records) with generation-stamped identifiers
//! OWNERS: @kernel-team
//! PUBLIC API: EnvTable (allocate/get/get_mut/resolve/destroy/free/share_page/iter), Env, IpcState,
//!             EnvError, ShareError, Teardown
//! DEPENDS_ON: mm::AddressSpace, trap::{TrapFrame, FaultUpcall}, nucleus_abi::{EnvId, EnvStatus}
//! INVARIANTS: A slot holds at most one live Env; a stale id never resolves after its slot is
//!             reused; a slot is on the free list iff it holds no Env; every live Env owns
//!             exactly one address space
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md
//!
//! ## Identity
//!
//! `EnvId = generation << LOG2NENV | slot`. Freeing a slot keeps its last id so
//! the next occupant gets a later generation; old handles then fail to resolve
//! with `BadEnvironment` instead of aliasing the new occupant.

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use nucleus_abi::layout::USTACKTOP;
use nucleus_abi::{EnvId, EnvStatus, Perm};

use crate::mm::{AddressSpace, FramePool, MapError, PageFlags, PageTable};
use crate::trap::{FaultUpcall, TrapFrame};
use crate::types::{Asid, CpuId};


/// Rendezvous state embedded in a receiver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpcState {
    /// Blocked in `recv` and willing to accept one send.
    pub receiving: bool,
    /// Where a transferred page should land (`>= UTOP` means no page wanted).
    pub dst_va: usize,
    /// Sender of the last completed rendezvous.
    pub from: EnvId,
    /// Value of the last completed rendezvous.
    pub value: usize,
    /// Permission of the transferred page, 0 when none moved.
    pub perm: usize,
}

/// One user environment.
#[derive(Debug)]
pub struct Env {
    id: EnvId,
    parent: EnvId,
    pub status: EnvStatus,
    pub frame: TrapFrame,
    pub space: AddressSpace,
    pub upcall: Option<FaultUpcall>,
    pub ipc: IpcState,
    /// CPU that last dispatched this environment.
    pub cpu: Option<CpuId>,
    /// `NotRunnable` requested while running; applied at the next kernel entry.
    pub stop_requested: bool,
    /// Frame installed by another environment while this one was running;
    /// replaces the saved frame at the next kernel entry.
    pub pending_frame: Option<TrapFrame>,
    pub runs: u64,
}

impl Env {
    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn parent(&self) -> EnvId {
        self.parent
    }

    /// Dispatched on some CPU right now.
    pub fn is_running(&self) -> bool {
        self.status == EnvStatus::Running
    }
}

/// Errors raised by table operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvError {
    /// Stale or unknown id, or caller lacks authority over the target.
    BadEnvironment,
    /// No slot left in the table.
    NoFreeSlot,
    /// Address-space root could not be allocated.
    NoMemory,
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why [`EnvTable::share_page`] refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShareError {
    Env(EnvError),
    /// Nothing mapped at the source address.
    NotMapped,
    /// Write requested on a read-only source.
    ReadOnlySource,
    /// Destination insert failed.
    Map(MapError),
}

/// Outcome of [`EnvTable::destroy`].
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Teardown {
    /// Resources released immediately.
    Freed,
    /// Running on another CPU; marked dying and reclaimed on that CPU's next kernel entry.
    Deferred,
}

struct Slot {
    last_id: EnvId,
    env: Option<Env>,
}

/// Fixed-capacity arena of environments.
pub struct EnvTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl EnvTable {
    /// Creates a table with `capacity` free slots; lower slots are allocated first.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot { last_id: EnvId::from_raw(0), env: None });
        Self { slots, free: (0..capacity).rev().collect() }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Takes a free slot and gives it a fresh address space and a new generation.
    ///
    /// The new environment is `NotRunnable` with no upcall and an idle IPC state.
    pub fn allocate(
        &mut self,
        parent: EnvId,
        frames: &mut FramePool,
        template: &PageTable,
    ) -> Result<EnvId, EnvError> {
        let slot = self.free.pop().ok_or(EnvError::NoFreeSlot)?;
        let space = match AddressSpace::new(frames, template, Asid::for_slot(slot)) {
            Ok(space) => space,
            Err(_) => {
                self.free.push(slot);
                return Err(EnvError::NoMemory);
            }
        };
        let entry = &mut self.slots[slot];
        let id = EnvId::next(entry.last_id, slot);
        entry.last_id = id;
        entry.env = Some(Env {
            id,
            parent,
            status: EnvStatus::NotRunnable,
            frame: TrapFrame::user(0, USTACKTOP),
            space,
            upcall: None,
            ipc: IpcState::default(),
            cpu: None,
            stop_requested: false,
            pending_frame: None,
            runs: 0,
        });
        crate::log_info!(target: "env", "[{}] new env {}", parent, id);
        Ok(id)
    }

    /// Live environment with exactly this id.
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.slots.get(id.slot())?.env.as_ref().filter(|env| env.id == id)
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.slots.get_mut(id.slot())?.env.as_mut().filter(|env| env.id == id)
    }

    /// Live environment in `slot`, whatever its generation.
    pub fn at_slot(&self, slot: usize) -> Option<&Env> {
        self.slots.get(slot)?.env.as_ref()
    }

    /// Turns a user-supplied id into a live one.
    ///
    /// `EnvId::SELF` names `caller`. With `check_permission` the target must be
    /// the caller or one of its immediate children.
    pub fn resolve(
        &self,
        id: EnvId,
        caller: EnvId,
        check_permission: bool,
    ) -> Result<EnvId, EnvError> {
        let id = if id.is_self() { caller } else { id };
        let env = self.get(id).ok_or(EnvError::BadEnvironment)?;
        if check_permission && env.id != caller && env.parent != caller {
            return Err(EnvError::BadEnvironment);
        }
        Ok(env.id)
    }

    /// Destroys `id` as seen from `this_cpu`.
    pub fn destroy(
        &mut self,
        id: EnvId,
        this_cpu: CpuId,
        frames: &mut FramePool,
    ) -> Result<Teardown, EnvError> {
        let env = self.get_mut(id).ok_or(EnvError::BadEnvironment)?;
        match env.status {
            EnvStatus::Dying => Ok(Teardown::Deferred),
            EnvStatus::Running if env.cpu != Some(this_cpu) => {
                env.status = EnvStatus::Dying;
                crate::log_info!(target: "env", "env {} dying on cpu {:?}", id, env.cpu);
                Ok(Teardown::Deferred)
            }
            _ => {
                self.free(id, frames)?;
                Ok(Teardown::Freed)
            }
        }
    }

    /// Releases the address space and returns the slot to the free list.
    pub fn free(&mut self, id: EnvId, frames: &mut FramePool) -> Result<(), EnvError> {
        let slot = self.slots.get_mut(id.slot()).ok_or(EnvError::BadEnvironment)?;
        match slot.env.take() {
            Some(env) if env.id == id => {
                env.space.destroy(frames);
                self.free.push(id.slot());
                crate::log_info!(target: "env", "free env {}", id);
                Ok(())
            }
            other => {
                slot.env = other;
                Err(EnvError::BadEnvironment)
            }
        }
    }

    /// Maps the frame behind `src_va` in `src` at `dst_va` in `dst`.
    ///
    /// Addresses and `perm` must already be validated. Write access is refused
    /// when the source mapping is read-only; nothing changes on failure.
    pub fn share_page(
        &mut self,
        frames: &mut FramePool,
        src: EnvId,
        src_va: usize,
        dst: EnvId,
        dst_va: usize,
        perm: Perm,
    ) -> Result<(), ShareError> {
        let source = self.get(src).ok_or(ShareError::Env(EnvError::BadEnvironment))?;
        let mapping = source.space.lookup(frames, src_va).ok_or(ShareError::NotMapped)?;
        if perm.contains(Perm::WRITE) && !mapping.flags.contains(PageFlags::WRITE) {
            return Err(ShareError::ReadOnlySource);
        }
        let target = self.get_mut(dst).ok_or(ShareError::Env(EnvError::BadEnvironment))?;
        target
            .space
            .map(frames, dst_va, mapping.frame, PageFlags::from_user(perm))
            .map_err(ShareError::Map)
    }

    /// Live environments in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().filter_map(|slot| slot.env.as_ref())
    }

    /// True while any environment still needs a CPU (runnable, running or dying).
    pub fn has_work(&self) -> bool {
        self.iter().any(|env| {
            matches!(env.status, EnvStatus::Runnable | EnvStatus::Running | EnvStatus::Dying)
        })
    }
}

/// Monitor-style listing, one line per live environment.
impl fmt::Display for EnvTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (slot, entry) in self.slots.iter().enumerate() {
            let Some(env) = entry.env.as_ref() else {
                continue;
            };
            write!(f, "env {}, status: {}, cpu: ", slot, env.status.label())?;
            match env.cpu {
                Some(cpu) => write!(f, "{}", cpu)?,
                None => f.write_str("-")?,
            }
            writeln!(f, ", env_id: {}", env.id)?;
        }
        Ok(())
    }
}
