// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time environment creation from a pre-parsed program image
//! OWNERS: @kernel-team
//! PUBLIC API: ProgramImage, Segment, LoadError, load(envs, frames, template, image)
//! DEPENDS_ON: env::EnvTable, mm::{AddressSpace, FramePool}
//! INVARIANTS: Segments are mapped at their own virtual addresses (no relocation); bytes past
//!             the file image are zero; a failed load releases the environment and its frames
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use nucleus_abi::layout::{page_base, PAGE_SIZE, USTACKTOP};
use nucleus_abi::{EnvId, EnvStatus, Perm};

use crate::env::{EnvError, EnvTable};
use crate::mm::{AddressSpace, FramePool, MapError, PageFlags, PageTable};
use crate::trap::TrapFrame;

/// One loadable segment of a program image.
#[derive(Clone, Copy, Debug)]
pub struct Segment<'a> {
    /// Virtual address of the first byte.
    pub va: usize,
    /// File-backed bytes, copied to `va`.
    pub data: &'a [u8],
    /// In-memory size; the tail beyond `data` is zero-filled.
    pub mem_len: usize,
    pub writable: bool,
}

/// Program image handed over by the boot collaborator (ELF parsing happens there).
#[derive(Clone, Copy, Debug)]
pub struct ProgramImage<'a> {
    pub entry: usize,
    pub segments: &'a [Segment<'a>],
}

/// Errors surfaced while loading a program image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    /// Segment bounds overflowed, overlapped the stack or left user space.
    SegmentOutOfRange,
    /// File bytes longer than the in-memory size.
    Truncated,
    /// Environment allocation failed.
    Env(EnvError),
    /// Frame or page-table allocation failed.
    Map(MapError),
}

impl From<EnvError> for LoadError {
    fn from(value: EnvError) -> Self {
        Self::Env(value)
    }
}

impl From<MapError> for LoadError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

/// Creates a runnable root environment (parent 0) running `image`.
pub fn load(
    envs: &mut EnvTable,
    frames: &mut FramePool,
    template: &PageTable,
    image: &ProgramImage<'_>,
) -> Result<EnvId, LoadError> {
    for segment in image.segments {
        check_segment(segment)?;
    }
    let id = envs.allocate(EnvId::SELF, frames, template)?;
    let env = envs.get_mut(id).ok_or(EnvError::BadEnvironment)?;
    let populated = image
        .segments
        .iter()
        .try_for_each(|segment| map_segment(&mut env.space, frames, segment))
        .and_then(|()| {
            let stack = USTACKTOP - PAGE_SIZE;
            map_zeroed(&mut env.space, frames, stack, user_flags(true))
        });
    if let Err(err) = populated {
        envs.free(id, frames)?;
        return Err(err.into());
    }
    env.frame = TrapFrame::user(image.entry, USTACKTOP);
    env.status = EnvStatus::Runnable;
    log_info!(target: "loader", "env {} loaded, entry 0x{:x}", id, image.entry);
    Ok(id)
}

fn check_segment(segment: &Segment<'_>) -> Result<(), LoadError> {
    if segment.data.len() > segment.mem_len {
        return Err(LoadError::Truncated);
    }
    match segment.va.checked_add(segment.mem_len) {
        Some(end) if end <= USTACKTOP - PAGE_SIZE => Ok(()),
        _ => Err(LoadError::SegmentOutOfRange),
    }
}

fn user_flags(writable: bool) -> PageFlags {
    let perm = if writable { Perm::VALID | Perm::USER | Perm::WRITE } else { Perm::VALID | Perm::USER };
    PageFlags::from_user(perm)
}

fn map_zeroed(
    space: &mut AddressSpace,
    frames: &mut FramePool,
    va: usize,
    flags: PageFlags,
) -> Result<(), MapError> {
    let frame = frames.allocate().ok_or(MapError::NoMemory)?;
    space.map(frames, va, frame, flags).map_err(|err| {
        frames.free(frame);
        err
    })
}

fn map_segment(
    space: &mut AddressSpace,
    frames: &mut FramePool,
    segment: &Segment<'_>,
) -> Result<(), MapError> {
    let end = segment.va + segment.mem_len;
    let mut page = page_base(segment.va);
    while page < end {
        match space.lookup(frames, page) {
            // shared with an earlier segment; widen to writable if either needs it
            Some(mapping) if segment.writable && !mapping.flags.contains(PageFlags::WRITE) => {
                space.map(frames, page, mapping.frame, user_flags(true))?;
            }
            Some(_) => {}
            None => map_zeroed(space, frames, page, user_flags(segment.writable))?,
        }
        page += PAGE_SIZE;
    }

    let mut done = 0;
    while done < segment.data.len() {
        let at = segment.va + done;
        let offset = at % PAGE_SIZE;
        let chunk = (PAGE_SIZE - offset).min(segment.data.len() - done);
        let mapping = space.lookup(frames, at - offset).ok_or(MapError::NoMemory)?;
        frames.bytes_mut(mapping.frame)[offset..offset + chunk]
            .copy_from_slice(&segment.data[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nucleus_abi::reg;

    fn setup() -> (EnvTable, FramePool, PageTable) {
        let mut frames = FramePool::new(32);
        let template = PageTable::kernel_template(&mut frames).expect("template");
        (EnvTable::new(2), frames, template)
    }

    #[test]
    fn maps_segments_and_stack() {
        let (mut envs, mut frames, template) = setup();
        let text = [0x13u8, 0, 0, 0];
        let segments = [
            Segment { va: 0x80_0000, data: &text, mem_len: 4, writable: false },
            Segment { va: 0x80_1ff0, data: b"data", mem_len: 0x20, writable: true },
        ];
        let id = load(
            &mut envs,
            &mut frames,
            &template,
            &ProgramImage { entry: 0x80_0000, segments: &segments },
        )
        .expect("load");
        let env = envs.get(id).expect("env");
        assert_eq!(env.status, EnvStatus::Runnable);
        assert_eq!(env.frame.sepc, 0x80_0000);
        assert_eq!(env.frame.x[reg::SP], USTACKTOP);

        let text_page = env.space.lookup(&frames, 0x80_0000).expect("text");
        assert!(!text_page.flags.contains(PageFlags::WRITE));
        assert_eq!(&frames.bytes(text_page.frame)[..4], &text);

        let mut buf = [0xffu8; 0x20];
        env.space.read_user(&frames, 0x80_1ff0, &mut buf).expect("data");
        assert_eq!(&buf[..4], b"data");
        assert!(buf[4..].iter().all(|b| *b == 0));
        assert!(env.space.lookup(&frames, USTACKTOP - PAGE_SIZE).is_some());
    }

    #[test]
    fn bad_segments_are_rejected_before_allocation() {
        let (mut envs, mut frames, template) = setup();
        let free = frames.free_count();
        let over = [Segment { va: USTACKTOP - PAGE_SIZE, data: &[], mem_len: 1, writable: true }];
        let image = ProgramImage { entry: 0, segments: &over };
        assert_eq!(load(&mut envs, &mut frames, &template, &image), Err(LoadError::SegmentOutOfRange));
        let short = [Segment { va: 0x1000, data: b"abc", mem_len: 2, writable: false }];
        let image = ProgramImage { entry: 0, segments: &short };
        assert_eq!(load(&mut envs, &mut frames, &template, &image), Err(LoadError::Truncated));
        assert_eq!(frames.free_count(), free);
        assert_eq!(envs.free_slots(), 2);
    }

    #[test]
    fn failed_load_releases_everything() {
        let (mut envs, mut frames, template) = setup();
        let free = frames.free_count();
        let big = [Segment { va: 0x1000, data: &[], mem_len: 64 * PAGE_SIZE, writable: true }];
        let image = ProgramImage { entry: 0x1000, segments: &big };
        assert_eq!(
            load(&mut envs, &mut frames, &template, &image),
            Err(LoadError::Map(MapError::NoMemory))
        );
        assert_eq!(frames.free_count(), free);
        assert_eq!(envs.free_slots(), 2);
    }
}
