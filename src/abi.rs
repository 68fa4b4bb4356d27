// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Control-plane schedule payload.
//!
//! Little-endian, fixed layout:
//!
//! ```text
//! offset  size  field
//! 0       4     num_entries      u32
//! 4       4     reserved         u32, zero
//! 8       8     major_frame_ns   i64
//! 16      32*n  entries
//!               +0  16  handle      [u8; 16]
//!               +16  4  vcpu_id     u32, reserved, zero
//!               +20  4  pad         u32, reserved, zero
//!               +24  8  runtime_ns  i64
//! ```

use std::mem::size_of;

use static_assertions::const_assert_eq;

use crate::error::InvalidCause;
use crate::error::SchedError;
use crate::handle::DomainHandle;
use crate::handle::HANDLE_LEN;
use crate::schedule::Schedule;
use crate::schedule::ScheduleEntry;
use crate::schedule::MAX_ENTRIES;

pub const HEADER_LEN: usize = 16;
pub const ENTRY_LEN: usize = 32;

/// Size of a payload holding `MAX_ENTRIES` entries.
pub const PAYLOAD_LEN: usize = HEADER_LEN + MAX_ENTRIES * ENTRY_LEN;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RawHeader {
    num_entries: u32,
    reserved: u32,
    major_frame: i64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RawEntry {
    handle: [u8; HANDLE_LEN],
    vcpu_id: u32,
    pad: u32,
    runtime: i64,
}

const_assert_eq!(size_of::<RawHeader>(), HEADER_LEN);
const_assert_eq!(size_of::<RawEntry>(), ENTRY_LEN);
const_assert_eq!(PAYLOAD_LEN, 2064);

fn u32_at(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn i64_at(buf: &[u8], off: usize) -> i64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(b)
}

impl RawHeader {
    fn read(buf: &[u8]) -> Self {
        Self {
            num_entries: u32_at(buf, 0),
            reserved: u32_at(buf, 4),
            major_frame: i64_at(buf, 8),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.num_entries.to_le_bytes());
        buf[4..8].copy_from_slice(&self.reserved.to_le_bytes());
        buf[8..16].copy_from_slice(&self.major_frame.to_le_bytes());
    }
}

impl RawEntry {
    fn read(buf: &[u8]) -> Self {
        let mut handle = [0u8; HANDLE_LEN];
        handle.copy_from_slice(&buf[0..HANDLE_LEN]);
        Self {
            handle,
            vcpu_id: u32_at(buf, 16),
            pad: u32_at(buf, 20),
            runtime: i64_at(buf, 24),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..HANDLE_LEN].copy_from_slice(&self.handle);
        buf[16..20].copy_from_slice(&self.vcpu_id.to_le_bytes());
        buf[20..24].copy_from_slice(&self.pad.to_le_bytes());
        buf[24..32].copy_from_slice(&self.runtime.to_le_bytes());
    }
}

/// Bytes needed to carry `n` entries.
pub fn payload_len(n: usize) -> usize {
    HEADER_LEN + n * ENTRY_LEN
}

/// Decode a set payload. Only the layout is checked here; the schedule
/// itself is validated when it is installed.
pub fn decode_schedule(buf: &[u8]) -> Result<Schedule, SchedError> {
    if buf.len() < HEADER_LEN {
        return Err(SchedError::Fault);
    }
    let header = RawHeader::read(buf);
    let count = header.num_entries as usize;
    if count > MAX_ENTRIES {
        return Err(InvalidCause::TooManyEntries {
            count,
            max: MAX_ENTRIES,
        }
        .into());
    }
    if header.reserved != 0 {
        return Err(InvalidCause::ReservedFieldSet { index: None }.into());
    }
    if buf.len() < payload_len(count) {
        return Err(SchedError::Fault);
    }

    let mut entries = Vec::new();
    entries.try_reserve_exact(count)?;
    for index in 0..count {
        let off = payload_len(index);
        let raw = RawEntry::read(&buf[off..off + ENTRY_LEN]);
        if raw.vcpu_id != 0 || raw.pad != 0 {
            return Err(InvalidCause::ReservedFieldSet { index: Some(index) }.into());
        }
        entries.push(ScheduleEntry {
            handle: DomainHandle(raw.handle),
            runtime: raw.runtime,
        });
    }

    Ok(Schedule {
        entries,
        major_frame: header.major_frame,
    })
}

/// Encode a get reply into `buf`, zeroing every reserved field. Returns the
/// number of bytes written.
pub fn encode_schedule(schedule: &Schedule, buf: &mut [u8]) -> Result<usize, SchedError> {
    let len = payload_len(schedule.entries.len());
    if buf.len() < len {
        return Err(SchedError::Fault);
    }

    RawHeader {
        num_entries: schedule.entries.len() as u32,
        reserved: 0,
        major_frame: schedule.major_frame,
    }
    .write(&mut buf[..HEADER_LEN]);

    for (index, entry) in schedule.entries.iter().enumerate() {
        let off = payload_len(index);
        RawEntry {
            handle: entry.handle.0,
            vcpu_id: 0,
            pad: 0,
            runtime: entry.runtime,
        }
        .write(&mut buf[off..off + ENTRY_LEN]);
    }
    Ok(len)
}

/// Commands carried by the control plane's scheduler op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedOpCmd {
    PutInfo,
    GetInfo,
}

impl SchedOpCmd {
    pub const PUTINFO: u32 = 0;
    pub const GETINFO: u32 = 1;

    pub fn from_raw(raw: u32) -> Result<Self, SchedError> {
        match raw {
            Self::PUTINFO => Ok(SchedOpCmd::PutInfo),
            Self::GETINFO => Ok(SchedOpCmd::GetInfo),
            cmd => Err(InvalidCause::UnknownCommand { cmd }.into()),
        }
    }
}
