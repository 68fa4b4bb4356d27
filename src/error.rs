// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Error taxonomy.
//!
//! Validation and allocation failures surface to the caller as
//! [`SchedError`]. Dispatch-path anomalies never do: they are recovered on
//! the spot, counted, and reported alongside the dispatch decision, see
//! [`DispatchAnomaly`].

use std::collections::TryReserveError;
use std::fmt;

use crate::types::TimeNs;

pub const EINVAL: i32 = 22;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;

/// Why a schedule was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidCause {
    NonPositiveMajorFrame { major_frame: TimeNs },
    NoEntries,
    TooManyEntries { count: usize, max: usize },
    NonPositiveRuntime { index: usize, runtime: TimeNs },
    /// Entries do not fit in the major frame (or the sum overflowed).
    Overcommitted { total: TimeNs, major_frame: TimeNs },
    /// A reserved control-plane field was non-zero.
    ReservedFieldSet { index: Option<usize> },
    /// A pCPU id beyond what this scheduler was sized for.
    CpuOutOfRange { cpu: u32 },
    /// The record the hook names does not exist.
    NoSuchRecord,
    /// The pCPU is already a member of the pool.
    AlreadyInPool { cpu: u32 },
    UnknownCommand { cmd: u32 },
}

impl fmt::Display for InvalidCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidCause::NonPositiveMajorFrame { major_frame } => {
                write!(f, "major frame {major_frame}ns is not positive")
            }
            InvalidCause::NoEntries => write!(f, "schedule has no entries"),
            InvalidCause::TooManyEntries { count, max } => {
                write!(f, "schedule has {count} entries, max {max}")
            }
            InvalidCause::NonPositiveRuntime { index, runtime } => {
                write!(f, "entry {index} runtime {runtime}ns is not positive")
            }
            InvalidCause::Overcommitted { total, major_frame } => write!(
                f,
                "total runtime {total}ns exceeds major frame {major_frame}ns"
            ),
            InvalidCause::ReservedFieldSet { index: Some(index) } => {
                write!(f, "entry {index} has a reserved field set")
            }
            InvalidCause::ReservedFieldSet { index: None } => {
                write!(f, "header has a reserved field set")
            }
            InvalidCause::CpuOutOfRange { cpu } => write!(f, "pCPU {cpu} out of range"),
            InvalidCause::NoSuchRecord => write!(f, "no such scheduler record"),
            InvalidCause::AlreadyInPool { cpu } => write!(f, "pCPU {cpu} is already in the pool"),
            InvalidCause::UnknownCommand { cmd } => write!(f, "unknown scheduler op {cmd}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    Invalid(InvalidCause),
    /// A pCPU, domain or UNIT record or a schedule buffer could not be
    /// allocated.
    OutOfMemory,
    /// The control-plane buffer is too short for the payload.
    Fault,
}

impl SchedError {
    /// Negative errno, as returned across the hypervisor's control plane.
    pub fn errno(&self) -> i32 {
        match self {
            SchedError::Invalid(_) => -EINVAL,
            SchedError::OutOfMemory => -ENOMEM,
            SchedError::Fault => -EFAULT,
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Invalid(cause) => write!(f, "invalid: {cause}"),
            SchedError::OutOfMemory => write!(f, "out of memory"),
            SchedError::Fault => write!(f, "bad control-plane buffer"),
        }
    }
}

impl std::error::Error for SchedError {}

impl From<InvalidCause> for SchedError {
    fn from(cause: InvalidCause) -> Self {
        SchedError::Invalid(cause)
    }
}

impl From<TryReserveError> for SchedError {
    fn from(_: TryReserveError) -> Self {
        SchedError::OutOfMemory
    }
}

/// Runtime anomalies the dispatcher recovers from locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAnomaly {
    /// The frame's UNIT was not runnable; idle ran instead.
    NotReady,
    /// More than one frame boundary passed; resynchronized to the epoch.
    Missed,
}
