// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtype wrappers and type aliases for scheduler concepts.
//!
//! Identifiers for pCPUs, domains and UNITs are newtypes so that a domain
//! index can never be passed where a UNIT index is expected. Time is a plain
//! signed alias, matching the hypervisor's `s_time_t`.

use std::fmt;

/// Time in nanoseconds. Signed so that differences are well defined.
pub type TimeNs = i64;

/// Upper bound on pCPU ids this crate handles.
pub const MAX_CPUS: usize = 256;

pub const fn microsecs(us: i64) -> TimeNs {
    us * 1_000
}

pub const fn millisecs(ms: i64) -> TimeNs {
    ms * 1_000_000
}

pub const fn secs(s: i64) -> TimeNs {
    s * 1_000_000_000
}

/// Physical CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CpuId(pub u32);

impl CpuId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a domain record in the scheduler's domain arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u32);

/// Index of a UNIT record in the scheduler's UNIT arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u32);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// What a pCPU frame slot or a dispatch decision points at.
///
/// Every pCPU has its own idle UNIT, so the idle variant carries the pCPU
/// it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitRef {
    Guest(UnitId),
    Idle(CpuId),
}

impl UnitRef {
    pub fn is_idle(self) -> bool {
        matches!(self, UnitRef::Idle(_))
    }

    pub fn guest(self) -> Option<UnitId> {
        match self {
            UnitRef::Guest(unit) => Some(unit),
            UnitRef::Idle(_) => None,
        }
    }
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitRef::Guest(unit) => write!(f, "{unit}"),
            UnitRef::Idle(cpu) => write!(f, "idle{cpu}"),
        }
    }
}
