// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Opaque 16-octet domain handles.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use anyhow::Context;

pub const HANDLE_LEN: usize = 16;

/// The stable per-domain identifier the schedule refers to.
///
/// Equality is byte-wise. The all-zero handle names domain 0 if such a
/// domain is registered, otherwise the schedule slot runs the idle UNIT.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DomainHandle(pub [u8; HANDLE_LEN]);

impl DomainHandle {
    pub const ZERO: DomainHandle = DomainHandle([0; HANDLE_LEN]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; HANDLE_LEN] {
        &self.0
    }
}

impl From<[u8; HANDLE_LEN]> for DomainHandle {
    fn from(bytes: [u8; HANDLE_LEN]) -> Self {
        DomainHandle(bytes)
    }
}

/// Accepts UUID text ("8-4-4-4-12" hex groups) or 32 bare hex digits.
impl FromStr for DomainHandle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let digits: String = s.trim().chars().filter(|c| *c != '-').collect();
        if digits.len() != HANDLE_LEN * 2 {
            bail!(
                "Domain handle {:?} must have {} hex digits",
                s,
                HANDLE_LEN * 2
            );
        }
        let mut bytes = [0u8; HANDLE_LEN];
        hex::decode_to_slice(&digits, &mut bytes)
            .with_context(|| format!("Failed to parse domain handle {s:?}"))?;
        Ok(DomainHandle(bytes))
    }
}

impl fmt::Display for DomainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = hex::encode(self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        )
    }
}

impl fmt::Debug for DomainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainHandle({self})")
    }
}
