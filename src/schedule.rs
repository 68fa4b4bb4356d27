// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The authoritative cyclic schedule.

use serde::Deserialize;
use serde::Serialize;

use crate::error::InvalidCause;
use crate::handle::DomainHandle;
use crate::types::millisecs;
use crate::types::TimeNs;

/// Maximum number of minor frames in one major frame.
pub const MAX_ENTRIES: usize = 64;

/// Minor frame length of the boot schedule.
pub const DEFAULT_TIMESLICE: TimeNs = millisecs(10);

/// One minor frame: which domain runs and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(with = "handle_text")]
    pub handle: DomainHandle,
    pub runtime: TimeNs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub entries: Vec<ScheduleEntry>,
    pub major_frame: TimeNs,
}

impl Schedule {
    /// A single frame running domain 0 (or idle) for the whole major frame.
    pub fn boot() -> Self {
        Self {
            entries: vec![ScheduleEntry {
                handle: DomainHandle::ZERO,
                runtime: DEFAULT_TIMESLICE,
            }],
            major_frame: DEFAULT_TIMESLICE,
        }
    }

    /// Check the schedule is installable. Runtimes are summed with overflow
    /// detection; an overflowing sum can never fit a major frame.
    pub fn validate(&self) -> Result<(), InvalidCause> {
        if self.major_frame <= 0 {
            return Err(InvalidCause::NonPositiveMajorFrame {
                major_frame: self.major_frame,
            });
        }
        if self.entries.is_empty() {
            return Err(InvalidCause::NoEntries);
        }
        if self.entries.len() > MAX_ENTRIES {
            return Err(InvalidCause::TooManyEntries {
                count: self.entries.len(),
                max: MAX_ENTRIES,
            });
        }

        let mut total: TimeNs = 0;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.runtime <= 0 {
                return Err(InvalidCause::NonPositiveRuntime {
                    index,
                    runtime: entry.runtime,
                });
            }
            total = total
                .checked_add(entry.runtime)
                .ok_or(InvalidCause::Overcommitted {
                    total: TimeNs::MAX,
                    major_frame: self.major_frame,
                })?;
        }

        if total > self.major_frame {
            return Err(InvalidCause::Overcommitted {
                total,
                major_frame: self.major_frame,
            });
        }
        Ok(())
    }

    pub fn total_runtime(&self) -> TimeNs {
        self.entries.iter().map(|e| e.runtime).sum()
    }
}

/// Schedule plus the instant every pCPU aligns its major frames to.
#[derive(Debug, Clone)]
pub struct ScheduleStore {
    schedule: Schedule,
    epoch: TimeNs,
}

impl ScheduleStore {
    pub fn new(now: TimeNs) -> Self {
        Self {
            schedule: Schedule::boot(),
            epoch: now,
        }
    }

    /// Replace the schedule and restart the epoch at `now`. The caller has
    /// already validated `schedule`.
    pub fn replace(&mut self, schedule: Schedule, now: TimeNs) {
        debug_assert!(schedule.validate().is_ok());
        self.schedule = schedule;
        self.epoch = now;
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.schedule.entries
    }

    pub fn major_frame(&self) -> TimeNs {
        self.schedule.major_frame
    }

    pub fn epoch(&self) -> TimeNs {
        self.epoch
    }
}

mod handle_text {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    use crate::handle::DomainHandle;

    pub fn serialize<S: Serializer>(h: &DomainHandle, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(h)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DomainHandle, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
