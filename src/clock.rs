// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Monotonic time sources.
//!
//! The global epoch every pCPU aligns to is a `TimeNs` read from one of
//! these clocks when a schedule is installed.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use crate::types::TimeNs;

pub trait Clock {
    /// Monotonic timestamp in nanoseconds.
    fn now(&self) -> TimeNs;
}

/// The host's monotonic clock, counted from construction.
#[derive(Debug)]
pub struct MonotonicClock {
    base: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> TimeNs {
        self.base.elapsed().as_nanos() as TimeNs
    }
}

/// A clock that only moves when told to.
///
/// Shared between the simulator engine and the scheduler it drives. Forward
/// jumps are allowed to model a stalled pCPU or a debugger stop.
#[derive(Debug, Default)]
pub struct SimClock {
    now: AtomicI64,
}

impl SimClock {
    pub fn new(start: TimeNs) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Move the clock to `t`. Time never goes backwards.
    pub fn set(&self, t: TimeNs) {
        self.now.fetch_max(t, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: TimeNs) -> TimeNs {
        debug_assert!(delta >= 0);
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for SimClock {
    fn now(&self) -> TimeNs {
        self.now.load(Ordering::SeqCst)
    }
}
