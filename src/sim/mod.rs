// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Deterministic simulation of the hypervisor around the scheduler.
//!
//! [`SimHypervisor`] stands in for the framework services the scheduler
//! calls back into; [`Simulator`] drives the scheduler hooks from a
//! [`SimConfig`](crate::config::SimConfig) and records a [`Trace`].

mod engine;
mod trace;

use std::collections::BTreeSet;

pub use engine::SimOutcome;
pub use engine::Simulator;
pub use trace::FrameInstance;
pub use trace::Segment;
pub use trace::Trace;
pub use trace::TraceEvent;
pub use trace::TraceKind;

use crate::clock::Clock;
use crate::clock::SimClock;
use crate::cpumask::Cpumask;
use crate::scheduler::Hypervisor;
use crate::types::CpuId;
use crate::types::TimeNs;
use crate::types::UnitId;
use crate::types::UnitRef;

struct HvState {
    /// SCHEDULE_SOFTIRQ raised and not yet handled.
    softirq: Cpumask,
    tasklet: Cpumask,
    curr: Vec<UnitRef>,
    blocked: BTreeSet<UnitId>,
    migrating: BTreeSet<UnitId>,
}

pub struct SimHypervisor {
    clock: SimClock,
    state: spin::Mutex<HvState>,
}

impl SimHypervisor {
    pub fn new(nr_cpus: usize, start: TimeNs) -> Self {
        Self {
            clock: SimClock::new(start),
            state: spin::Mutex::new(HvState {
                softirq: Cpumask::new(),
                tasklet: Cpumask::new(),
                curr: (0..nr_cpus as u32).map(|c| UnitRef::Idle(CpuId(c))).collect(),
                blocked: BTreeSet::new(),
                migrating: BTreeSet::new(),
            }),
        }
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn block(&self, unit: UnitId) {
        self.state.lock().blocked.insert(unit);
    }

    pub fn unblock(&self, unit: UnitId) {
        self.state.lock().blocked.remove(&unit);
    }

    pub fn is_migrating(&self, unit: UnitId) -> bool {
        self.state.lock().migrating.contains(&unit)
    }

    pub fn finish_migration(&self, unit: UnitId) {
        self.state.lock().migrating.remove(&unit);
    }

    pub fn curr(&self, cpu: CpuId) -> UnitRef {
        self.state
            .lock()
            .curr
            .get(cpu.index())
            .copied()
            .unwrap_or(UnitRef::Idle(cpu))
    }

    pub fn set_curr(&self, cpu: CpuId, unit: UnitRef) {
        if let Some(slot) = self.state.lock().curr.get_mut(cpu.index()) {
            *slot = unit;
        }
    }

    pub fn raise_tasklet(&self, cpu: CpuId) {
        let mut state = self.state.lock();
        state.tasklet.set(cpu);
        state.softirq.set(cpu);
    }

    pub fn take_tasklet(&self, cpu: CpuId) -> bool {
        let mut state = self.state.lock();
        let pending = state.tasklet.test(cpu);
        state.tasklet.clear(cpu);
        pending
    }

    /// Lowest pCPU with a pending schedule softirq, acknowledged.
    pub fn take_softirq(&self) -> Option<CpuId> {
        let mut state = self.state.lock();
        let cpu = state.softirq.first()?;
        state.softirq.clear(cpu);
        Some(cpu)
    }

    pub fn softirq_pending(&self, cpu: CpuId) -> bool {
        self.state.lock().softirq.test(cpu)
    }
}

impl Clock for SimHypervisor {
    fn now(&self) -> TimeNs {
        self.clock.now()
    }
}

impl Hypervisor for SimHypervisor {
    fn raise_schedule_softirq(&self, cpu: CpuId) {
        self.state.lock().softirq.set(cpu);
    }

    fn curr_on_cpu(&self, cpu: CpuId) -> Option<UnitId> {
        self.curr(cpu).guest()
    }

    fn unit_runnable(&self, unit: UnitId) -> bool {
        let state = self.state.lock();
        !state.blocked.contains(&unit) && !state.migrating.contains(&unit)
    }

    fn set_migrating(&self, unit: UnitId) {
        self.state.lock().migrating.insert(unit);
    }
}
