// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

/// Dispatcher counters of one pCPU. Kept inside the pCPU's materialized
/// schedule and only touched under its pCPU lock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcpuMetrics {
    /// do_schedule calls.
    pub nr_dispatches: u64,
    /// Minor frame boundaries crossed by single-step advance.
    pub nr_frame_switches: u64,
    /// More than one boundary had passed; resynchronized to the epoch.
    pub nr_missed: u64,
    /// The frame's UNIT was not runnable and idle ran instead.
    pub nr_not_ready: u64,
    /// Pending tasklet work forced idle.
    pub nr_tasklet_idle: u64,
    /// Materializations of the authoritative schedule.
    pub nr_rebuilds: u64,
}

impl PcpuMetrics {
    fn delta(&self, rhs: &Self) -> Self {
        Self {
            nr_dispatches: self.nr_dispatches - rhs.nr_dispatches,
            nr_frame_switches: self.nr_frame_switches - rhs.nr_frame_switches,
            nr_missed: self.nr_missed - rhs.nr_missed,
            nr_not_ready: self.nr_not_ready - rhs.nr_not_ready,
            nr_tasklet_idle: self.nr_tasklet_idle - rhs.nr_tasklet_idle,
            nr_rebuilds: self.nr_rebuilds - rhs.nr_rebuilds,
        }
    }

    fn accumulate(&mut self, rhs: &Self) {
        self.nr_dispatches += rhs.nr_dispatches;
        self.nr_frame_switches += rhs.nr_frame_switches;
        self.nr_missed += rhs.nr_missed;
        self.nr_not_ready += rhs.nr_not_ready;
        self.nr_tasklet_idle += rhs.nr_tasklet_idle;
        self.nr_rebuilds += rhs.nr_rebuilds;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Schedules installed through set.
    pub nr_installs: u64,
    /// Schedules rejected by set.
    pub nr_rejects: u64,
    pub nr_domains: u64,
    pub nr_units: u64,
    pub nr_active_units: u64,
    /// Per-pCPU counters, keyed by pCPU id.
    pub pcpus: BTreeMap<u32, PcpuMetrics>,
}

impl Metrics {
    /// Counters summed over every pCPU.
    pub fn total(&self) -> PcpuMetrics {
        let mut sum = PcpuMetrics::default();
        for m in self.pcpus.values() {
            sum.accumulate(m);
        }
        sum
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let t = self.total();
        writeln!(
            w,
            "[{}] installs: {:<4} rejects: {:<4} doms: {:<3} units: {}/{}",
            crate::SCHEDULER_NAME,
            self.nr_installs,
            self.nr_rejects,
            self.nr_domains,
            self.nr_active_units,
            self.nr_units,
        )?;
        writeln!(
            w,
            "    dispatch: {:<8} switch: {:<8} missed: {:<4} not_ready: {:<6} tasklet: {:<6} rebuild: {}",
            t.nr_dispatches,
            t.nr_frame_switches,
            t.nr_missed,
            t.nr_not_ready,
            t.nr_tasklet_idle,
            t.nr_rebuilds,
        )?;
        for (cpu, m) in self.pcpus.iter() {
            writeln!(
                w,
                "    pCPU{:<3} dispatch: {:<8} switch: {:<8} missed: {:<4} not_ready: {}",
                cpu, m.nr_dispatches, m.nr_frame_switches, m.nr_missed, m.nr_not_ready,
            )?;
        }
        Ok(())
    }

    /// Counter growth since `rhs`. Gauges are taken from `self`.
    pub fn delta(&self, rhs: &Self) -> Self {
        let pcpus = self
            .pcpus
            .iter()
            .map(|(cpu, cur)| {
                let d = match rhs.pcpus.get(cpu) {
                    Some(prev) => cur.delta(prev),
                    None => cur.clone(),
                };
                (*cpu, d)
            })
            .collect();
        Self {
            nr_installs: self.nr_installs - rhs.nr_installs,
            nr_rejects: self.nr_rejects - rhs.nr_rejects,
            pcpus,
            ..self.clone()
        }
    }
}
