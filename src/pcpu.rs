// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-pCPU materialized schedule and the minor-frame state machine.
//!
//! Every frame boundary is derived from the start of the current major
//! frame, `epoch + k * major_frame`, so a pCPU that misses ticks falls back
//! into the global phase instead of drifting. When the frames do not fill
//! the major frame, the remainder (the gap) runs the idle UNIT.

use log::trace;
use log::warn;

use crate::error::DispatchAnomaly;
use crate::error::SchedError;
use crate::placement::Placement;
use crate::schedule::ScheduleStore;
use crate::schedule::DEFAULT_TIMESLICE;
use crate::schedule::MAX_ENTRIES;
use crate::stats::PcpuMetrics;
use crate::types::CpuId;
use crate::types::TimeNs;
use crate::types::UnitId;
use crate::types::UnitRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub unit: UnitRef,
    pub runtime: TimeNs,
}

/// What a pCPU runs next and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleDecision {
    pub next: UnitRef,
    pub time_slice: TimeNs,
    /// Minor frame in force, `None` in the gap or before the first build.
    pub frame: Option<usize>,
    /// Set when this dispatch recovered from a missed boundary or a frame
    /// owner that was not runnable. A miss wins over not-ready.
    pub anomaly: Option<DispatchAnomaly>,
}

#[derive(Debug, Clone)]
pub struct PcpuSched {
    cpu: CpuId,
    frames: Vec<Frame>,
    index: usize,
    epoch: TimeNs,
    major_frame: TimeNs,
    major_start: TimeNs,
    in_gap: bool,
    next_switch_time: TimeNs,
    curr: UnitRef,
    metrics: PcpuMetrics,
}

impl PcpuSched {
    /// Reserve room for the largest schedule up front so rebuilds never
    /// allocate.
    pub fn try_new(cpu: CpuId) -> Result<Self, SchedError> {
        let mut frames = Vec::new();
        frames.try_reserve_exact(MAX_ENTRIES)?;
        Ok(Self {
            cpu,
            frames,
            index: 0,
            epoch: 0,
            major_frame: 0,
            major_start: 0,
            in_gap: false,
            next_switch_time: 0,
            curr: UnitRef::Idle(cpu),
            metrics: PcpuMetrics::default(),
        })
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn in_gap(&self) -> bool {
        self.in_gap
    }

    pub fn epoch(&self) -> TimeNs {
        self.epoch
    }

    pub fn major_frame(&self) -> TimeNs {
        self.major_frame
    }

    pub fn next_switch_time(&self) -> TimeNs {
        self.next_switch_time
    }

    pub fn is_built(&self) -> bool {
        !self.frames.is_empty()
    }

    /// UNIT last handed out by dispatch.
    pub fn curr(&self) -> UnitRef {
        self.curr
    }

    pub fn metrics(&self) -> &PcpuMetrics {
        &self.metrics
    }

    /// Materialize the authoritative schedule for this pCPU and pin it to
    /// the frame in force at `now`. Both locks held.
    pub fn build(&mut self, store: &ScheduleStore, placement: &Placement, now: TimeNs) {
        let idle = UnitRef::Idle(self.cpu);
        self.frames.clear();
        for entry in store.entries().iter().take(MAX_ENTRIES) {
            let unit = placement
                .find_domain(&entry.handle)
                .and_then(|dom| placement.find_unit_for(dom, self.cpu))
                .map_or(idle, UnitRef::Guest);
            self.frames.push(Frame {
                unit,
                runtime: entry.runtime,
            });
        }
        self.epoch = store.epoch();
        self.major_frame = store.major_frame();
        self.metrics.nr_rebuilds += 1;
        self.sync_to_epoch(now);
        trace!(
            "pCPU {} rebuilt: {} frames, epoch {}, frame {} until {}",
            self.cpu,
            self.frames.len(),
            self.epoch,
            self.index,
            self.next_switch_time
        );
    }

    /// Pin `index` and `next_switch_time` to the frame in force at `now`.
    pub fn sync_to_epoch(&mut self, now: TimeNs) {
        if self.frames.is_empty() || self.major_frame <= 0 {
            return;
        }
        let major_start = now - (now - self.epoch).rem_euclid(self.major_frame);
        self.major_start = major_start;

        let mut start = major_start;
        for (i, frame) in self.frames.iter().enumerate() {
            start += frame.runtime;
            if now < start {
                self.index = i;
                self.in_gap = false;
                self.next_switch_time = start;
                return;
            }
        }

        // Past the last frame but short of the next major frame.
        self.index = self.frames.len() - 1;
        self.in_gap = true;
        self.next_switch_time = major_start + self.major_frame;
    }

    fn total_runtime(&self) -> TimeNs {
        self.frames.iter().map(|f| f.runtime).sum()
    }

    /// Step over one frame boundary if it has passed. More than one passed
    /// boundary resynchronizes to the epoch and reports a miss.
    pub fn advance(&mut self, now: TimeNs) -> Option<DispatchAnomaly> {
        if self.frames.is_empty() || now < self.next_switch_time {
            return None;
        }

        let last = self.frames.len() - 1;
        if !self.in_gap && self.index < last {
            self.index += 1;
            self.next_switch_time += self.frames[self.index].runtime;
        } else if !self.in_gap && self.total_runtime() < self.major_frame {
            self.in_gap = true;
            self.next_switch_time = self.major_start + self.major_frame;
        } else {
            self.major_start += self.major_frame;
            self.index = 0;
            self.in_gap = false;
            self.next_switch_time = self.major_start + self.frames[0].runtime;
        }
        self.metrics.nr_frame_switches += 1;

        if now >= self.next_switch_time {
            warn!(
                "pCPU {} missed frame boundaries ({}ns late), resyncing to epoch",
                self.cpu,
                now - self.next_switch_time
            );
            self.metrics.nr_missed += 1;
            self.sync_to_epoch(now);
            return Some(DispatchAnomaly::Missed);
        }
        None
    }

    /// Advance if due and choose what runs until the next boundary.
    /// pCPU lock held.
    pub fn dispatch<F>(&mut self, now: TimeNs, tasklet_pending: bool, runnable: F) -> ScheduleDecision
    where
        F: Fn(UnitId) -> bool,
    {
        let idle = UnitRef::Idle(self.cpu);
        self.metrics.nr_dispatches += 1;

        if self.frames.is_empty() {
            self.curr = idle;
            return ScheduleDecision {
                next: idle,
                time_slice: DEFAULT_TIMESLICE,
                frame: None,
                anomaly: None,
            };
        }

        let mut anomaly = self.advance(now);

        let mut next = if self.in_gap {
            idle
        } else {
            self.frames[self.index].unit
        };
        if let UnitRef::Guest(unit) = next {
            if !runnable(unit) {
                self.metrics.nr_not_ready += 1;
                anomaly = anomaly.or(Some(DispatchAnomaly::NotReady));
                next = idle;
            }
        }
        if tasklet_pending {
            self.metrics.nr_tasklet_idle += 1;
            next = idle;
        }

        self.curr = next;
        let decision = ScheduleDecision {
            next,
            time_slice: self.next_switch_time - now,
            frame: (!self.in_gap).then_some(self.index),
            anomaly,
        };
        trace!(
            "pCPU {} t={} frame {:?} -> {} for {}ns",
            self.cpu,
            now,
            decision.frame,
            decision.next,
            decision.time_slice
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpumask::Cpumask;
    use crate::handle::DomainHandle;
    use crate::schedule::Schedule;
    use crate::schedule::ScheduleEntry;
    use crate::types::millisecs;

    const H_A: DomainHandle = DomainHandle([0xa; 16]);

    fn store(entries: &[(DomainHandle, TimeNs)], major_frame: TimeNs, epoch: TimeNs) -> ScheduleStore {
        let mut s = ScheduleStore::new(0);
        s.replace(
            Schedule {
                entries: entries
                    .iter()
                    .map(|&(handle, runtime)| ScheduleEntry { handle, runtime })
                    .collect(),
                major_frame,
            },
            epoch,
        );
        s
    }

    fn placement_with_unit_on(cpu: u32) -> (Placement, UnitId) {
        let mut p = Placement::new();
        let dom = p.add_domain(H_A).unwrap();
        let unit = p
            .add_unit(dom, 0, Cpumask::from_cpus([CpuId(cpu)]), CpuId(cpu))
            .unwrap();
        p.link_unit(unit).unwrap();
        p.assign(unit, CpuId(cpu));
        (p, unit)
    }

    #[test]
    fn test_build_maps_handles_to_units_or_idle() {
        let (p, unit) = placement_with_unit_on(0);
        let s = store(&[(H_A, millisecs(4)), (DomainHandle::ZERO, millisecs(6))], millisecs(10), 0);

        let mut pc = PcpuSched::try_new(CpuId(0)).unwrap();
        pc.build(&s, &p, 0);
        assert_eq!(pc.frames()[0].unit, UnitRef::Guest(unit));
        assert_eq!(pc.frames()[1].unit, UnitRef::Idle(CpuId(0)));
        assert_eq!(pc.frames()[1].runtime, millisecs(6));

        let mut other = PcpuSched::try_new(CpuId(1)).unwrap();
        other.build(&s, &p, 0);
        assert_eq!(other.frames()[0].unit, UnitRef::Idle(CpuId(1)));
        assert!(other.frames().iter().all(|f| f.unit != UnitRef::Guest(unit)));
    }

    #[test]
    fn test_sync_to_epoch_picks_frame() {
        let p = Placement::new();
        let s = store(&[(H_A, 3), (H_A, 5), (H_A, 2)], 10, 100);
        let mut pc = PcpuSched::try_new(CpuId(0)).unwrap();

        for (now, index, next) in [(100, 0, 103), (102, 0, 103), (103, 1, 108), (109, 2, 110), (110, 0, 113), (257, 1, 258)] {
            pc.build(&s, &p, now);
            assert_eq!((pc.index(), pc.next_switch_time()), (index, next), "now={now}");
            assert!(!pc.in_gap());
        }
    }

    #[test]
    fn test_sync_before_epoch_uses_euclidean_phase() {
        let p = Placement::new();
        let s = store(&[(H_A, 4), (H_A, 6)], 10, 100);
        let mut pc = PcpuSched::try_new(CpuId(0)).unwrap();
        pc.build(&s, &p, 95);
        assert_eq!((pc.index(), pc.next_switch_time()), (1, 100));
    }

    #[test]
    fn test_tail_slack_runs_idle() {
        let (p, unit) = placement_with_unit_on(0);
        let s = store(&[(H_A, 3)], 10, 0);
        let mut pc = PcpuSched::try_new(CpuId(0)).unwrap();
        pc.build(&s, &p, 0);

        let d = pc.dispatch(0, false, |_| true);
        assert_eq!(d, ScheduleDecision { next: UnitRef::Guest(unit), time_slice: 3, frame: Some(0), anomaly: None });

        let d = pc.dispatch(3, false, |_| true);
        assert_eq!(d, ScheduleDecision { next: UnitRef::Idle(CpuId(0)), time_slice: 7, frame: None, anomaly: None });

        let d = pc.dispatch(10, false, |_| true);
        assert_eq!(d, ScheduleDecision { next: UnitRef::Guest(unit), time_slice: 3, frame: Some(0), anomaly: None });
        assert_eq!(pc.metrics().nr_missed, 0);

        pc.build(&s, &p, 15);
        assert!(pc.in_gap());
        assert_eq!(pc.next_switch_time(), 20);
    }

    #[test]
    fn test_single_advance_wraps_major_frame() {
        let p = Placement::new();
        let s = store(&[(H_A, 4), (H_A, 6)], 10, 0);
        let mut pc = PcpuSched::try_new(CpuId(0)).unwrap();
        pc.build(&s, &p, 0);

        assert_eq!(pc.advance(4), None);
        assert_eq!((pc.index(), pc.next_switch_time()), (1, 10));
        assert_eq!(pc.advance(10), None);
        assert_eq!((pc.index(), pc.next_switch_time()), (0, 14));
        assert_eq!(pc.advance(13), None);
        assert_eq!(pc.index(), 0);
        assert_eq!(pc.metrics().nr_frame_switches, 2);
    }

    #[test]
    fn test_clock_jump_resyncs() {
        let p = Placement::new();
        let s = store(&[(H_A, millisecs(5)), (H_A, millisecs(5))], millisecs(10), 0);
        let mut pc = PcpuSched::try_new(CpuId(0)).unwrap();
        pc.build(&s, &p, millisecs(1));

        let now = millisecs(1) + 1_000_000_000 + millisecs(6);
        assert_eq!(pc.advance(now), Some(DispatchAnomaly::Missed));
        assert_eq!(pc.index(), 1);
        assert_eq!(pc.next_switch_time(), 1_000_000_000 + millisecs(10));
        assert!(pc.next_switch_time() > now);
        assert_eq!(pc.metrics().nr_missed, 1);
    }

    #[test]
    fn test_not_runnable_and_tasklet_run_idle() {
        let (p, unit) = placement_with_unit_on(0);
        let s = store(&[(H_A, 10)], 10, 0);
        let mut pc = PcpuSched::try_new(CpuId(0)).unwrap();
        pc.build(&s, &p, 0);

        let d = pc.dispatch(1, false, |u| u != unit);
        assert_eq!(d.next, UnitRef::Idle(CpuId(0)));
        assert_eq!(d.time_slice, 9);
        assert_eq!(d.frame, Some(0));
        assert_eq!(d.anomaly, Some(DispatchAnomaly::NotReady));

        let d = pc.dispatch(2, true, |_| true);
        assert_eq!(d.next, UnitRef::Idle(CpuId(0)));
        assert_eq!(d.anomaly, None);
        assert_eq!(pc.curr(), UnitRef::Idle(CpuId(0)));

        let d = pc.dispatch(3, false, |_| true);
        assert_eq!(d.next, UnitRef::Guest(unit));
        assert_eq!(pc.metrics().nr_not_ready, 1);
        assert_eq!(pc.metrics().nr_tasklet_idle, 1);
        assert_eq!(pc.metrics().nr_dispatches, 3);
    }

    #[test]
    fn test_miss_reported_over_not_ready() {
        let (p, unit) = placement_with_unit_on(0);
        let s = store(&[(H_A, 4), (H_A, 6)], 10, 0);
        let mut pc = PcpuSched::try_new(CpuId(0)).unwrap();
        pc.build(&s, &p, 0);

        let d = pc.dispatch(25, false, |u| u != unit);
        assert_eq!(d.anomaly, Some(DispatchAnomaly::Missed));
        assert_eq!(d.next, UnitRef::Idle(CpuId(0)));
        assert_eq!((d.frame, d.time_slice), (Some(1), 5));
        assert_eq!(pc.metrics().nr_not_ready, 1);
    }

    #[test]
    fn test_unbuilt_pcpu_runs_idle() {
        let mut pc = PcpuSched::try_new(CpuId(3)).unwrap();
        let d = pc.dispatch(50, false, |_| true);
        assert_eq!(d.next, UnitRef::Idle(CpuId(3)));
        assert_eq!(d.time_slice, DEFAULT_TIMESLICE);
        assert_eq!(d.frame, None);
    }
}
