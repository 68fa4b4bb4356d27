// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Recorded simulation events and accounting over them.

use std::io::Write;

use anyhow::Result;

use crate::types::CpuId;
use crate::types::TimeNs;
use crate::types::UnitId;
use crate::types::UnitRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub time_ns: TimeNs,
    pub kind: TraceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
    /// do_schedule ran on `cpu` and chose `next` until `until`.
    Dispatch {
        cpu: CpuId,
        next: UnitRef,
        frame: Option<usize>,
        until: TimeNs,
    },
    Sleep { unit: UnitId },
    Wake { unit: UnitId },
    Migrate { unit: UnitId, to: CpuId },
    Affinity { unit: UnitId },
    /// Schedule set through the control plane; 0 or a negative errno.
    Install { errno: i32 },
    ClockJump { delta: TimeNs },
    Tasklet { cpu: CpuId },
    PoolAdd { cpu: CpuId },
    Destroy { nr_units: usize },
}

/// A stretch of time one pCPU spent on one UNIT within one frame instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: TimeNs,
    pub end: TimeNs,
    pub unit: UnitRef,
    pub frame: Option<usize>,
}

/// One execution of a minor frame (or of the gap, `frame == None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInstance {
    pub start: TimeNs,
    pub until: TimeNs,
    pub frame: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
    end_ns: TimeNs,
}

impl Trace {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, time_ns: TimeNs, kind: TraceKind) {
        self.events.push(TraceEvent { time_ns, kind });
        self.end_ns = self.end_ns.max(time_ns);
    }

    pub(crate) fn close(&mut self, end_ns: TimeNs) {
        self.end_ns = self.end_ns.max(end_ns);
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Simulated time the trace covers up to.
    pub fn end_ns(&self) -> TimeNs {
        self.end_ns
    }

    fn dispatches(&self, cpu: CpuId) -> impl Iterator<Item = (TimeNs, UnitRef, Option<usize>, TimeNs)> + '_ {
        self.events.iter().filter_map(move |e| match e.kind {
            TraceKind::Dispatch {
                cpu: c,
                next,
                frame,
                until,
            } if c == cpu => Some((e.time_ns, next, frame, until)),
            _ => None,
        })
    }

    /// What `cpu` ran, merged across redundant dispatches.
    pub fn segments(&self, cpu: CpuId) -> Vec<Segment> {
        let mut out: Vec<(Segment, TimeNs)> = Vec::new();
        for (t, unit, frame, until) in self.dispatches(cpu) {
            if let Some((last, last_until)) = out.last_mut() {
                last.end = t;
                if last.unit == unit && last.frame == frame && *last_until == until {
                    continue;
                }
            }
            out.push((
                Segment {
                    start: t,
                    end: t,
                    unit,
                    frame,
                },
                until,
            ));
        }
        if let Some((last, _)) = out.last_mut() {
            last.end = self.end_ns;
        }
        out.into_iter()
            .map(|(s, _)| s)
            .filter(|s| s.end > s.start)
            .collect()
    }

    /// Frame instances `cpu` entered, in order.
    pub fn frame_instances(&self, cpu: CpuId) -> Vec<FrameInstance> {
        let mut out: Vec<FrameInstance> = Vec::new();
        for (t, _, frame, until) in self.dispatches(cpu) {
            if let Some(last) = out.last() {
                if last.frame == frame && last.until == until {
                    continue;
                }
            }
            out.push(FrameInstance {
                start: t,
                until,
                frame,
            });
        }
        out
    }

    /// Time `unit` spent on `cpu` within `[start, end)`.
    pub fn cpu_runtime(&self, cpu: CpuId, unit: UnitRef, start: TimeNs, end: TimeNs) -> TimeNs {
        self.segments(cpu)
            .iter()
            .filter(|s| s.unit == unit)
            .map(|s| (s.end.min(end) - s.start.max(start)).max(0))
            .sum()
    }

    /// Time a guest UNIT ran on any of `nr_cpus` pCPUs within `[start, end)`.
    pub fn runtime(&self, unit: UnitId, nr_cpus: u32, start: TimeNs, end: TimeNs) -> TimeNs {
        (0..nr_cpus)
            .map(|c| self.cpu_runtime(CpuId(c), UnitRef::Guest(unit), start, end))
            .sum()
    }

    pub fn count(&self, pred: impl Fn(&TraceKind) -> bool) -> usize {
        self.events.iter().filter(|e| pred(&e.kind)).count()
    }

    pub fn dump<W: Write>(&self, w: &mut W) -> Result<()> {
        for event in &self.events {
            let desc = match &event.kind {
                TraceKind::Dispatch {
                    cpu,
                    next,
                    frame,
                    until,
                } => {
                    let frame = match frame {
                        Some(i) => i.to_string(),
                        None => "-".to_string(),
                    };
                    format!("cpu={:<3} RUN      {:<8} frame={:<3} until={}", cpu, next, frame, until)
                }
                TraceKind::Sleep { unit } => format!("SLEEP    {unit}"),
                TraceKind::Wake { unit } => format!("WAKE     {unit}"),
                TraceKind::Migrate { unit, to } => format!("MIGRATE  {unit} -> {to}"),
                TraceKind::Affinity { unit } => format!("AFFINITY {unit}"),
                TraceKind::Install { errno } => format!("INSTALL  rc={errno}"),
                TraceKind::ClockJump { delta } => format!("JUMP     +{delta}ns"),
                TraceKind::Tasklet { cpu } => format!("cpu={cpu:<3} TASKLET"),
                TraceKind::PoolAdd { cpu } => format!("cpu={cpu:<3} JOIN"),
                TraceKind::Destroy { nr_units } => format!("DESTROY  {nr_units} units"),
            };
            writeln!(w, "[{:>12} ns] {}", event.time_ns, desc)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch(cpu: u32, next: UnitRef, frame: Option<usize>, until: TimeNs) -> TraceKind {
        TraceKind::Dispatch {
            cpu: CpuId(cpu),
            next,
            frame,
            until,
        }
    }

    #[test]
    fn test_segments_merge_and_clip() {
        let u = UnitRef::Guest(UnitId(1));
        let idle = UnitRef::Idle(CpuId(0));
        let mut t = Trace::new();
        t.record(0, dispatch(0, u, Some(0), 4));
        t.record(2, dispatch(0, u, Some(0), 4));
        t.record(4, dispatch(0, idle, Some(1), 10));
        t.record(10, dispatch(0, u, Some(0), 14));
        t.close(12);

        let segs = t.segments(CpuId(0));
        assert_eq!(segs.len(), 3);
        assert_eq!((segs[0].start, segs[0].end), (0, 4));
        assert_eq!((segs[2].start, segs[2].end), (10, 12));
        assert_eq!(t.cpu_runtime(CpuId(0), u, 0, 12), 6);
        assert_eq!(t.cpu_runtime(CpuId(0), u, 3, 11), 2);
        assert_eq!(t.runtime(UnitId(1), 2, 0, 10), 4);
        assert_eq!(t.frame_instances(CpuId(0)).len(), 3);
    }

    #[test]
    fn test_same_frame_next_major_is_new_instance() {
        let u = UnitRef::Guest(UnitId(1));
        let mut t = Trace::new();
        t.record(0, dispatch(0, u, Some(0), 10));
        t.record(10, dispatch(0, u, Some(0), 20));
        t.close(20);
        assert_eq!(t.frame_instances(CpuId(0)).len(), 2);
        assert_eq!(t.segments(CpuId(0)).len(), 2);
        assert_eq!(t.cpu_runtime(CpuId(0), u, 0, 20), 20);

        let mut out = Vec::new();
        t.dump(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("RUN"));
    }
}
