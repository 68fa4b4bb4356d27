// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Event-driven simulation engine.
//!
//! Keeps the event queue and per-pCPU one-shot timers, and drives the
//! scheduler the way the hypervisor would: hooks on configured events,
//! do_schedule on timer expiry or schedule softirq.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;

use super::trace::Trace;
use super::trace::TraceKind;
use super::SimHypervisor;
use crate::abi;
use crate::abi::SchedOpCmd;
use crate::clock::Clock;
use crate::config::Action;
use crate::config::SimConfig;
use crate::cpumask::Cpumask;
use crate::schedule::Schedule;
use crate::scheduler::Arinc653Scheduler;
use crate::scheduler::Hypervisor;
use crate::stats::Metrics;
use crate::types::microsecs;
use crate::types::CpuId;
use crate::types::DomainId;
use crate::types::TimeNs;
use crate::types::UnitId;
use crate::types::UnitRef;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Event {
    time_ns: TimeNs,
    /// Tiebreaker for events at the same time (lower first).
    seq: u64,
    kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time_ns
            .cmp(&other.time_ns)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventKind {
    /// The pCPU's one-shot timer. Stale unless `gen` is the latest armed.
    Timer { cpu: CpuId, gen: u64 },
    /// Configured event, by index.
    Action(usize),
}

pub struct SimOutcome {
    pub trace: Trace,
    pub metrics: Metrics,
}

pub struct Simulator {
    config: SimConfig,
    sched: Arinc653Scheduler<SimHypervisor>,
    doms: Vec<Option<DomainId>>,
    units: Vec<Vec<UnitId>>,
    queue: BinaryHeap<Reverse<Event>>,
    seq: u64,
    timer_gen: Vec<u64>,
    trace: Trace,
}

impl Simulator {
    /// Boot the pool, admit every configured vCPU and install the
    /// configured schedule.
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let hv = SimHypervisor::new(config.nr_cpus, 0);
        let sched = Arinc653Scheduler::init(hv, config.nr_cpus)?;

        let pool = config.pool_mask()?;
        for cpu in pool.iter() {
            sched.alloc_pdata(cpu)?;
            sched
                .init_pdata(cpu)
                .with_context(|| format!("pCPU {cpu} failed to join"))?;
        }

        let mut doms = Vec::new();
        let mut units = Vec::new();
        for (i, spec) in config.domains.iter().enumerate() {
            let dom = sched.alloc_domdata(config.domain_handle(i)?)?;
            let mut dom_units = Vec::new();
            for (v, vcpu) in spec.vcpus.iter().enumerate() {
                let affinity = config.vcpu_affinity(vcpu)?;
                let unit = sched.alloc_udata(dom, v as u32, affinity, CpuId(vcpu.cpu))?;
                if vcpu.blocked {
                    sched.hv().block(unit);
                }
                sched
                    .insert_unit(unit)
                    .with_context(|| format!("failed to insert {}.{}", spec.name, v))?;
                dom_units.push(unit);
            }
            debug!("domain {} admitted with {:?}", spec.name, dom_units);
            doms.push(Some(dom));
            units.push(dom_units);
        }

        let mut sim = Self {
            sched,
            doms,
            units,
            queue: BinaryHeap::new(),
            seq: 0,
            timer_gen: vec![0; config.nr_cpus],
            trace: Trace::new(),
            config,
        };

        if let Some(spec) = sim.config.schedule.clone() {
            let schedule = sim.config.to_schedule(&spec)?;
            let errno = sim.install(&schedule);
            if errno != 0 {
                bail!("initial schedule rejected ({})", errno);
            }
        }

        for i in 0..sim.config.events.len() {
            let at = microsecs(sim.config.events[i].at_us);
            sim.push(at, EventKind::Action(i));
        }
        for cpu in pool.iter() {
            sim.sched.hv().raise_schedule_softirq(cpu);
        }
        Ok(sim)
    }

    pub fn scheduler(&self) -> &Arinc653Scheduler<SimHypervisor> {
        &self.sched
    }

    pub fn hv(&self) -> &SimHypervisor {
        self.sched.hv()
    }

    pub fn now(&self) -> TimeNs {
        self.hv().now()
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// UNIT of a configured vCPU.
    pub fn unit(&self, domain: &str, vcpu: usize) -> Result<UnitId> {
        let d = self.config.domain_index(domain)?;
        self.units[d]
            .get(vcpu)
            .copied()
            .ok_or_else(|| anyhow!("domain {domain:?} has no live vcpu {vcpu}"))
    }

    fn push(&mut self, time_ns: TimeNs, kind: EventKind) {
        self.seq += 1;
        self.queue.push(Reverse(Event {
            time_ns,
            seq: self.seq,
            kind,
        }));
    }

    /// Hand a schedule to the control plane. Returns 0 or a negative errno.
    fn install(&mut self, schedule: &Schedule) -> i32 {
        let mut buf = vec![0u8; abi::payload_len(schedule.entries.len())];
        let rc = abi::encode_schedule(schedule, &mut buf)
            .and_then(|_| self.sched.adjust_global(SchedOpCmd::PUTINFO, &mut buf));
        let errno = match rc {
            Ok(_) => {
                info!(
                    "installed {} frames, major frame {}ns",
                    schedule.entries.len(),
                    schedule.major_frame
                );
                0
            }
            Err(e) => {
                warn!("schedule install failed: {}", e);
                e.errno()
            }
        };
        let now = self.now();
        self.trace.record(now, TraceKind::Install { errno });
        errno
    }

    /// Run do_schedule on `cpu` and arm its timer for the returned slice.
    fn reschedule(&mut self, cpu: CpuId) -> Result<()> {
        let hv = self.sched.hv();
        let now = hv.now();
        let prev = hv.curr(cpu);
        let tasklet = hv.take_tasklet(cpu);
        let decision = self.sched.do_schedule(cpu, prev, now, tasklet);

        if decision.time_slice <= 0 {
            bail!(
                "pCPU {} got slice {} at {}",
                cpu,
                decision.time_slice,
                now
            );
        }
        let consistent = self
            .sched
            .with_pcpu(cpu, |pc| {
                pc.curr() == decision.next
                    && pc.index() < pc.frames().len()
                    && now < pc.next_switch_time()
            })
            .unwrap_or(true);
        if !consistent {
            bail!("pCPU {} out of phase after dispatch at {}", cpu, now);
        }

        if let Some(anomaly) = decision.anomaly {
            debug!("pCPU {} recovered from {:?} at {}", cpu, anomaly, now);
        }

        hv.set_curr(cpu, decision.next);
        if let UnitRef::Guest(unit) = prev {
            if decision.next != prev && hv.is_migrating(unit) {
                hv.finish_migration(unit);
                self.sched.wake(unit);
            }
        }

        let until = now + decision.time_slice;
        self.trace.record(
            now,
            TraceKind::Dispatch {
                cpu,
                next: decision.next,
                frame: decision.frame,
                until,
            },
        );

        self.timer_gen[cpu.index()] += 1;
        let gen = self.timer_gen[cpu.index()];
        self.push(until, EventKind::Timer { cpu, gen });
        Ok(())
    }

    /// Handle every pending schedule softirq on pool pCPUs.
    fn drain_softirqs(&mut self) -> Result<()> {
        let limit = 16 * self.config.nr_cpus + 16;
        let pool = self.sched.pool();
        let mut handled = 0;
        while let Some(cpu) = self.sched.hv().take_softirq() {
            if !pool.test(cpu) {
                continue;
            }
            handled += 1;
            if handled > limit {
                bail!("softirq storm at {}", self.now());
            }
            self.reschedule(cpu)?;
        }
        Ok(())
    }

    fn live_unit(&self, domain: &str, vcpu: usize) -> Result<UnitId> {
        let d = self.config.domain_index(domain)?;
        if self.doms[d].is_none() {
            bail!("domain {domain:?} was destroyed");
        }
        self.unit(domain, vcpu)
    }

    fn apply(&mut self, index: usize) -> Result<()> {
        let action = self.config.events[index].action.clone();
        let now = self.now();
        debug!("t={} {:?}", now, action);
        match action {
            Action::Sleep { domain, vcpu } => {
                let unit = self.live_unit(&domain, vcpu)?;
                self.hv().block(unit);
                self.trace.record(now, TraceKind::Sleep { unit });
                self.sched.sleep(unit);
            }
            Action::Wake { domain, vcpu } => {
                let unit = self.live_unit(&domain, vcpu)?;
                self.hv().unblock(unit);
                self.trace.record(now, TraceKind::Wake { unit });
                self.sched.wake(unit);
            }
            Action::Migrate { domain, vcpu, cpu } => {
                let unit = self.live_unit(&domain, vcpu)?;
                let to = CpuId(cpu);
                self.trace.record(now, TraceKind::Migrate { unit, to });
                self.sched.migrate(unit, to)?;
            }
            Action::Affinity { domain, vcpu, cpus } => {
                let unit = self.live_unit(&domain, vcpu)?;
                let mask = Cpumask::parse(&cpus, self.config.nr_cpus)?;
                self.trace.record(now, TraceKind::Affinity { unit });
                self.sched.adjust_affinity(unit, mask)?;
            }
            Action::Reload { schedule } => {
                let schedule = self.config.to_schedule(&schedule)?;
                self.install(&schedule);
            }
            Action::ClockJump { delta_us } => {
                let delta = microsecs(delta_us);
                self.hv().clock().advance(delta);
                self.trace.record(now, TraceKind::ClockJump { delta });
            }
            Action::Tasklet { cpu } => {
                let cpu = CpuId(cpu);
                self.hv().raise_tasklet(cpu);
                self.trace.record(now, TraceKind::Tasklet { cpu });
            }
            Action::PoolAdd { cpu } => {
                let cpu = CpuId(cpu);
                self.sched.alloc_pdata(cpu)?;
                self.sched
                    .init_pdata(cpu)
                    .with_context(|| format!("pCPU {cpu} failed to join"))?;
                self.hv().raise_schedule_softirq(cpu);
                self.trace.record(now, TraceKind::PoolAdd { cpu });
            }
            Action::Destroy { domain } => {
                let d = self.config.domain_index(&domain)?;
                let Some(dom) = self.doms[d].take() else {
                    bail!("domain {domain:?} destroyed twice");
                };
                let units = std::mem::take(&mut self.units[d]);
                for &unit in &units {
                    self.hv().unblock(unit);
                    self.sched.remove_unit(unit);
                    self.sched.free_udata(unit);
                }
                self.sched.free_domdata(dom);
                self.trace.record(
                    now,
                    TraceKind::Destroy {
                        nr_units: units.len(),
                    },
                );
            }
        }
        self.sched
            .with_placement(|p, pool| p.verify(pool))
            .with_context(|| format!("placement inconsistent after event #{index}"))
    }

    /// Process every event due before `end`.
    pub fn run_until(&mut self, end: TimeNs, shutdown: Option<&AtomicBool>) -> Result<()> {
        self.drain_softirqs()?;
        while let Some(Reverse(ev)) = self.queue.peek() {
            if ev.time_ns >= end {
                break;
            }
            if shutdown.is_some_and(|s| s.load(Ordering::Relaxed)) {
                info!("stopping early at {}", self.now());
                break;
            }
            let Some(Reverse(ev)) = self.queue.pop() else {
                break;
            };
            self.hv().clock().set(ev.time_ns);
            match ev.kind {
                EventKind::Timer { cpu, gen } => {
                    if gen == self.timer_gen[cpu.index()] && self.sched.pool().test(cpu) {
                        self.reschedule(cpu)?;
                    }
                }
                EventKind::Action(i) => self.apply(i)?,
            }
            self.drain_softirqs()?;
        }
        self.hv().clock().set(end);
        let now = self.now();
        self.trace.close(now);
        Ok(())
    }

    /// Run for the configured duration.
    pub fn run(mut self, shutdown: Option<&AtomicBool>) -> Result<SimOutcome> {
        let end = self.config.duration();
        self.run_until(end, shutdown)?;
        Ok(self.finish())
    }

    pub fn finish(self) -> SimOutcome {
        SimOutcome {
            metrics: self.sched.stats(),
            trace: self.trace,
        }
    }
}
