// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The scheduler instance and the hooks the hypervisor framework calls.
//!
//! Lock order: a pCPU lock, then the private lock. Hooks that change which
//! UNITs are active decide under the private lock alone, drop it, then take
//! the affected pCPU lock followed by the private lock again to rebuild.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use log::debug;
use log::info;
use log::trace;
use log::warn;

use crate::abi;
use crate::abi::SchedOpCmd;
use crate::clock::Clock;
use crate::cpumask::Cpumask;
use crate::error::InvalidCause;
use crate::error::SchedError;
use crate::handle::DomainHandle;
use crate::lock::IrqSpinGuard;
use crate::lock::IrqSpinLock;
use crate::lock::LockClass;
use crate::pcpu::PcpuSched;
use crate::pcpu::ScheduleDecision;
use crate::placement::Placement;
use crate::schedule::Schedule;
use crate::schedule::ScheduleStore;
use crate::stats::Metrics;
use crate::types::CpuId;
use crate::types::DomainId;
use crate::types::TimeNs;
use crate::types::UnitId;
use crate::types::UnitRef;
use crate::types::MAX_CPUS;

/// Services the surrounding hypervisor provides to the scheduler.
pub trait Hypervisor: Clock {
    /// Ask `cpu` to run its dispatcher soon.
    fn raise_schedule_softirq(&self, cpu: CpuId);

    /// Guest UNIT currently executing on `cpu`, if any.
    fn curr_on_cpu(&self, cpu: CpuId) -> Option<UnitId>;

    /// Neither paused nor blocked.
    fn unit_runnable(&self, unit: UnitId) -> bool;

    /// Flag a running UNIT so the framework completes its move once it has
    /// been switched out.
    fn set_migrating(&self, unit: UnitId);
}

/// State behind the private lock.
struct Private {
    store: ScheduleStore,
    placement: Placement,
    /// pCPUs this instance schedules.
    pool: Cpumask,
    /// Pool members in join order.
    pcpu_list: Vec<CpuId>,
}

type PcpuSlot = IrqSpinLock<Option<PcpuSched>>;

/// Where a UNIT's master goes.
enum Relocation {
    To(CpuId),
    /// Wherever placement puts it under this new hard affinity.
    Affinity(Cpumask),
}

impl Relocation {
    fn target(&self, prv: &Private, unit: UnitId) -> CpuId {
        match self {
            Relocation::To(cpu) => *cpu,
            Relocation::Affinity(mask) => {
                prv.placement.pick_resource_within(unit, mask, &prv.pool)
            }
        }
    }
}

pub struct Arinc653Scheduler<H: Hypervisor> {
    hv: H,
    pcpus: Box<[PcpuSlot]>,
    private: IrqSpinLock<Private>,
    nr_installs: AtomicU64,
    nr_rejects: AtomicU64,
}

impl<H: Hypervisor> Arinc653Scheduler<H> {
    /// Allocate an instance sized for `nr_cpu_ids` pCPUs. It starts with the
    /// boot schedule, one 10ms frame for the zero handle, aligned to now.
    pub fn init(hv: H, nr_cpu_ids: usize) -> Result<Self, SchedError> {
        if nr_cpu_ids == 0 || nr_cpu_ids > MAX_CPUS {
            return Err(InvalidCause::CpuOutOfRange {
                cpu: nr_cpu_ids as u32,
            }
            .into());
        }

        let mut slots = Vec::new();
        slots.try_reserve_exact(nr_cpu_ids)?;
        for _ in 0..nr_cpu_ids {
            slots.push(IrqSpinLock::new(LockClass::Pcpu, None));
        }
        let mut pcpu_list = Vec::new();
        pcpu_list.try_reserve_exact(nr_cpu_ids)?;

        let now = hv.now();
        info!(
            "{} initialized for {} pCPUs, epoch {}",
            crate::SCHEDULER_NAME,
            nr_cpu_ids,
            now
        );
        Ok(Self {
            hv,
            pcpus: slots.into_boxed_slice(),
            private: IrqSpinLock::new(
                LockClass::Private,
                Private {
                    store: ScheduleStore::new(now),
                    placement: Placement::new(),
                    pool: Cpumask::new(),
                    pcpu_list,
                },
            ),
            nr_installs: AtomicU64::new(0),
            nr_rejects: AtomicU64::new(0),
        })
    }

    /// Tear the instance down. Every pCPU and domain must be gone already.
    pub fn deinit(self) -> H {
        {
            let prv = self.private.lock_irqsave();
            if !prv.pcpu_list.is_empty() || prv.placement.nr_domains() != 0 {
                warn!(
                    "deinit with {} pCPUs and {} domains still attached",
                    prv.pcpu_list.len(),
                    prv.placement.nr_domains()
                );
            }
            debug_assert!(prv.pcpu_list.is_empty());
            debug_assert_eq!(prv.placement.nr_domains(), 0);
        }
        self.hv
    }

    pub fn hv(&self) -> &H {
        &self.hv
    }

    pub fn nr_cpu_ids(&self) -> usize {
        self.pcpus.len()
    }

    fn slot(&self, cpu: CpuId) -> Result<&PcpuSlot, SchedError> {
        self.pcpus
            .get(cpu.index())
            .ok_or(SchedError::Invalid(InvalidCause::CpuOutOfRange { cpu: cpu.0 }))
    }

    fn lock_pcpu(&self, cpu: CpuId) -> Option<IrqSpinGuard<'_, Option<PcpuSched>>> {
        self.pcpus.get(cpu.index()).map(|slot| slot.lock_irqsave())
    }

    /// Rebuild one pCPU's frames. Both locks held by the caller.
    fn rebuild(&self, pc: &mut Option<PcpuSched>, prv: &Private) {
        if let Some(pc) = pc.as_mut() {
            pc.build(&prv.store, &prv.placement, self.hv.now());
        }
    }

    /// Take `cpu`'s lock then the private lock, rebuild and kick the pCPU.
    fn rebuild_and_raise(&self, cpu: CpuId) {
        let Some(mut pc) = self.lock_pcpu(cpu) else {
            return;
        };
        let prv = self.private.lock_irqsave();
        self.rebuild(&mut pc, &prv);
        self.hv.raise_schedule_softirq(cpu);
    }

    // pCPU lifecycle

    pub fn alloc_pdata(&self, cpu: CpuId) -> Result<(), SchedError> {
        let slot = self.slot(cpu)?;
        let pc = PcpuSched::try_new(cpu)?;
        let mut guard = slot.lock_irqsave();
        debug_assert!(guard.is_none(), "pCPU {cpu} allocated twice");
        *guard = Some(pc);
        Ok(())
    }

    /// Add an allocated pCPU to the pool and materialize its schedule.
    pub fn init_pdata(&self, cpu: CpuId) -> Result<(), SchedError> {
        let mut pc = self.slot(cpu)?.lock_irqsave();
        if pc.is_none() {
            return Err(InvalidCause::NoSuchRecord.into());
        }
        let mut prv = self.private.lock_irqsave();
        if prv.pool.test(cpu) {
            warn!("pCPU {} joined the pool twice", cpu);
            return Err(InvalidCause::AlreadyInPool { cpu: cpu.0 }.into());
        }
        prv.pool.set(cpu);
        prv.pcpu_list.push(cpu);
        self.rebuild(&mut pc, &prv);
        debug!("pCPU {} joined pool {}", cpu, prv.pool);
        Ok(())
    }

    /// Drop a pCPU from the pool. UNITs are moved off it by the framework
    /// beforehand; nothing is reassigned here.
    pub fn deinit_pdata(&self, cpu: CpuId) {
        let mut prv = self.private.lock_irqsave();
        if !prv.pool.test(cpu) {
            warn!("pCPU {} left a pool it was not in", cpu);
            return;
        }
        prv.pool.clear(cpu);
        prv.pcpu_list.retain(|&c| c != cpu);
        debug!("pCPU {} left pool {}", cpu, prv.pool);
    }

    pub fn free_pdata(&self, cpu: CpuId) {
        if let Some(mut pc) = self.lock_pcpu(cpu) {
            *pc = None;
        }
    }

    // Domain lifecycle

    pub fn alloc_domdata(&self, handle: DomainHandle) -> Result<DomainId, SchedError> {
        self.private.lock_irqsave().placement.add_domain(handle)
    }

    pub fn free_domdata(&self, dom: DomainId) {
        self.private.lock_irqsave().placement.remove_domain(dom);
    }

    // UNIT lifecycle

    /// Allocate the record for a vCPU. It stays inactive until inserted.
    pub fn alloc_udata(
        &self,
        dom: DomainId,
        vcpu_id: u32,
        hard_affinity: Cpumask,
        cpu: CpuId,
    ) -> Result<UnitId, SchedError> {
        self.slot(cpu)?;
        self.private
            .lock_irqsave()
            .placement
            .add_unit(dom, vcpu_id, hard_affinity, cpu)
    }

    /// Admit a UNIT: place it and, if its pCPU has no UNIT of this domain
    /// yet, make it the domain's representative there.
    pub fn insert_unit(&self, unit: UnitId) -> Result<(), SchedError> {
        let cpu = {
            let mut prv = self.private.lock_irqsave();
            prv.placement.link_unit(unit)?;
            let cpu = prv.placement.pick_resource(unit, &prv.pool);
            if let Some(u) = prv.placement.unit_mut(unit) {
                u.master = cpu;
            }
            if !prv.placement.can_assign(unit, cpu, &prv.pool) {
                debug!("{} inserted inactive on pCPU {}", unit, cpu);
                return Ok(());
            }
            prv.placement.assign(unit, cpu);
            cpu
        };
        self.rebuild_and_raise(cpu);
        Ok(())
    }

    /// Withdraw a UNIT. If it was active, a sibling may take its pCPU.
    pub fn remove_unit(&self, unit: UnitId) {
        let cpu = {
            let mut prv = self.private.lock_irqsave();
            let Some((active, cpu)) = prv.placement.unit(unit).map(|u| (u.active, u.master))
            else {
                return;
            };
            prv.placement.unlink_unit(unit);
            if !active {
                return;
            }
            let pool = prv.pool.clone();
            if let Some(next) = prv.placement.deassign(unit, &pool) {
                debug!("{} took pCPU {} over from {}", next, cpu, unit);
            }
            cpu
        };
        self.rebuild_and_raise(cpu);
    }

    pub fn free_udata(&self, unit: UnitId) {
        self.private.lock_irqsave().placement.remove_unit(unit);
    }

    // Runtime hooks

    fn master_of(&self, unit: UnitId) -> Option<CpuId> {
        self.private
            .lock_irqsave()
            .placement
            .unit(unit)
            .map(|u| u.master)
    }

    pub fn sleep(&self, unit: UnitId) {
        let Some(cpu) = self.master_of(unit) else {
            return;
        };
        if self.hv.curr_on_cpu(cpu) == Some(unit) {
            self.hv.raise_schedule_softirq(cpu);
        }
    }

    pub fn wake(&self, unit: UnitId) {
        if let Some(cpu) = self.master_of(unit) {
            self.hv.raise_schedule_softirq(cpu);
        }
    }

    pub fn pick_resource(&self, unit: UnitId) -> CpuId {
        let prv = self.private.lock_irqsave();
        prv.placement.pick_resource(unit, &prv.pool)
    }

    /// Move a UNIT's master to `new_cpu`. It is deactivated on its old pCPU
    /// and becomes active on the new one only if the domain has no
    /// representative there yet; otherwise it stays inactive.
    pub fn migrate(&self, unit: UnitId, new_cpu: CpuId) -> Result<(), SchedError> {
        self.slot(new_cpu)?;
        self.relocate(unit, Relocation::To(new_cpu)).map(|_| ())
    }

    /// Change a UNIT's hard affinity and move it where the new mask says.
    /// The mask update and the move are one critical section.
    pub fn adjust_affinity(&self, unit: UnitId, hard_affinity: Cpumask) -> Result<(), SchedError> {
        let target = self.relocate(unit, Relocation::Affinity(hard_affinity))?;
        trace!("{} placed on pCPU {} after affinity change", unit, target);
        Ok(())
    }

    /// Shared body of migrate and adjust_affinity. Returns the new master.
    fn relocate(&self, unit: UnitId, how: Relocation) -> Result<CpuId, SchedError> {
        loop {
            let (old_cpu, new_cpu) = {
                let prv = self.private.lock_irqsave();
                let u = prv.placement.unit(unit).ok_or(InvalidCause::NoSuchRecord)?;
                (u.master, how.target(&prv, unit))
            };

            // Both pCPU locks in ascending order, then the private lock.
            let (lo, hi) = if old_cpu <= new_cpu {
                (old_cpu, new_cpu)
            } else {
                (new_cpu, old_cpu)
            };
            let mut lo_pc = self.lock_pcpu(lo);
            let mut hi_pc = if hi != lo { self.lock_pcpu(hi) } else { None };
            let mut prv = self.private.lock_irqsave();

            let Some(u) = prv.placement.unit(unit) else {
                return Err(InvalidCause::NoSuchRecord.into());
            };
            if u.master != old_cpu || how.target(&prv, unit) != new_cpu {
                // Moved, or the placement changed, while we were taking locks.
                continue;
            }
            let was_active = u.active;

            if let Relocation::Affinity(mask) = &how {
                if let Some(u) = prv.placement.unit_mut(unit) {
                    u.hard_affinity = mask.clone();
                }
            }
            // An active UNIT leaves its pCPU when it moves or when the new
            // affinity no longer covers it.
            let allowed = prv
                .placement
                .unit(unit)
                .is_some_and(|u| u.hard_affinity.test(old_cpu) && prv.pool.test(old_cpu));

            if was_active && (old_cpu != new_cpu || !allowed) {
                if self.hv.curr_on_cpu(old_cpu) == Some(unit) {
                    self.hv.set_migrating(unit);
                    self.hv.raise_schedule_softirq(old_cpu);
                }
                let pool = prv.pool.clone();
                if let Some(next) = prv.placement.deassign(unit, &pool) {
                    debug!("{} took pCPU {} over from {}", next, old_cpu, unit);
                }
                let pc = if old_cpu == lo {
                    lo_pc.as_deref_mut()
                } else {
                    hi_pc.as_deref_mut()
                };
                if let Some(pc) = pc {
                    self.rebuild(pc, &prv);
                }
                self.hv.raise_schedule_softirq(old_cpu);
            }

            let now_active = prv.placement.unit(unit).is_some_and(|u| u.active);
            if !now_active && prv.placement.can_assign(unit, new_cpu, &prv.pool) {
                prv.placement.assign(unit, new_cpu);
                let pc = if new_cpu == lo {
                    lo_pc.as_deref_mut()
                } else {
                    hi_pc.as_deref_mut()
                };
                if let Some(pc) = pc {
                    self.rebuild(pc, &prv);
                }
                self.hv.raise_schedule_softirq(new_cpu);
            } else if let Some(u) = prv.placement.unit_mut(unit) {
                u.master = new_cpu;
                if !now_active {
                    debug!("{} parked inactive on pCPU {}", unit, new_cpu);
                }
            }
            return Ok(new_cpu);
        }
    }

    /// Dispatch entry for `cpu`: pick what runs next and for how long.
    pub fn do_schedule(
        &self,
        cpu: CpuId,
        prev: UnitRef,
        now: TimeNs,
        tasklet_pending: bool,
    ) -> ScheduleDecision {
        let idle = ScheduleDecision {
            next: UnitRef::Idle(cpu),
            time_slice: crate::schedule::DEFAULT_TIMESLICE,
            frame: None,
            anomaly: None,
        };
        let Some(mut guard) = self.lock_pcpu(cpu) else {
            return idle;
        };
        let Some(pc) = guard.as_mut() else {
            return idle;
        };
        let decision = pc.dispatch(now, tasklet_pending, |u| self.hv.unit_runnable(u));
        if decision.next != prev {
            trace!("pCPU {} switch {} -> {}", cpu, prev, decision.next);
        }
        decision
    }

    // Schedule control

    /// Validate and install a new schedule, then rebuild every pool pCPU.
    /// A rejected schedule leaves the old one in force.
    pub fn set_schedule(&self, schedule: Schedule) -> Result<(), SchedError> {
        if let Err(cause) = schedule.validate() {
            self.nr_rejects.fetch_add(1, Ordering::Relaxed);
            warn!("schedule rejected: {}", cause);
            return Err(cause.into());
        }

        let pool = {
            let mut prv = self.private.lock_irqsave();
            let now = self.hv.now();
            debug!(
                "installing {} frames, major frame {}ns, epoch {}",
                schedule.entries.len(),
                schedule.major_frame,
                now
            );
            prv.store.replace(schedule, now);
            prv.pool.clone()
        };

        for cpu in pool.iter() {
            let Some(mut pc) = self.lock_pcpu(cpu) else {
                continue;
            };
            let prv = self.private.lock_irqsave();
            if prv.pool.test(cpu) {
                self.rebuild(&mut pc, &prv);
            }
        }

        for cpu in pool.iter() {
            self.hv.raise_schedule_softirq(cpu);
        }
        self.nr_installs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn get_schedule(&self) -> Schedule {
        self.private.lock_irqsave().store.schedule().clone()
    }

    pub fn epoch(&self) -> TimeNs {
        self.private.lock_irqsave().store.epoch()
    }

    /// Control-plane entry. Put decodes `buf` and installs it; get encodes
    /// the current schedule into `buf`. Returns the bytes written.
    pub fn adjust_global(&self, cmd: u32, buf: &mut [u8]) -> Result<usize, SchedError> {
        match SchedOpCmd::from_raw(cmd)? {
            SchedOpCmd::PutInfo => {
                let schedule = match abi::decode_schedule(buf) {
                    Ok(schedule) => schedule,
                    Err(e) => {
                        self.nr_rejects.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                };
                self.set_schedule(schedule)?;
                Ok(0)
            }
            SchedOpCmd::GetInfo => abi::encode_schedule(&self.get_schedule(), buf),
        }
    }

    // Introspection

    pub fn pool(&self) -> Cpumask {
        self.private.lock_irqsave().pool.clone()
    }

    /// Run `f` on a pCPU's materialized schedule under its lock.
    pub fn with_pcpu<R>(&self, cpu: CpuId, f: impl FnOnce(&PcpuSched) -> R) -> Option<R> {
        let guard = self.lock_pcpu(cpu)?;
        guard.as_ref().map(f)
    }

    /// Run `f` on the placement state and pool under the private lock.
    pub fn with_placement<R>(&self, f: impl FnOnce(&Placement, &Cpumask) -> R) -> R {
        let prv = self.private.lock_irqsave();
        f(&prv.placement, &prv.pool)
    }

    pub fn stats(&self) -> Metrics {
        let mut metrics = Metrics {
            nr_installs: self.nr_installs.load(Ordering::Relaxed),
            nr_rejects: self.nr_rejects.load(Ordering::Relaxed),
            ..Default::default()
        };
        for (cpu, slot) in self.pcpus.iter().enumerate() {
            if let Some(pc) = slot.lock_irqsave().as_ref() {
                metrics.pcpus.insert(cpu as u32, pc.metrics().clone());
            }
        }
        let prv = self.private.lock_irqsave();
        metrics.nr_domains = prv.placement.nr_domains() as u64;
        metrics.nr_units = prv.placement.nr_units() as u64;
        metrics.nr_active_units = prv
            .placement
            .domains()
            .map(|(_, d)| d.active_pcpus.weight() as u64)
            .sum();
        metrics
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::clock::SimClock;
    use crate::error::DispatchAnomaly;
    use crate::schedule::ScheduleEntry;
    use crate::types::millisecs;

    #[derive(Default)]
    struct TestHv {
        clock: SimClock,
        raised: RefCell<Vec<CpuId>>,
        curr: RefCell<Vec<(CpuId, UnitId)>>,
        blocked: RefCell<Vec<UnitId>>,
        migrating: RefCell<Vec<UnitId>>,
    }

    impl Clock for TestHv {
        fn now(&self) -> TimeNs {
            self.clock.now()
        }
    }

    impl Hypervisor for TestHv {
        fn raise_schedule_softirq(&self, cpu: CpuId) {
            self.raised.borrow_mut().push(cpu);
        }

        fn curr_on_cpu(&self, cpu: CpuId) -> Option<UnitId> {
            self.curr
                .borrow()
                .iter()
                .find(|(c, _)| *c == cpu)
                .map(|(_, u)| *u)
        }

        fn unit_runnable(&self, unit: UnitId) -> bool {
            !self.blocked.borrow().contains(&unit)
        }

        fn set_migrating(&self, unit: UnitId) {
            self.migrating.borrow_mut().push(unit);
        }
    }

    const H_D: DomainHandle = DomainHandle([0xd; 16]);

    fn mask(list: &str) -> Cpumask {
        Cpumask::from_cpulist(list).unwrap()
    }

    fn boot(nr_cpus: u32) -> Arinc653Scheduler<TestHv> {
        let sched = Arinc653Scheduler::init(TestHv::default(), nr_cpus as usize).unwrap();
        for cpu in 0..nr_cpus {
            sched.alloc_pdata(CpuId(cpu)).unwrap();
            sched.init_pdata(CpuId(cpu)).unwrap();
        }
        sched
    }

    fn one_frame(handle: DomainHandle, runtime: TimeNs) -> Schedule {
        Schedule {
            entries: vec![ScheduleEntry { handle, runtime }],
            major_frame: runtime,
        }
    }

    fn frame_unit(sched: &Arinc653Scheduler<TestHv>, cpu: u32, index: usize) -> UnitRef {
        sched
            .with_pcpu(CpuId(cpu), |pc| pc.frames()[index].unit)
            .unwrap()
    }

    #[test]
    fn test_boot_schedule() {
        let sched = boot(1);
        assert_eq!(sched.get_schedule(), Schedule::boot());
        assert_eq!(frame_unit(&sched, 0, 0), UnitRef::Idle(CpuId(0)));
        assert_eq!(sched.pool(), mask("0"));
    }

    #[test]
    fn test_insert_activates_and_rebuilds() {
        let sched = boot(2);
        sched.set_schedule(one_frame(H_D, millisecs(10))).unwrap();
        let dom = sched.alloc_domdata(H_D).unwrap();
        let u = sched.alloc_udata(dom, 0, mask("1"), CpuId(0)).unwrap();

        sched.hv().raised.borrow_mut().clear();
        sched.insert_unit(u).unwrap();
        assert_eq!(frame_unit(&sched, 1, 0), UnitRef::Guest(u));
        assert_eq!(frame_unit(&sched, 0, 0), UnitRef::Idle(CpuId(0)));
        assert_eq!(*sched.hv().raised.borrow(), vec![CpuId(1)]);

        sched.remove_unit(u);
        assert_eq!(frame_unit(&sched, 1, 0), UnitRef::Idle(CpuId(1)));
        sched.free_udata(u);
        sched.free_domdata(dom);
        assert_eq!(sched.stats().nr_domains, 0);
    }

    #[test]
    fn test_remove_hands_pcpu_to_sibling() {
        let sched = boot(1);
        sched.set_schedule(one_frame(H_D, millisecs(10))).unwrap();
        let dom = sched.alloc_domdata(H_D).unwrap();
        let u1 = sched.alloc_udata(dom, 0, mask("0"), CpuId(0)).unwrap();
        let u2 = sched.alloc_udata(dom, 1, mask("0"), CpuId(0)).unwrap();
        sched.insert_unit(u1).unwrap();
        sched.insert_unit(u2).unwrap();
        assert_eq!(frame_unit(&sched, 0, 0), UnitRef::Guest(u1));

        sched.remove_unit(u1);
        assert_eq!(frame_unit(&sched, 0, 0), UnitRef::Guest(u2));
        sched.with_placement(|p, pool| p.verify(pool)).unwrap();
    }

    #[test]
    fn test_sleep_raises_only_when_running() {
        let sched = boot(1);
        let dom = sched.alloc_domdata(H_D).unwrap();
        let u = sched.alloc_udata(dom, 0, mask("0"), CpuId(0)).unwrap();
        sched.insert_unit(u).unwrap();

        sched.hv().raised.borrow_mut().clear();
        sched.sleep(u);
        assert!(sched.hv().raised.borrow().is_empty());

        sched.hv().curr.borrow_mut().push((CpuId(0), u));
        sched.sleep(u);
        sched.wake(u);
        assert_eq!(*sched.hv().raised.borrow(), vec![CpuId(0), CpuId(0)]);
    }

    #[test]
    fn test_migrate_running_unit_sets_migrating() {
        let sched = boot(2);
        sched.set_schedule(one_frame(H_D, millisecs(10))).unwrap();
        let dom = sched.alloc_domdata(H_D).unwrap();
        let u = sched.alloc_udata(dom, 0, mask("0-1"), CpuId(0)).unwrap();
        sched.insert_unit(u).unwrap();
        sched.hv().curr.borrow_mut().push((CpuId(0), u));

        sched.migrate(u, CpuId(1)).unwrap();
        assert_eq!(*sched.hv().migrating.borrow(), vec![u]);
        assert_eq!(frame_unit(&sched, 0, 0), UnitRef::Idle(CpuId(0)));
        assert_eq!(frame_unit(&sched, 1, 0), UnitRef::Guest(u));
        assert_eq!(sched.pick_resource(u), CpuId(1));
    }

    #[test]
    fn test_adjust_affinity_moves_unit() {
        let sched = boot(2);
        sched.set_schedule(one_frame(H_D, millisecs(10))).unwrap();
        let dom = sched.alloc_domdata(H_D).unwrap();
        let u = sched.alloc_udata(dom, 0, mask("0-1"), CpuId(0)).unwrap();
        sched.insert_unit(u).unwrap();
        assert_eq!(frame_unit(&sched, 0, 0), UnitRef::Guest(u));

        sched.adjust_affinity(u, mask("1")).unwrap();
        assert_eq!(frame_unit(&sched, 0, 0), UnitRef::Idle(CpuId(0)));
        assert_eq!(frame_unit(&sched, 1, 0), UnitRef::Guest(u));
        sched.with_placement(|p, pool| p.verify(pool)).unwrap();
    }

    #[test]
    fn test_affinity_outside_pool_deactivates() {
        let sched = boot(2);
        sched.set_schedule(one_frame(H_D, millisecs(10))).unwrap();
        let dom = sched.alloc_domdata(H_D).unwrap();
        let u = sched.alloc_udata(dom, 0, mask("0-1"), CpuId(0)).unwrap();
        sched.insert_unit(u).unwrap();

        sched.adjust_affinity(u, mask("5")).unwrap();
        assert_eq!(frame_unit(&sched, 0, 0), UnitRef::Idle(CpuId(0)));
        let (active, master) = sched
            .with_placement(|p, _| p.unit(u).map(|r| (r.active, r.master)))
            .unwrap();
        assert_eq!((active, master), (false, CpuId(0)));
        sched.with_placement(|p, pool| p.verify(pool)).unwrap();

        sched.adjust_affinity(u, mask("1")).unwrap();
        assert_eq!(frame_unit(&sched, 1, 0), UnitRef::Guest(u));
        sched.with_placement(|p, pool| p.verify(pool)).unwrap();
    }

    #[test]
    fn test_do_schedule_substitutes_idle() {
        let sched = boot(1);
        sched.set_schedule(one_frame(H_D, millisecs(10))).unwrap();
        let dom = sched.alloc_domdata(H_D).unwrap();
        let u = sched.alloc_udata(dom, 0, mask("0"), CpuId(0)).unwrap();
        sched.insert_unit(u).unwrap();

        let d = sched.do_schedule(CpuId(0), UnitRef::Idle(CpuId(0)), 0, false);
        assert_eq!(d.next, UnitRef::Guest(u));
        assert_eq!(d.time_slice, millisecs(10));

        sched.hv().blocked.borrow_mut().push(u);
        let d = sched.do_schedule(CpuId(0), d.next, millisecs(2), false);
        assert_eq!(d.next, UnitRef::Idle(CpuId(0)));
        assert_eq!(d.time_slice, millisecs(8));
        assert_eq!(d.anomaly, Some(DispatchAnomaly::NotReady));

        let stats = sched.stats();
        assert_eq!(stats.pcpus[&0].nr_not_ready, 1);
        assert_eq!(stats.nr_active_units, 1);
    }

    #[test]
    fn test_rejected_set_keeps_old_schedule() {
        let sched = boot(1);
        let good = one_frame(H_D, millisecs(10));
        sched.set_schedule(good.clone()).unwrap();
        let bad = Schedule {
            entries: vec![ScheduleEntry {
                handle: H_D,
                runtime: millisecs(10) + 1,
            }],
            major_frame: millisecs(10),
        };
        assert_eq!(sched.set_schedule(bad).unwrap_err().errno(), -22);
        assert_eq!(sched.get_schedule(), good);
        let stats = sched.stats();
        assert_eq!((stats.nr_installs, stats.nr_rejects), (1, 1));
    }

    #[test]
    fn test_set_moves_epoch_to_now() {
        let sched = boot(1);
        sched.hv().clock.set(12_345);
        sched.set_schedule(one_frame(H_D, 100)).unwrap();
        assert_eq!(sched.epoch(), 12_345);
        let next = sched.with_pcpu(CpuId(0), |pc| pc.next_switch_time());
        assert_eq!(next, Some(12_445));
    }

    #[test]
    fn test_adjust_global_round_trip() {
        let sched = boot(1);
        let mut buf = vec![0u8; abi::PAYLOAD_LEN];
        let s = Schedule {
            entries: vec![
                ScheduleEntry {
                    handle: H_D,
                    runtime: millisecs(3),
                },
                ScheduleEntry {
                    handle: DomainHandle::ZERO,
                    runtime: millisecs(7),
                },
            ],
            major_frame: millisecs(10),
        };
        abi::encode_schedule(&s, &mut buf).unwrap();
        assert_eq!(sched.adjust_global(SchedOpCmd::PUTINFO, &mut buf), Ok(0));

        let mut out = vec![0xffu8; abi::PAYLOAD_LEN];
        let n = sched.adjust_global(SchedOpCmd::GETINFO, &mut out).unwrap();
        assert_eq!(n, abi::payload_len(2));
        assert_eq!(abi::decode_schedule(&out[..n]).unwrap(), s);
        assert_eq!(sched.adjust_global(9, &mut out).unwrap_err().errno(), -22);
    }

    #[test]
    fn test_pdata_lifecycle() {
        let sched = Arinc653Scheduler::init(TestHv::default(), 2).unwrap();
        assert!(sched.init_pdata(CpuId(0)).is_err());
        assert!(sched.alloc_pdata(CpuId(2)).is_err());

        sched.alloc_pdata(CpuId(0)).unwrap();
        sched.init_pdata(CpuId(0)).unwrap();
        assert_eq!(
            sched.init_pdata(CpuId(0)),
            Err(SchedError::Invalid(InvalidCause::AlreadyInPool { cpu: 0 }))
        );
        assert_eq!(sched.pool(), mask("0"));
        assert!(sched.with_pcpu(CpuId(0), |pc| pc.is_built()).unwrap());

        sched.deinit_pdata(CpuId(0));
        sched.free_pdata(CpuId(0));
        assert!(sched.with_pcpu(CpuId(0), |_| ()).is_none());
        assert!(sched.pool().is_empty());
        sched.deinit();
    }

    #[test]
    fn test_init_rejects_bad_cpu_count() {
        assert!(Arinc653Scheduler::init(TestHv::default(), 0).is_err());
        assert!(Arinc653Scheduler::init(TestHv::default(), MAX_CPUS + 1).is_err());
    }
}
