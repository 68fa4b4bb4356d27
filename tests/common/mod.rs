// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

#![allow(dead_code)]

use scx_arinc653::*;

/// Surface scheduler warnings in test output. Idempotent.
pub fn setup_test() {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Warn,
        simplelog::Config::default(),
    );
}

pub fn handle(b: u8) -> DomainHandle {
    DomainHandle([b; 16])
}

pub fn mask(list: &str) -> Cpumask {
    Cpumask::from_cpulist(list).unwrap()
}

pub fn schedule(entries: &[(DomainHandle, TimeNs)], major_frame: TimeNs) -> Schedule {
    Schedule {
        entries: entries
            .iter()
            .map(|&(handle, runtime)| ScheduleEntry { handle, runtime })
            .collect(),
        major_frame,
    }
}

/// A scheduler on a simulated hypervisor with pCPUs `0..nr_cpus` in the
/// pool and the clock at `start`.
pub fn boot(nr_cpus: u32, start: TimeNs) -> Arinc653Scheduler<SimHypervisor> {
    let hv = SimHypervisor::new(nr_cpus as usize, start);
    let sched = Arinc653Scheduler::init(hv, nr_cpus as usize).unwrap();
    for cpu in 0..nr_cpus {
        sched.alloc_pdata(CpuId(cpu)).unwrap();
        sched.init_pdata(CpuId(cpu)).unwrap();
    }
    sched
}

/// Register a domain and admit one vCPU per affinity mask, each starting
/// on the first pCPU of its mask.
pub fn admit(
    sched: &Arinc653Scheduler<SimHypervisor>,
    h: DomainHandle,
    affinities: &[&str],
) -> (DomainId, Vec<UnitId>) {
    let dom = sched.alloc_domdata(h).unwrap();
    let units = affinities
        .iter()
        .enumerate()
        .map(|(v, aff)| {
            let aff = mask(aff);
            let first = aff.first().unwrap();
            let unit = sched.alloc_udata(dom, v as u32, aff, first).unwrap();
            sched.insert_unit(unit).unwrap();
            unit
        })
        .collect();
    (dom, units)
}

pub fn frame_units(sched: &Arinc653Scheduler<SimHypervisor>, cpu: u32) -> Vec<UnitRef> {
    sched
        .with_pcpu(CpuId(cpu), |pc| pc.frames().iter().map(|f| f.unit).collect())
        .unwrap()
}

pub fn sim(json: &str) -> Simulator {
    setup_test();
    let config = SimConfig::parse(json).unwrap();
    Simulator::new(config).unwrap()
}
