// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Placement of domains' UNITs onto pCPUs.
//!
//! A schedule names domains, not UNITs. On each pCPU a domain is represented
//! by at most one *active* UNIT, whose master is that pCPU; the domain's
//! `active_pcpus` mask is exactly the set of masters of its active UNITs.
//! Everything here runs under the scheduler's private lock.

use anyhow::bail;
use log::debug;
use log::warn;

use crate::arena::Arena;
use crate::cpumask::Cpumask;
use crate::error::SchedError;
use crate::handle::DomainHandle;
use crate::types::CpuId;
use crate::types::DomainId;
use crate::types::UnitId;

#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub handle: DomainHandle,
    /// In insertion order; tie-breaks depend on it.
    pub units: Vec<UnitId>,
    pub active_pcpus: Cpumask,
}

#[derive(Debug, Clone)]
pub struct UnitRecord {
    pub domain: DomainId,
    pub vcpu_id: u32,
    /// This UNIT represents its domain on `master`.
    pub active: bool,
    pub master: CpuId,
    pub hard_affinity: Cpumask,
    /// On its domain's UNIT list.
    pub linked: bool,
}

#[derive(Debug, Default)]
pub struct Placement {
    domains: Arena<DomainRecord>,
    dom_list: Vec<DomainId>,
    units: Arena<UnitRecord>,
}

impl Placement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn domain(&self, dom: DomainId) -> Option<&DomainRecord> {
        self.domains.get(dom.0)
    }

    pub fn unit(&self, unit: UnitId) -> Option<&UnitRecord> {
        self.units.get(unit.0)
    }

    pub fn unit_mut(&mut self, unit: UnitId) -> Option<&mut UnitRecord> {
        self.units.get_mut(unit.0)
    }

    pub fn domains(&self) -> impl Iterator<Item = (DomainId, &DomainRecord)> {
        self.dom_list
            .iter()
            .filter_map(|&id| self.domains.get(id.0).map(|d| (id, d)))
    }

    pub fn nr_domains(&self) -> usize {
        self.dom_list.len()
    }

    pub fn nr_units(&self) -> usize {
        self.units.len()
    }

    pub fn add_domain(&mut self, handle: DomainHandle) -> Result<DomainId, SchedError> {
        self.dom_list.try_reserve(1)?;
        let id = DomainId(self.domains.try_insert(DomainRecord {
            handle,
            units: Vec::new(),
            active_pcpus: Cpumask::new(),
        })?);
        self.dom_list.push(id);
        debug!("domain {} registered as {:?}", handle, id);
        Ok(id)
    }

    /// Drop a domain record. Its UNIT list must already be empty.
    pub fn remove_domain(&mut self, dom: DomainId) -> Option<DomainRecord> {
        let record = self.domains.get(dom.0)?;
        if !record.units.is_empty() {
            warn!(
                "domain {} freed with {} UNITs still inserted",
                record.handle,
                record.units.len()
            );
            debug_assert!(record.units.is_empty());
        }
        self.dom_list.retain(|&id| id != dom);
        self.domains.remove(dom.0)
    }

    /// First registered domain whose handle matches byte for byte.
    pub fn find_domain(&self, handle: &DomainHandle) -> Option<DomainId> {
        self.domains()
            .find(|(_, d)| d.handle == *handle)
            .map(|(id, _)| id)
    }

    pub fn add_unit(
        &mut self,
        dom: DomainId,
        vcpu_id: u32,
        hard_affinity: Cpumask,
        master: CpuId,
    ) -> Result<UnitId, SchedError> {
        if !self.domains.contains(dom.0) {
            return Err(crate::error::InvalidCause::NoSuchRecord.into());
        }
        let id = self.units.try_insert(UnitRecord {
            domain: dom,
            vcpu_id,
            active: false,
            master,
            hard_affinity,
            linked: false,
        })?;
        Ok(UnitId(id))
    }

    pub fn remove_unit(&mut self, unit: UnitId) -> Option<UnitRecord> {
        let record = self.units.get(unit.0)?;
        debug_assert!(!record.linked && !record.active);
        self.units.remove(unit.0)
    }

    /// Put the UNIT on its domain's list.
    pub fn link_unit(&mut self, unit: UnitId) -> Result<(), SchedError> {
        let dom = match self.units.get(unit.0) {
            Some(u) if !u.linked => u.domain,
            _ => return Err(crate::error::InvalidCause::NoSuchRecord.into()),
        };
        let record = self
            .domains
            .get_mut(dom.0)
            .ok_or(crate::error::InvalidCause::NoSuchRecord)?;
        record.units.try_reserve(1)?;
        record.units.push(unit);
        if let Some(u) = self.units.get_mut(unit.0) {
            u.linked = true;
        }
        Ok(())
    }

    pub fn unlink_unit(&mut self, unit: UnitId) {
        let Some(u) = self.units.get_mut(unit.0) else {
            return;
        };
        u.linked = false;
        let dom = u.domain;
        if let Some(record) = self.domains.get_mut(dom.0) {
            record.units.retain(|&id| id != unit);
        }
    }

    /// The domain's active UNIT on `cpu`, first in insertion order.
    pub fn find_unit_for(&self, dom: DomainId, cpu: CpuId) -> Option<UnitId> {
        let record = self.domains.get(dom.0)?;
        record.units.iter().copied().find(|&id| {
            self.units
                .get(id.0)
                .is_some_and(|u| u.active && u.master == cpu)
        })
    }

    /// An inactive UNIT of `dom` allowed on `cpu`, skipping `exclude`.
    pub fn find_inactive_unit(
        &self,
        dom: DomainId,
        cpu: CpuId,
        pool: &Cpumask,
        exclude: Option<UnitId>,
    ) -> Option<UnitId> {
        let record = self.domains.get(dom.0)?;
        if !pool.test(cpu) || record.active_pcpus.test(cpu) {
            return None;
        }
        record.units.iter().copied().find(|&id| {
            Some(id) != exclude
                && self
                    .units
                    .get(id.0)
                    .is_some_and(|u| !u.active && u.hard_affinity.test(cpu))
        })
    }

    /// pCPUs the UNIT may be active on: hard affinity within the pool.
    pub fn candidates(&self, unit: UnitId, pool: &Cpumask) -> Cpumask {
        match self.units.get(unit.0) {
            Some(u) => u.hard_affinity.and(pool),
            None => Cpumask::new(),
        }
    }

    /// Where the UNIT should live. Sticks to the current master when still
    /// allowed, else the lowest allowed pCPU not yet serving this domain,
    /// else the lowest allowed pCPU.
    pub fn pick_resource(&self, unit: UnitId, pool: &Cpumask) -> CpuId {
        match self.units.get(unit.0) {
            Some(u) => self.pick_resource_within(unit, &u.hard_affinity, pool),
            None => CpuId(0),
        }
    }

    /// `pick_resource` as if the UNIT's hard affinity were `affinity`.
    pub fn pick_resource_within(&self, unit: UnitId, affinity: &Cpumask, pool: &Cpumask) -> CpuId {
        let Some(u) = self.units.get(unit.0) else {
            return CpuId(0);
        };
        let cand = affinity.and(pool);
        if cand.test(u.master) {
            return u.master;
        }

        let active = self
            .domains
            .get(u.domain.0)
            .map(|d| d.active_pcpus.clone())
            .unwrap_or_default();
        if let Some(free) = cand.and_not(&active).first() {
            return free;
        }

        match cand.first() {
            Some(cpu) => cpu,
            None => {
                warn!(
                    "{} has no pCPU in affinity {} within pool {}, staying on {}",
                    unit, affinity, pool, u.master
                );
                u.master
            }
        }
    }

    /// Whether the UNIT can become its domain's representative on `cpu`.
    pub fn can_assign(&self, unit: UnitId, cpu: CpuId, pool: &Cpumask) -> bool {
        let Some(u) = self.units.get(unit.0) else {
            return false;
        };
        let Some(d) = self.domains.get(u.domain.0) else {
            return false;
        };
        !u.active && pool.test(cpu) && u.hard_affinity.test(cpu) && !d.active_pcpus.test(cpu)
    }

    pub fn assign(&mut self, unit: UnitId, cpu: CpuId) {
        let Some(u) = self.units.get_mut(unit.0) else {
            return;
        };
        debug_assert!(!u.active, "{unit} assigned while active");
        u.active = true;
        u.master = cpu;
        let dom = u.domain;
        if let Some(d) = self.domains.get_mut(dom.0) {
            debug_assert!(!d.active_pcpus.test(cpu), "{unit} assigned to busy pCPU {cpu}");
            d.active_pcpus.set(cpu);
        }
        debug!("{} active on pCPU {}", unit, cpu);
    }

    /// Deactivate the UNIT and hand its pCPU to an inactive sibling allowed
    /// there, if any. Returns the sibling that took over.
    pub fn deassign(&mut self, unit: UnitId, pool: &Cpumask) -> Option<UnitId> {
        let u = self.units.get_mut(unit.0)?;
        debug_assert!(u.active, "{unit} deassigned while inactive");
        u.active = false;
        let cpu = u.master;
        let dom = u.domain;
        if let Some(d) = self.domains.get_mut(dom.0) {
            d.active_pcpus.clear(cpu);
        }
        debug!("{} inactive on pCPU {}", unit, cpu);

        let next = self.find_inactive_unit(dom, cpu, pool, Some(unit))?;
        self.assign(next, cpu);
        Some(next)
    }

    /// Check the placement relation is internally consistent.
    pub fn verify(&self, pool: &Cpumask) -> anyhow::Result<()> {
        for (dom, d) in self.domains() {
            let mut masters = Cpumask::new();
            let mut nr_active = 0;
            for &id in &d.units {
                let Some(u) = self.units.get(id.0) else {
                    bail!("{:?} lists missing {}", dom, id);
                };
                if u.domain != dom {
                    bail!("{} listed under {:?} but belongs to {:?}", id, dom, u.domain);
                }
                if !u.active {
                    continue;
                }
                nr_active += 1;
                if masters.test(u.master) {
                    bail!("{:?} has two active UNITs on pCPU {}", dom, u.master);
                }
                masters.set(u.master);
                if !u.hard_affinity.and(pool).test(u.master) {
                    bail!("{} active on pCPU {} outside affinity or pool", id, u.master);
                }
            }
            if masters != d.active_pcpus {
                bail!(
                    "{:?} active_pcpus {} but active UNITs on {}",
                    dom,
                    d.active_pcpus,
                    masters
                );
            }
            if d.active_pcpus.weight() > d.units.len() || nr_active > d.units.len() {
                bail!("{:?} has more active pCPUs than UNITs", dom);
            }
        }
        Ok(())
    }
}
