// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Simulation configuration.
//!
//! A configuration names the pCPUs, the domains with their vCPUs, the
//! schedule to install, and a list of timed events. Times are in
//! microseconds. Schedule entries name a domain, `"idle"` for the zero
//! handle, or carry a literal UUID handle.
//!
//! ```json
//! {
//!   "nr_cpus": 2,
//!   "pool": "all",
//!   "duration_us": 50000,
//!   "domains": [
//!     { "name": "dom0", "handle": "00000000-0000-0000-0000-000000000000",
//!       "vcpus": [ { "affinity": "0" } ] },
//!     { "name": "rt", "vcpus": [ { "affinity": "0-1" }, { "affinity": "1" } ] }
//!   ],
//!   "schedule": {
//!     "major_frame_us": 10000,
//!     "entries": [ { "domain": "rt", "runtime_us": 4000 },
//!                  { "domain": "dom0", "runtime_us": 6000 } ]
//!   },
//!   "events": [ { "at_us": 12000, "kind": "sleep", "domain": "rt", "vcpu": 0 } ]
//! }
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::io::Read;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::cpumask::Cpumask;
use crate::handle::DomainHandle;
use crate::schedule::Schedule;
use crate::schedule::ScheduleEntry;
use crate::types::microsecs;
use crate::types::TimeNs;
use crate::types::MAX_CPUS;

fn default_cpus() -> String {
    "all".to_string()
}

fn default_duration_us() -> i64 {
    100_000
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    /// pCPU ids run from 0 to nr_cpus - 1.
    pub nr_cpus: usize,
    /// pCPUs in the pool at start. Cpulist, "all" or "none".
    #[serde(default = "default_cpus")]
    pub pool: String,
    #[serde(default = "default_duration_us")]
    pub duration_us: i64,
    pub domains: Vec<DomainSpec>,
    /// Installed through the control plane once every vCPU is admitted.
    /// Without one the boot schedule stays in force.
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainSpec {
    pub name: String,
    /// UUID text. Derived from the domain's position when absent.
    #[serde(default)]
    pub handle: Option<String>,
    pub vcpus: Vec<VcpuSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VcpuSpec {
    #[serde(default = "default_cpus")]
    pub affinity: String,
    /// pCPU the vCPU was last on before admission.
    #[serde(default)]
    pub cpu: u32,
    /// Starts blocked.
    #[serde(default)]
    pub blocked: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleSpec {
    pub major_frame_us: i64,
    pub entries: Vec<EntrySpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntrySpec {
    pub domain: String,
    pub runtime_us: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventSpec {
    pub at_us: i64,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Sleep { domain: String, vcpu: usize },
    Wake { domain: String, vcpu: usize },
    Migrate { domain: String, vcpu: usize, cpu: u32 },
    Affinity { domain: String, vcpu: usize, cpus: String },
    Reload { schedule: ScheduleSpec },
    /// The clock leaps forward without any timer firing in between.
    ClockJump { delta_us: i64 },
    /// Tasklet work becomes pending on a pCPU.
    Tasklet { cpu: u32 },
    /// A pCPU joins the pool.
    PoolAdd { cpu: u32 },
    /// Every vCPU of a domain is removed, then the domain itself.
    Destroy { domain: String },
}

impl SimConfig {
    /// Parse from a file path, or from `input` itself as JSON when no such
    /// file exists.
    pub fn parse(input: &str) -> Result<Self> {
        let file = fs::OpenOptions::new().read(true).open(input);
        let config: SimConfig = match file {
            Ok(mut opened) => {
                let mut content = String::new();
                opened
                    .read_to_string(&mut content)
                    .with_context(|| format!("failed to read {input}"))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse {input}"))?
            }
            Err(_) => serde_json::from_str(input).context("failed to parse inline config")?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            bail!("nr_cpus {} out of range 1..={}", self.nr_cpus, MAX_CPUS);
        }
        if self.duration_us <= 0 {
            bail!("duration_us must be positive");
        }
        self.pool_mask()?;

        let mut names = BTreeSet::new();
        for (i, d) in self.domains.iter().enumerate() {
            if d.name == "idle" {
                bail!("domain name \"idle\" is reserved");
            }
            if !names.insert(d.name.as_str()) {
                bail!("duplicate domain name {:?}", d.name);
            }
            if d.vcpus.is_empty() {
                bail!("domain {:?} has no vcpus", d.name);
            }
            self.domain_handle(i)?;
            for (v, vcpu) in d.vcpus.iter().enumerate() {
                self.vcpu_affinity(vcpu)
                    .with_context(|| format!("domain {:?} vcpu {}", d.name, v))?;
                self.check_cpu(vcpu.cpu)?;
            }
        }

        if let Some(s) = &self.schedule {
            self.to_schedule(s)?;
        }
        for ev in &self.events {
            if ev.at_us < 0 {
                bail!("event at {}us is before the start", ev.at_us);
            }
            match &ev.action {
                Action::Sleep { domain, vcpu } | Action::Wake { domain, vcpu } => {
                    self.vcpu_index(domain, *vcpu)?;
                }
                Action::Migrate { domain, vcpu, cpu } => {
                    self.vcpu_index(domain, *vcpu)?;
                    self.check_cpu(*cpu)?;
                }
                Action::Affinity { domain, vcpu, cpus } => {
                    self.vcpu_index(domain, *vcpu)?;
                    Cpumask::parse(cpus, self.nr_cpus)?;
                }
                // Reloads may be deliberately invalid: rejection is observable.
                Action::Reload { schedule } => {
                    for e in &schedule.entries {
                        self.entry_handle(&e.domain)?;
                    }
                }
                Action::ClockJump { delta_us } => {
                    if *delta_us < 0 {
                        bail!("clock jumps only go forward");
                    }
                }
                Action::Tasklet { cpu } | Action::PoolAdd { cpu } => self.check_cpu(*cpu)?,
                Action::Destroy { domain } => {
                    self.domain_index(domain)?;
                }
            }
        }
        Ok(())
    }

    fn check_cpu(&self, cpu: u32) -> Result<()> {
        if cpu as usize >= self.nr_cpus {
            bail!("pCPU {} out of range, nr_cpus is {}", cpu, self.nr_cpus);
        }
        Ok(())
    }

    pub fn duration(&self) -> TimeNs {
        microsecs(self.duration_us)
    }

    pub fn pool_mask(&self) -> Result<Cpumask> {
        Cpumask::parse(&self.pool, self.nr_cpus).context("invalid pool")
    }

    pub fn vcpu_affinity(&self, vcpu: &VcpuSpec) -> Result<Cpumask> {
        Cpumask::parse(&vcpu.affinity, self.nr_cpus)
    }

    pub fn domain_index(&self, name: &str) -> Result<usize> {
        self.domains
            .iter()
            .position(|d| d.name == name)
            .with_context(|| format!("unknown domain {name:?}"))
    }

    fn vcpu_index(&self, domain: &str, vcpu: usize) -> Result<(usize, usize)> {
        let d = self.domain_index(domain)?;
        if vcpu >= self.domains[d].vcpus.len() {
            bail!("domain {:?} has no vcpu {}", domain, vcpu);
        }
        Ok((d, vcpu))
    }

    /// The domain's configured handle, or one derived from its position.
    pub fn domain_handle(&self, index: usize) -> Result<DomainHandle> {
        let d = self
            .domains
            .get(index)
            .with_context(|| format!("no domain #{index}"))?;
        match &d.handle {
            Some(text) => text
                .parse::<DomainHandle>()
                .with_context(|| format!("domain {:?} handle", d.name)),
            None => {
                let mut bytes = [0u8; 16];
                bytes[0] = 0xa6;
                bytes[1] = 0x53;
                bytes[12..].copy_from_slice(&(index as u32 + 1).to_be_bytes());
                Ok(DomainHandle(bytes))
            }
        }
    }

    /// Resolve a schedule entry's domain reference.
    pub fn entry_handle(&self, domain: &str) -> Result<DomainHandle> {
        if domain == "idle" {
            return Ok(DomainHandle::ZERO);
        }
        if let Ok(index) = self.domain_index(domain) {
            return self.domain_handle(index);
        }
        domain
            .parse::<DomainHandle>()
            .with_context(|| format!("{domain:?} is neither a domain nor a handle"))
    }

    /// Build the schedule a spec describes. Runtimes are not validated here.
    pub fn to_schedule(&self, spec: &ScheduleSpec) -> Result<Schedule> {
        let entries = spec
            .entries
            .iter()
            .map(|e| {
                Ok(ScheduleEntry {
                    handle: self.entry_handle(&e.domain)?,
                    runtime: microsecs(e.runtime_us),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Schedule {
            entries,
            major_frame: microsecs(spec.major_frame_us),
        })
    }
}
