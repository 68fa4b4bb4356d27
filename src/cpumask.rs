// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A fixed-size set of pCPU ids backed by a `BitVec` of u64's. Hard
//! affinities, the pool mask and every domain's active-pCPU set are
//! Cpumasks.
//!
//! Masks can be built empty, full up to a CPU count, or from a cpulist
//! string as found in sysfs and in simulator configuration files:
//!
//!```
//!     use scx_arinc653::{CpuId, Cpumask};
//!     let mask = Cpumask::from_cpulist("0-2,5").unwrap();
//!     assert_eq!(mask.weight(), 4);
//!     assert_eq!(mask.first(), Some(CpuId(0)));
//!     assert_eq!(mask.to_string(), "0-2,5");
//!```
//!
//! The string "all" is accepted by `parse` together with a CPU count, and
//! "none" yields an empty mask.

use std::fmt;

use anyhow::bail;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;

use crate::types::CpuId;
use crate::types::MAX_CPUS;

#[derive(Debug, Eq, Clone, Hash, PartialEq)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    /// Build a new empty Cpumask.
    pub fn new() -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; MAX_CPUS],
        }
    }

    /// Build a Cpumask with CPUs `0..nr_cpus` set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        let mut mask = Cpumask::new();
        mask.mask[..nr_cpus.min(MAX_CPUS)].fill(true);
        mask
    }

    pub fn from_cpus<I: IntoIterator<Item = CpuId>>(cpus: I) -> Cpumask {
        let mut mask = Cpumask::new();
        for cpu in cpus {
            mask.set(cpu);
        }
        mask
    }

    /// Build a Cpumask from a cpulist such as "0-3,8".
    pub fn from_cpulist(cpulist: &str) -> Result<Cpumask> {
        let mut mask = Cpumask::new();
        for cpu in read_cpulist(cpulist)? {
            mask.set_cpu(cpu)?;
        }
        Ok(mask)
    }

    /// Parse "all", "none" or a cpulist. "all" expands to `0..nr_cpus`;
    /// a cpulist may not name a CPU at or beyond `nr_cpus`.
    pub fn parse(input: &str, nr_cpus: usize) -> Result<Cpumask> {
        match input.trim() {
            "all" => Ok(Cpumask::full(nr_cpus)),
            "none" | "" => Ok(Cpumask::new()),
            list => {
                let mask = Cpumask::from_cpulist(list)?;
                if let Some(cpu) = mask.iter().find(|c| c.index() >= nr_cpus) {
                    bail!("CPU {} in {:?} out of range, nr_cpus is {}", cpu, list, nr_cpus);
                }
                Ok(mask)
            }
        }
    }

    /// Set a bit in the Cpumask. Returns an error if the CPU exceeds the
    /// size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        if cpu >= MAX_CPUS {
            bail!("Invalid CPU {} passed, max {}", cpu, MAX_CPUS);
        }
        self.mask.set(cpu, true);
        Ok(())
    }

    pub fn set(&mut self, cpu: CpuId) {
        debug_assert!(cpu.index() < MAX_CPUS);
        self.mask.set(cpu.index(), true);
    }

    pub fn clear(&mut self, cpu: CpuId) {
        debug_assert!(cpu.index() < MAX_CPUS);
        self.mask.set(cpu.index(), false);
    }

    /// Test whether the CPU is set. CPUs beyond the mask are never set.
    pub fn test(&self, cpu: CpuId) -> bool {
        match self.mask.get(cpu.index()) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Lowest CPU in the mask.
    pub fn first(&self) -> Option<CpuId> {
        self.mask.first_one().map(|cpu| CpuId(cpu as u32))
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= &other.mask;
        new
    }

    /// Create a Cpumask with the bits of `other` removed.
    pub fn and_not(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= !other.mask.clone();
        new
    }

    /// Iterate over the CPUs set, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.mask.iter_ones().map(|cpu| CpuId(cpu as u32))
    }
}

impl Default for Cpumask {
    fn default() -> Self {
        Self::new()
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0');
    let mut cpu_ids = vec![];
    for group in cpulist.split(',') {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        if min > max {
            bail!("Descending range in cpulist {}", group.trim());
        }
        cpu_ids.extend(min..=max);
    }

    Ok(cpu_ids)
}

/// Formats as a cpulist, collapsing consecutive CPUs into ranges.
impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cpus = self.mask.iter_ones().peekable();
        while let Some(start) = cpus.next() {
            let mut end = start;
            while cpus.peek() == Some(&(end + 1)) {
                end += 1;
                cpus.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}
