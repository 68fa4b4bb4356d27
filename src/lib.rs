// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! scx_arinc653 - ARINC 653 time-partitioned pCPU scheduler core.
//!
//! A fixed cyclic schedule of (domain handle, runtime) minor frames repeats
//! every major frame. Each pCPU materializes the schedule against the
//! domain UNITs active on it and switches frames on its own timer, with all
//! frame boundaries anchored to one global epoch so every pCPU stays in
//! phase.
//!
//! # Architecture
//!
//! - **Schedule store**: the authoritative schedule and its epoch
//! - **Placement**: which UNIT represents each domain on each pCPU
//! - **pCPU dispatcher**: the per-pCPU minor-frame state machine
//! - **Scheduler**: the framework hooks and the locking around them
//! - **Simulator**: a deterministic hypervisor stand-in driving the hooks
//!
//! # Usage
//!
//! ```rust,no_run
//! use scx_arinc653::*;
//!
//! let config = SimConfig::parse("arinc653.json")?;
//! let outcome = Simulator::new(config)?.run(None)?;
//! outcome.metrics.format(&mut std::io::stdout())?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod abi;
pub mod arena;
pub mod clock;
pub mod config;
pub mod cpumask;
pub mod error;
pub mod handle;
pub mod lock;
pub mod pcpu;
pub mod placement;
pub mod schedule;
pub mod scheduler;
pub mod sim;
pub mod stats;
pub mod types;

pub use clock::Clock;
pub use clock::MonotonicClock;
pub use clock::SimClock;
pub use config::SimConfig;
pub use cpumask::Cpumask;
pub use error::DispatchAnomaly;
pub use error::InvalidCause;
pub use error::SchedError;
pub use handle::DomainHandle;
pub use pcpu::ScheduleDecision;
pub use schedule::Schedule;
pub use schedule::ScheduleEntry;
pub use schedule::MAX_ENTRIES;
pub use scheduler::Arinc653Scheduler;
pub use scheduler::Hypervisor;
pub use sim::SimHypervisor;
pub use sim::Simulator;
pub use stats::Metrics;
pub use types::CpuId;
pub use types::DomainId;
pub use types::TimeNs;
pub use types::UnitId;
pub use types::UnitRef;

pub const SCHEDULER_NAME: &str = "scx_arinc653";
