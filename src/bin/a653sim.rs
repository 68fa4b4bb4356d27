// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! a653sim - Run the ARINC 653 scheduler against a simulated hypervisor.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use log::info;

use scx_arinc653::Clock;
use scx_arinc653::MonotonicClock;
use scx_arinc653::SimConfig;
use scx_arinc653::Simulator;
use scx_arinc653::UnitRef;
use scx_arinc653::types::microsecs;

/// a653sim: drive the ARINC 653 scheduler core from a JSON scenario.
///
/// The scenario names the pCPUs, the domains with their vCPUs, the cyclic
/// schedule and timed events (sleep, wake, migration, affinity change,
/// schedule reload, clock jump, tasklet work, pool growth, domain
/// destruction). It is read from a file, or taken as inline JSON when no
/// file of that name exists.
#[derive(Debug, Parser)]
struct Opts {
    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the scenario's duration, in microseconds.
    #[clap(short = 'd', long)]
    duration_us: Option<i64>,

    /// Print scheduler metrics as JSON instead of the text summary.
    #[clap(long)]
    stats: bool,

    /// Report counter deltas every this many simulated microseconds.
    #[clap(short = 'i', long)]
    monitor_us: Option<i64>,

    /// Print every trace event to stdout.
    #[clap(long)]
    dump_trace: bool,

    /// Scenario file path or inline JSON.
    config: String,
}

fn init_logger(verbose: u8) -> Result<()> {
    let llv = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);

    Ok(simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?)
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logger(opts.verbose)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut config = SimConfig::parse(&opts.config)?;
    if let Some(d) = opts.duration_us {
        config.duration_us = d;
        config.validate()?;
    }
    let nr_cpus = config.nr_cpus as u32;
    let duration = config.duration();

    let mut sim = Simulator::new(config.clone())?;
    let mut units = Vec::new();
    for d in &config.domains {
        for v in 0..d.vcpus.len() {
            units.push((format!("{}.{}", d.name, v), sim.unit(&d.name, v)?));
        }
    }

    info!(
        "simulating {} domains on {} pCPUs for {}us",
        config.domains.len(),
        nr_cpus,
        config.duration_us
    );
    let host = MonotonicClock::new();
    match opts.monitor_us {
        Some(interval) if interval > 0 => {
            let mut prev = sim.scheduler().stats();
            while sim.now() < duration && !shutdown.load(Ordering::Relaxed) {
                let until = (sim.now() + microsecs(interval)).min(duration);
                sim.run_until(until, Some(&*shutdown))?;
                let cur = sim.scheduler().stats();
                println!("--- t={}us", sim.now() / 1000);
                cur.delta(&prev).format(&mut std::io::stdout())?;
                prev = cur;
            }
        }
        _ => sim.run_until(duration, Some(&*shutdown))?,
    }
    let outcome = sim.finish();
    info!("simulation took {}us of host time", host.now() / 1000);
    let end = outcome.trace.end_ns().min(duration);

    let mut out = std::io::stdout();
    if opts.dump_trace {
        outcome.trace.dump(&mut out)?;
    }
    if opts.stats {
        println!("{}", serde_json::to_string_pretty(&outcome.metrics)?);
        return Ok(());
    }

    outcome.metrics.format(&mut out)?;
    for (name, unit) in units {
        let ran = outcome.trace.runtime(unit, nr_cpus, 0, end);
        println!(
            "    {:<16} {:<6} ran {:>12}ns ({:5.1}%)",
            name,
            UnitRef::Guest(unit).to_string(),
            ran,
            100.0 * ran as f64 / end.max(1) as f64
        );
    }
    Ok(())
}
