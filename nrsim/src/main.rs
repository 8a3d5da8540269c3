//! NR PHY Simulator Main Application
//!
//! Loads a scenario, runs it and prints the run summary as JSON. RX trace
//! records can be written as JSON lines.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use common::sim::SimTime;
use layers::phy::TraceRecord;
use layers::simulation::{RunSummary, ScenarioConfig, Simulation};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{load_scenario, Overrides};

/// Simulated time processed between two checks of the stop flag
const RUN_CHUNK: SimTime = SimTime::from_millis(1);

/// NR PHY discrete-event simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the scenario file (TOML, YAML or JSON)
    #[arg(short, long, default_value = "scenario.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Random seed, overrides the scenario
    #[arg(long)]
    seed: Option<u64>,

    /// Simulated duration in ms, overrides the scenario
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Write RX trace records to this file as JSON lines
    #[arg(long)]
    trace_out: Option<PathBuf>,

    /// Write the run summary to this file instead of stdout
    #[arg(long)]
    summary_out: Option<PathBuf>,
}

/// Build and run the scenario, stopping early once `stop` is raised
fn run_scenario(scenario: &ScenarioConfig, stop: &AtomicBool) -> Result<(RunSummary, Vec<TraceRecord>)> {
    let mut sim = Simulation::from_config(scenario).context("Failed to build the scenario")?;
    let end = scenario.duration();
    let mut until = SimTime::ZERO;
    while until < end {
        if stop.load(Ordering::Relaxed) {
            warn!("Simulation stopped at {}", sim.now());
            break;
        }
        until = (until + RUN_CHUNK).min(end);
        sim.run_until(until);
    }
    Ok((sim.summary(), sim.take_traces()))
}

fn write_traces(records: &[TraceRecord], path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn write_summary(summary: &RunSummary, path: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    match path {
        Some(path) => std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting NR PHY simulator");
    info!("Scenario file: {}", args.config.display());

    let mut scenario = load_scenario(&args.config)?;
    let overrides = Overrides {
        seed: args.seed,
        duration_ms: args.duration_ms,
        no_trace: args.trace_out.is_none(),
    };
    overrides.apply(&mut scenario)?;

    info!(
        "{} gNB(s), {} UE(s), {} ms, seed {}",
        scenario.gnbs.len(),
        scenario.ues.len(),
        scenario.duration_ms,
        scenario.seed
    );

    // The event loop is CPU bound; Ctrl-C only raises the stop flag
    let stop = Arc::new(AtomicBool::new(false));
    let mut handle = {
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || run_scenario(&scenario, &stop))
    };

    let result = tokio::select! {
        result = &mut handle => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            stop.store(true, Ordering::Relaxed);
            handle.await
        }
    };
    let (summary, traces) = result.context("Simulation task failed")??;

    info!(
        "Simulated {:.3} ms: {} events, {} frames transmitted",
        summary.sim_time_ms, summary.events, summary.frames_transmitted
    );

    if let Some(path) = &args.trace_out {
        match write_traces(&traces, path) {
            Ok(()) => info!("Wrote {} trace records to {}", traces.len(), path.display()),
            Err(e) => error!("Error writing traces: {:#}", e),
        }
    }

    write_summary(&summary, args.summary_out.as_deref())?;
    info!("Simulation complete");
    Ok(())
}
