use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rchat_core::{ArqConfig, LinkConfig};
use rchat_simulator::{Command, SimulationReport, Simulator, file_content, scenario_runner};

#[derive(Parser, Debug)]
#[command(author, version, about = "Deterministic simulator for the reliable chat client")]
struct Args {
    /// Load a scenario from disk.
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// TOML file with `[arq]` and `[link]` tables applied before scenario overrides.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulated time for the default demo run.
    #[arg(long, default_value_t = 30_000)]
    duration_ms: u64,

    /// Override the link RNG seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Write a JSON trace of the finished simulation.
    #[arg(long)]
    trace_out: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
struct ConfigFile {
    #[serde(default)]
    arq: ArqConfig,
    #[serde(default)]
    link: LinkConfig,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();
    info!("rchat-sim-cli starting…");

    let ConfigFile { arq, mut link } = match &args.config {
        Some(path) => load_config(path)?,
        None => ConfigFile::default(),
    };
    if let Some(seed) = args.seed {
        link.seed = seed;
    }

    let report = if let Some(path) = &args.scenario {
        let scenario = scenario_runner::load_scenario(path)?;
        scenario_runner::run_scenario(&scenario, arq, link)?
    } else {
        run_default_sim(arq, link, args.duration_ms)?
    };

    for client in &report.clients {
        info!(
            "{}: {} transmissions ({} retransmitted), {} received, {} failed",
            client.user,
            client.stats.transmissions,
            client.stats.retransmissions,
            client.received.len(),
            client.failed_seqs.len()
        );
    }

    if let Some(trace_path) = &args.trace_out {
        write_trace(trace_path, &report)?;
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run_default_sim(arq: ArqConfig, link: LinkConfig, duration_ms: u64) -> Result<SimulationReport> {
    let mut sim = build_default_sim(arq, link)?;
    info!("Starting default headless simulation…");
    sim.run_until(duration_ms);
    sim.shutdown();
    info!("Simulation complete.");
    Ok(sim.export_report())
}

fn build_default_sim(arq: ArqConfig, link: LinkConfig) -> Result<Simulator> {
    let link = LinkConfig {
        loss_rate: if link.loss_rate > 0.0 { link.loss_rate } else { 0.1 },
        ..link
    };
    let mut sim = Simulator::new(arq, link);
    sim.add_client("alice").context("Failed to connect alice")?;
    sim.add_client("bob").context("Failed to connect bob")?;

    for (i, time) in [1000u64, 2000, 3000].into_iter().enumerate() {
        sim.schedule_command(
            time,
            "alice",
            Command::SendText {
                to: "bob".into(),
                text: format!("Message {}", i + 1),
            },
        );
    }
    sim.schedule_command(
        4000,
        "bob",
        Command::SendFile {
            to: "alice".into(),
            file_name: "photo.bin".into(),
            bytes: file_content(150 * 1024),
        },
    );
    Ok(sim)
}

fn load_config(path: &Path) -> Result<ConfigFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&content).context("Failed to parse config file")
}

fn write_trace(path: &Path, report: &SimulationReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize simulation trace")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write trace file {}", path.display()))?;
    Ok(())
}
