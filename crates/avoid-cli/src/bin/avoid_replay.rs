//! Replay a recorded surveillance scenario through the deconfliction engine.
//!
//! Usage:
//!   cargo run -p avoid-cli --bin avoid-replay -- --scenario demos/crossing.json
//!   cargo run -p avoid-cli --bin avoid-replay -- --scenario demos/crossing.json --realtime --json

use anyhow::Result;
use avoid_cli::{replay_inline, replay_realtime, ReplayLine, Scenario};
use avoid_core::{AvoidanceRules, TickReport, TickStatus};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario file (JSON)
    #[arg(long)]
    scenario: PathBuf,

    /// Avoidance rules file (JSON); defaults come from AVOID_* variables
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Ingest frames on a separate task and tick on the wall clock
    #[arg(long)]
    realtime: bool,

    /// Emit one JSON object per tick instead of text
    #[arg(long)]
    json: bool,
}

fn print_tick(report: &TickReport, json: bool) -> Result<()> {
    let line = ReplayLine::new(report);
    if json {
        println!("{}", serde_json::to_string(&line)?);
    } else if report.status != TickStatus::Skipped {
        println!("{}", line.describe());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("avoid_cli=info".parse()?)
                .add_directive("avoid_core=info".parse()?)
                .add_directive("avoid_replay=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let scenario = Scenario::load(&args.scenario)?;
    let rules = match &args.rules {
        Some(path) => AvoidanceRules::from_json_file(path)?,
        None => AvoidanceRules::from_env(),
    };
    rules.validate()?;

    tracing::info!(
        scenario = scenario.label(),
        own_id = scenario.own_id,
        frames = scenario.frames.len(),
        tick_ms = scenario.tick_ms,
        realtime = args.realtime,
        "starting replay"
    );

    let json = args.json;
    let summary = if args.realtime {
        replay_realtime(&scenario, rules, |report| print_tick(report, json)).await?
    } else {
        replay_inline(&scenario, rules, |report| print_tick(report, json))?
    };

    if !json {
        println!(
            "{} ticks: {} recomputed, {} skipped, {} degraded, {} layer changes",
            summary.ticks, summary.recomputed, summary.skipped, summary.degraded, summary.layer_changes
        );
    }
    Ok(())
}
