use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

use costate_core::catalog::{CatalogResolver, StaticCatalog};
use costate_core::cli::{Cli, Command, PlanArgs, ReplayArgs};
use costate_core::config::SyncConfig;
use costate_core::replay::{self, Scenario};
use costate_core::telemetry::logging;
use costate_core::transport::{encode_chunk, split_payload};
use costate_core::metrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialize logging")?;
    let config = SyncConfig::from_env();

    match cli.command {
        Command::Replay(args) => run_replay(args, config).await,
        Command::Plan(args) => run_plan(args, config),
    }
}

async fn run_replay(args: ReplayArgs, config: SyncConfig) -> Result<()> {
    let raw = fs::read_to_string(&args.scenario)
        .with_context(|| format!("failed to read scenario {}", args.scenario.display()))?;
    let scenario = Scenario::from_json_str(&raw)
        .with_context(|| format!("invalid scenario {}", args.scenario.display()))?;
    let catalog: Arc<dyn CatalogResolver> = match &args.catalog {
        Some(path) => Arc::new(StaticCatalog::from_path(path)?),
        None => Arc::new(StaticCatalog::empty()),
    };

    let report = replay::run(
        &scenario,
        catalog,
        config,
        Duration::from_millis(args.settle_ms),
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if args.metrics {
        print!("{}", metrics::gather_text());
    }
    if !report.converged {
        anyhow::bail!("replicas did not converge within {} ms", args.settle_ms);
    }
    Ok(())
}

fn run_plan(args: PlanArgs, config: SyncConfig) -> Result<()> {
    let payload = fs::read_to_string(&args.payload)
        .with_context(|| format!("failed to read payload {}", args.payload.display()))?;
    let chunk = config.chunk;
    if !chunk.needs_chunking(&payload) {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "bytes": payload.len(),
                "singleShot": true,
                "fragments": 1,
            }))?
        );
        return Ok(());
    }

    let fragments = split_payload(&payload, "00000000-0000-4000-8000-000000000000", &chunk)?;
    let mut largest = 0;
    for fragment in &fragments {
        largest = largest.max(encode_chunk(fragment)?.len());
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "bytes": payload.len(),
            "singleShot": false,
            "fragments": fragments.len(),
            "fragmentBudget": chunk.fragment_budget(),
            "largestSignalBytes": largest,
            "maxSignalBytes": chunk.max_signal_bytes,
        }))?
    );
    Ok(())
}
