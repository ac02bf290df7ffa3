use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::clock::SystemClock;
use turnstile::config::{EngineConfig, FileConfigProvider};
use turnstile::engine::Engine;
use turnstile::gateway::DryRunGateway;

#[derive(Parser)]
#[command(name = "turnstile-sweeper")]
#[command(about = "Turnstile subscription sweep daemon (development)", long_about = None)]
struct Args {
    /// Data directory
    #[arg(long, default_value = "./turnstile-data")]
    data_dir: PathBuf,

    /// Engine config file (defaults to <data-dir>/config.json, created with
    /// defaults if missing)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "turnstile=debug" (overrides RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match &args.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("create data dir {}", args.data_dir.display()))?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.data_dir.join("config.json"));
    let provider = FileConfigProvider::new(&config_path);
    if !config_path.exists() {
        provider
            .write(&EngineConfig::default())
            .context("write default config")?;
        info!(path = %config_path.display(), "wrote default config");
    }

    let engine = Engine::open(
        &args.data_dir,
        Arc::new(SystemClock),
        Arc::new(DryRunGateway),
        Arc::new(provider),
    )?;

    let mut scheduler = engine.scheduler();
    scheduler.start();
    info!(data_dir = %args.data_dir.display(), "turnstile-sweeper running, ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    scheduler.stop().await;

    let summary = engine.summary();
    info!(
        memberships_active = summary.memberships_active,
        admissions_pending = summary.admissions_pending,
        "final state"
    );
    Ok(())
}
