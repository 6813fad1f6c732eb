//! fleetd — the fleet dispatch daemon.
//!
//! Runs a dispatch cycle on every heartbeat until interrupted. Manual
//! `fleet schedule run` invocations can run alongside it; the dispatch lock
//! makes whichever cycle starts second a no-op.
//!
//! # Usage
//!
//! ```text
//! fleetd run --root /srv/fleet --interval 3m
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use fleet_core::FleetConfig;
use fleet_core::config::{find_root, parse_duration};
use fleet_scheduler::{DispatchEngine, Heartbeat};

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet dispatch daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dispatch queued work on a fixed heartbeat.
    Run {
        /// Fleet root (the directory holding fleet.toml).
        #[arg(long, env = "FLEET_ROOT")]
        root: Option<PathBuf>,

        /// Heartbeat interval, e.g. "30s" or "3m". Defaults to
        /// scheduler.heartbeat_interval.
        #[arg(long)]
        interval: Option<String>,

        /// Actor name recorded in the event feed.
        #[arg(long, default_value = "fleetd")]
        actor: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().or_else(|_| {
        tracing_subscriber::EnvFilter::try_new("info,fleetd=debug,fleet_scheduler=debug")
    })?;
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Run {
            root,
            interval,
            actor,
        } => run(root, interval, actor).await,
    }
}

async fn run(root: Option<PathBuf>, interval: Option<String>, actor: String) -> anyhow::Result<()> {
    let root = match root {
        Some(root) => root,
        None => {
            let cwd = std::env::current_dir()?;
            find_root(&cwd).context("no fleet.toml found (set --root or FLEET_ROOT)")?
        }
    };
    let config = Arc::new(FleetConfig::load(&root)?);

    let interval = match interval {
        Some(raw) => parse_duration(&raw).with_context(|| format!("invalid interval {raw:?}"))?,
        None => config.scheduler.heartbeat_interval(),
    };

    info!(root = %root.display(), "fleet daemon starting");

    let engine = Arc::new(DispatchEngine::open(&root, config)?);
    info!(
        governed = engine.governance_enabled(),
        max_workers = engine.settings().max_workers,
        batch_size = engine.settings().batch_size,
        parallelism = engine.settings().parallelism,
        "dispatch engine initialized"
    );

    let heartbeat = Heartbeat::new(engine, interval, &actor);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // First cycle right away, then on every tick.
    let beat_handle = tokio::spawn(async move {
        heartbeat.beat().await;
        heartbeat.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = beat_handle.await;

    info!("fleet daemon stopped");
    Ok(())
}
