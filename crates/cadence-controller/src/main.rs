use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use cadence_core::CadenceConfig;
use cadence_scheduler::{
    CronSchedule, MemoryStore, ReconcileController, ReconcileDriver, ReconcileOptions, SystemClock,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

mod manifest;

/// Cadence controller: launches executions for cron schedules.
#[derive(Parser)]
#[command(name = "cadence-controller")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load schedules and reconcile them until Ctrl-C.
    Run {
        /// Configuration file path
        #[arg(short, long, env = "CADENCE_CONFIG")]
        config: Option<String>,

        /// JSON file with schedule resources; overrides `manifest.path`
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },
    /// Print the next occurrences of a cron expression.
    Next {
        /// Cron expression, descriptor or `@every <duration>`
        #[arg(short, long)]
        schedule: String,

        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,

        /// Start from this RFC 3339 instant instead of now
        #[arg(long)]
        from: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Run { config, manifest } => run(config.as_deref(), manifest).await,
        Command::Next {
            schedule,
            count,
            from,
        } => next(&schedule, count, from),
    }
}

async fn run(config_path: Option<&str>, manifest_path: Option<PathBuf>) -> anyhow::Result<()> {
    // a broken config file still gets logging with the default filter
    let loaded = CadenceConfig::load(config_path);
    let default_filter = loaded
        .as_ref()
        .map(|c| c.logging.filter_or_default().to_string())
        .unwrap_or_else(|_| cadence_core::config::DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config = loaded.unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let store = Arc::new(MemoryStore::new());
    let manifest_path = manifest_path.or_else(|| config.manifest.path.as_ref().map(PathBuf::from));
    match &manifest_path {
        Some(path) => {
            let resources = manifest::load(path)
                .with_context(|| format!("loading manifest {}", path.display()))?;
            let count = manifest::seed(&store, resources);
            info!(path = %path.display(), count, "manifest loaded");
        }
        None => warn!("no manifest configured, starting with an empty store"),
    }

    let controller = Arc::new(ReconcileController::new(
        store.clone(),
        Arc::new(SystemClock),
        ReconcileOptions::from(&config.controller),
    ));
    let driver = ReconcileDriver::new(controller, &config).with_events(store.subscribe());
    for key in store.schedule_keys() {
        driver.enqueue(key);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let running = tokio::spawn(driver.run(shutdown_rx));
    info!(
        workers = config.controller.workers,
        annotation = %config.controller.scheduled_at_annotation(),
        "Cadence controller running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");

    // signal the driver to stop
    let _ = shutdown_tx.send(true);
    running.await.context("driver task failed")?;
    Ok(())
}

fn next(expression: &str, count: usize, from: Option<DateTime<Utc>>) -> anyhow::Result<()> {
    let schedule = CronSchedule::parse(expression)?;
    let from = from.unwrap_or_else(Utc::now);
    let upcoming = schedule.upcoming(from, count);
    if upcoming.is_empty() {
        anyhow::bail!("{expression:?} has no occurrences after {from}");
    }
    for t in upcoming {
        println!("{}", t.to_rfc3339());
    }
    Ok(())
}
