//! portguard - SDN port-mitigation controller
//!
//! # Usage
//!
//! ```bash
//! portguard --config /etc/portguard/portguard.json
//! portguard --listen 127.0.0.1:6653 --stats-log /var/log/portguard/stats.csv
//! RUST_LOG=portguard_core=debug portguard
//! ```

use anyhow::Context;
use clap::Parser;
use portguard_controller::{CsvEventLog, DaemonConfig, SwitchServer};
use portguard_core::Controller;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Switch events buffered between the listener and the controller
const EVENT_QUEUE: usize = 1024;

#[derive(Parser)]
#[command(name = "portguard")]
#[command(version)]
#[command(
    about = "SDN controller that rate-limits, drops or reroutes traffic per switch port",
    long_about = None
)]
struct Cli {
    /// JSON configuration file
    #[arg(long, short, env = "PORTGUARD_CONFIG", default_value = "/etc/portguard/portguard.json")]
    config: String,

    /// Override the switch channel listen address
    #[arg(long)]
    listen: Option<String>,

    /// Override the CSV telemetry log path
    #[arg(long)]
    stats_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("portguard v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();

    let mut config = if std::path::Path::new(&cli.config).exists() {
        DaemonConfig::load(&cli.config)
            .with_context(|| format!("failed to load config {}", cli.config))?
    } else {
        tracing::warn!(path = %cli.config, "Config not found, using defaults");
        DaemonConfig::default()
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(stats_log) = cli.stats_log {
        config.stats_log_path = stats_log;
    }

    config.validate().context("invalid configuration")?;
    let listen_addr = config.listen_addr()?;

    let oracle = config.policy.build()?;
    let stats_log_path = config.stats_log_path.clone();
    let event_log = CsvEventLog::open(&stats_log_path)
        .with_context(|| format!("failed to open telemetry log {}", stats_log_path.display()))?;

    let controller = Arc::new(Controller::new(
        config.controller.clone(),
        oracle,
        Arc::new(event_log),
    )?);

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = SwitchServer::bind(listen_addr, events_tx)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;

    let server_task = tokio::spawn(server.run(shutdown_rx.clone()));
    let controller_task = tokio::spawn(controller.clone().run(events_rx, shutdown_rx));

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    shutdown_tx.send(true).ok();

    match server_task.await {
        Ok(Err(e)) => tracing::error!(error = %e, "switch server failed"),
        Err(e) => tracing::error!(error = %e, "switch server task panicked"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = controller_task.await {
        tracing::error!(error = %e, "controller task panicked");
    }

    let snapshot = controller.snapshot();
    match serde_json::to_string(&snapshot) {
        Ok(json) => tracing::info!(stats = %json, "portguard stopped"),
        Err(_) => tracing::info!(?snapshot, "portguard stopped"),
    }
    Ok(())
}
