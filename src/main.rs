#![allow(missing_docs)]

//! Sweetlink CLI entry point.
//!
//! `start` runs the bridge server until interrupted; `status` finds a
//! running bridge over its plain-HTTP discovery endpoint and prints the
//! discovery document.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use sweetlink::bridge::Bridge;
use sweetlink::config::{BridgeConfig, DEFAULT_APP_PORT, PORT_OFFSET};
use sweetlink::logging;

/// App ports commonly used by dev servers, probed by `status` after the
/// configured port range comes up empty.
const COMMON_APP_PORTS: [u16; 7] = [3000, 3001, 4000, 5173, 5174, 8000, 8080];

/// Ports probed past the derived one before falling back to common ports.
const STATUS_SCAN_RANGE: u16 = 10;

/// Per-port probe budget for `status`.
const STATUS_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Sweetlink — localhost development bridge.
#[derive(Parser)]
#[command(name = "sweetlink", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the bridge server until interrupted.
    Start {
        /// WebSocket port. Defaults to app port + 6223.
        #[arg(long)]
        port: Option<u16>,
        /// The consuming application's HTTP port.
        #[arg(long)]
        app_port: Option<u16>,
    },
    /// Find a running bridge and print its discovery document.
    Status {
        /// The consuming application's HTTP port to derive the scan from.
        #[arg(long)]
        app_port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Start { port, app_port } => handle_start(port, app_port).await,
        Command::Status { app_port } => handle_status(app_port).await,
    }
}

/// Run the bridge server.
async fn handle_start(port: Option<u16>, app_port: Option<u16>) -> anyhow::Result<()> {
    let mut config = BridgeConfig::load()?;
    if let Some(port) = port {
        config.server.port = Some(port);
    }
    if let Some(app_port) = app_port {
        config.server.app_port = app_port;
    }

    let _guard = logging::init_bridge(Path::new(".sweetlink/logs"))?;

    let bridge = Bridge::start(config).await?;
    info!(port = bridge.port(), "sweetlink bridge ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    bridge.close().await;
    Ok(())
}

/// Probe candidate ports for a live bridge and print its discovery document.
async fn handle_status(app_port: Option<u16>) -> anyhow::Result<()> {
    logging::init_cli();
    let app_port = app_port.unwrap_or(DEFAULT_APP_PORT);

    let client = reqwest::Client::builder()
        .timeout(STATUS_PROBE_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;

    for port in discovery_candidates(app_port) {
        let url = format!("http://127.0.0.1:{port}/");
        let Ok(response) = client.get(&url).send().await else {
            continue;
        };
        if !response.status().is_success() {
            continue;
        }
        let Ok(doc) = response.json::<serde_json::Value>().await else {
            continue;
        };
        if doc.get("name").and_then(|v| v.as_str()) == Some("sweetlink") {
            println!("{}", serde_json::to_string_pretty(&doc)?);
            return Ok(());
        }
    }

    anyhow::bail!("no running bridge found")
}

/// The derived port plus its scan range, then the common app-port offsets.
fn discovery_candidates(app_port: u16) -> Vec<u16> {
    let mut candidates = Vec::new();
    let base = app_port.saturating_add(PORT_OFFSET);
    for step in 0..=STATUS_SCAN_RANGE {
        candidates.push(base.saturating_add(step));
    }
    for common in COMMON_APP_PORTS {
        let derived = common.saturating_add(PORT_OFFSET);
        if !candidates.contains(&derived) {
            candidates.push(derived);
        }
    }
    candidates
}
