// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # KEEL Gateway
//!
//! Entry point for the `keel-gateway` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the ledger, starts the
//! settlement finalize worker, and serves the HTTP API.
//!
//! Subcommands:
//!
//! - `run`     — start the gateway
//! - `init`    — initialize the data directory and seed configuration
//! - `status`  — query a running gateway's status endpoint
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;

use keel_engine::config::ConfigStore;
use keel_engine::ledger::LedgerStore;
use keel_engine::settlement::{DirectRail, SettlementEngine};

use cli::{Commands, KeelGatewayCli};
use logging::LogFormat;
use metrics::GatewayMetrics;

/// How often the background sweep looks for stale pendings.
const SWEEP_INTERVAL_SECS: u64 = 300;

/// How long shutdown waits for the finalize worker to drain.
const WORKER_DRAIN_TIMEOUT_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = KeelGatewayCli::parse();

    match cli.command {
        Commands::Run(args) => run_gateway(args).await,
        Commands::Init(args) => init_gateway(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the full gateway: ledger, engine, finalize worker, API and
/// metrics servers, and the stale-pending sweep.
async fn run_gateway(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "keel_gateway=info,keel_engine=info,tower_http=warn",
        LogFormat::from_str_lossy(&args.log_format),
    );

    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        "starting keel-gateway"
    );

    // --- Ledger storage ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let store = Arc::new(
        LedgerStore::open(&db_path)
            .map_err(|e| anyhow::anyhow!("failed to open ledger at {}: {e}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), "ledger opened");

    // --- Configuration ---
    let config_tree = store
        .open_tree("config")
        .map_err(|e| anyhow::anyhow!("failed to open config tree: {e}"))?;
    let config = Arc::new(ConfigStore::new(config_tree));
    config
        .seed_defaults()
        .map_err(|e| anyhow::anyhow!("failed to seed configuration: {e}"))?;

    // --- Engine + finalize worker ---
    let (engine, worker) = SettlementEngine::new(Arc::clone(&store), config, Arc::new(DirectRail));
    let worker_handle = worker.spawn();

    // --- Metrics ---
    let gateway_metrics = Arc::new(GatewayMetrics::new());

    // --- Application state ---
    let app_state = api::AppState {
        engine: Arc::clone(&engine),
        metrics: Arc::clone(&gateway_metrics),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: chrono::Utc::now(),
    };

    // --- Stale-pending sweep ---
    let sweep_engine = Arc::clone(&engine);
    let stale_after = chrono::Duration::hours(args.stale_after_hours as i64);
    let sweep_loop = tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            match sweep_engine.sweep_stale(stale_after) {
                Ok(report) if report.cancelled_deposits + report.requeued_finalizes > 0 => {
                    tracing::info!(
                        cancelled = report.cancelled_deposits,
                        requeued = report.requeued_finalizes,
                        "stale sweep"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "stale sweep failed"),
            }
        }
    });

    // --- API server ---
    let api_router = api::create_router(app_state.clone());
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {api_addr}"))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(app_state);
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining");
        }
    }

    // Stop feeding the worker, let queued finalizes drain, then go.
    sweep_loop.abort();
    engine.shutdown();
    let drain = tokio::time::timeout(
        std::time::Duration::from_secs(WORKER_DRAIN_TIMEOUT_SECS),
        worker_handle,
    )
    .await;
    if drain.is_err() {
        tracing::warn!("finalize worker did not drain in time; jobs recover on next start");
    }

    tracing::info!("keel-gateway stopped");
    Ok(())
}

/// Initializes the data directory and seeds default configuration.
fn init_gateway(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("keel_gateway=info", LogFormat::Pretty);

    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create data directory: {}", db_path.display()))?;

    let store = LedgerStore::open(&db_path)
        .map_err(|e| anyhow::anyhow!("failed to open ledger at {}: {e}", db_path.display()))?;
    let config = ConfigStore::new(
        store
            .open_tree("config")
            .map_err(|e| anyhow::anyhow!("failed to open config tree: {e}"))?,
    );
    config
        .seed_defaults()
        .map_err(|e| anyhow::anyhow!("failed to seed configuration: {e}"))?;

    let rates = config.rates();
    println!("Gateway initialized.");
    println!("  Data directory     : {}", args.data_dir.display());
    println!("  Deposit commission : {} bps", rates.deposit_commission_bps);
    println!(
        "  Exchange rate      : {} (THB per KEL, x1e-4)",
        rates.thb_per_kel
    );
    println!("  Receiving accounts : {}", config.pool().accounts.len());
    Ok(())
}

/// Queries a running gateway's status endpoint and prints the body.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.api_url.trim_end_matches('/'));
    let body = http_get(&url).await?;
    println!("{}", body);
    Ok(())
}

/// Minimal HTTP/1.1 GET over a raw TCP stream. Enough for the status
/// subcommand without pulling a client library into the binary.
async fn http_get(url: &str) -> Result<String> {
    let (host, port, path) = split_url(url)?;
    let addr = format!("{host}:{port}");
    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);

    // Everything after the first blank line is the body.
    Ok(response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_else(|| response.to_string()))
}

/// Splits `http://host[:port]/path` into its parts. Port defaults to 80,
/// path to `/`.
fn split_url(url: &str) -> Result<(String, u16, String)> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], rest[i..].to_string()),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse::<u16>()
                .with_context(|| format!("invalid port in URL: {p}"))?,
        ),
        None => (authority.to_string(), 80),
    };
    if host.is_empty() {
        anyhow::bail!("missing host in URL: {url}");
    }
    Ok((host, port, path))
}

/// Prints version information to stdout.
fn print_version() {
    println!("keel-gateway {}", env!("CARGO_PKG_VERSION"));
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_url_variants() {
        assert_eq!(
            split_url("http://127.0.0.1:8750/status").unwrap(),
            ("127.0.0.1".to_string(), 8750, "/status".to_string())
        );
        assert_eq!(
            split_url("http://localhost/health").unwrap(),
            ("localhost".to_string(), 80, "/health".to_string())
        );
        assert_eq!(
            split_url("example.com:9000").unwrap(),
            ("example.com".to_string(), 9000, "/".to_string())
        );
        assert!(split_url("http://:80/x").is_err());
        assert!(split_url("http://host:notaport/x").is_err());
    }
}
