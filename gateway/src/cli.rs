//! # CLI Interface
//!
//! Command-line argument structure for `keel-gateway` using `clap`
//! derive. Four subcommands: `run`, `init`, `status`, and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// KEEL wallet gateway.
///
/// Serves the wallet ledger's operation contracts over HTTP, runs the
/// settlement finalize worker, and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "keel-gateway",
    about = "KEEL wallet ledger gateway",
    version,
    propagate_version = true
)]
pub struct KeelGatewayCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway: API server, metrics, finalize worker.
    Run(RunArgs),
    /// Initialize a data directory and seed default configuration.
    Init(InitArgs),
    /// Query the status endpoint of a running gateway.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Data directory holding the ledger database.
    #[arg(long, short = 'd', env = "KEEL_DATA_DIR", default_value = "~/.keel")]
    pub data_dir: PathBuf,

    /// Port for the REST API.
    #[arg(long, env = "KEEL_API_PORT", default_value_t = 8750)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "KEEL_METRICS_PORT", default_value_t = 8751)]
    pub metrics_port: u16,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "KEEL_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Age in hours after which a pending transaction is considered
    /// stale and swept (cancelled or re-enqueued).
    #[arg(long, env = "KEEL_STALE_AFTER_HOURS", default_value_t = 24)]
    pub stale_after_hours: u64,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "KEEL_DATA_DIR", default_value = "~/.keel")]
    pub data_dir: PathBuf,
}

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Base URL of the running gateway's API.
    #[arg(long, default_value = "http://127.0.0.1:8750")]
    pub api_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        KeelGatewayCli::command().debug_assert();
    }
}
