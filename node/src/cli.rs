//! # CLI Interface
//!
//! Defines the command-line argument structure for `mapi-node` using
//! `clap` derive. Supports four subcommands: `run`, `init`, `status`,
//! and `version`.

use clap::{Parser, Subcommand};
use mapi_gateway::config::{DEFAULT_API_PORT, DEFAULT_METRICS_PORT};
use std::path::PathBuf;

/// Merchant API gateway node.
///
/// Tracks the best chain across the registered peer nodes, keeps submitted
/// transactions alive in their mempools and delivers signed callbacks to
/// subscribers.
#[derive(Parser, Debug)]
#[command(
    name = "mapi-node",
    about = "Merchant API gateway node",
    version,
    propagate_version = true
)]
pub struct MapiNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gateway.
    Run(RunArgs),
    /// Create the data directory, a default config and a callback signing key.
    Init(InitArgs),
    /// Query the block parser status of a running gateway.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the gateway configuration file (TOML).
    ///
    /// When omitted, the gateway looks for `config.toml` in the data directory.
    #[arg(long, short = 'c', env = "MAPI_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the database and the callback signing key.
    #[arg(long, short = 'd', env = "MAPI_DATA_DIR", default_value = "~/.mapi")]
    pub data_dir: PathBuf,

    /// Port for the status and node administration API.
    #[arg(long, env = "MAPI_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "MAPI_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Hex-encoded Ed25519 seed used to sign callbacks.
    ///
    /// If not provided, the key is read from `callback.key` in the data directory.
    #[arg(long, env = "MAPI_CALLBACK_KEY")]
    pub callback_key: Option<String>,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    #[arg(long, short = 'd', env = "MAPI_DATA_DIR", default_value = "~/.mapi")]
    pub data_dir: PathBuf,

    /// Overwrite an existing config and key.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// API endpoint of the running gateway.
    #[arg(long, default_value = "http://127.0.0.1:5051")]
    pub api_url: String,
}
