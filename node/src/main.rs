// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # mAPI Gateway Node
//!
//! Entry point for the `mapi-node` binary. Parses CLI arguments, loads the
//! configuration, initializes logging and metrics, wires the gateway
//! pipeline to its HTTP peers and subscribers, and serves the operator API.
//!
//! The binary supports four subcommands:
//!
//! - `run`     start the gateway
//! - `init`    create the data directory, config and callback signing key
//! - `status`  query a running gateway's `/status` endpoint
//! - `version` print build version information

mod api;
mod cli;
mod http;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};

use mapi_gateway::chain::{BlockParser, BlockParserStatus};
use mapi_gateway::cleanup::CleanUpTask;
use mapi_gateway::config::{GatewayConfig, CALLBACK_API_VERSION};
use mapi_gateway::crypto::CallbackSigner;
use mapi_gateway::discovery::{BestBlockPoller, EventRouter};
use mapi_gateway::mempool::MempoolChecker;
use mapi_gateway::notification::{HostLatencyTracker, NotificationDispatcher, NotificationScheduler};
use mapi_gateway::rpc::{NodeRepository, PeerRpc, RpcMultiClient};
use mapi_gateway::storage::{GatewayDb, TxStore};

use cli::{Commands, MapiNodeCli};
use logging::LogFormat;
use metrics::GatewayMetrics;

const CONFIG_FILE: &str = "config.toml";
const KEY_FILE: &str = "callback.key";
const NODES_TREE: &str = "nodes";

/// Capacity of the discovery event channel. Announcements beyond this wait
/// for the router to catch up.
const DISCOVERY_CHANNEL_CAPACITY: usize = 1024;

/// How long background tasks get to finish after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = MapiNodeCli::parse();

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

/// Starts the full gateway: pipeline tasks, API server and metrics endpoint.
async fn run_gateway(args: cli::RunArgs) -> Result<()> {
    let data_dir = expand_home(&args.data_dir);
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE));
    let config = if config_path.exists() {
        GatewayConfig::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        GatewayConfig::default()
    };

    logging::init_logging(
        &config.logging.level,
        LogFormat::from_str_lossy(&config.logging.format),
    );
    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %data_dir.display(),
        config = %config_path.display(),
        "starting mapi-node"
    );

    // --- Persistent storage ---
    let db_path = data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = GatewayDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let store: Arc<dyn TxStore> = Arc::new(db.clone());
    tracing::info!(path = %db_path.display(), blocks = db.block_count(), txs = db.tx_count(), "database opened");

    // --- Peers ---
    let nodes = Arc::new(
        NodeRepository::open(db.open_tree(NODES_TREE)?).context("failed to load node registry")?,
    );
    if nodes.is_empty() {
        tracing::warn!("no peer nodes registered; add one with POST /nodes");
    }
    let http_client = http::build_client().context("failed to build HTTP client")?;
    let rpc: Arc<dyn PeerRpc> = Arc::new(RpcMultiClient::new(
        Arc::clone(&nodes),
        Arc::new(http::JsonRpcConnector::new(http_client.clone())),
        config.rpc.request_timeout(),
    ));

    // --- Notifications ---
    let signer = load_signer(args.callback_key.as_deref(), &data_dir)?;
    tracing::info!(public_key = %signer.public_key_hex(), "callback signing key loaded");
    let latency = Arc::new(HostLatencyTracker::new(
        config.notifications.saved_execution_times,
        config.notifications.slow_host_threshold_ms,
    ));
    let scheduler = Arc::new(NotificationScheduler::new(&config.notifications, latency));
    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::clone(&store),
        Arc::clone(&scheduler),
        Arc::new(http::HttpCallbackTransport::new(http_client)),
        signer,
        config.notifications.clone(),
    ));

    // --- Pipeline ---
    let status = Arc::new(BlockParserStatus::new());
    let parser = Arc::new(BlockParser::new(
        Arc::clone(&store),
        Arc::clone(&rpc),
        Arc::clone(&scheduler),
        Arc::clone(&status),
        &config,
    ));
    let checker = Arc::new(MempoolChecker::new(
        Arc::clone(&store),
        Arc::clone(&rpc),
        Arc::clone(&status),
        &config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = dispatcher.spawn(shutdown_rx.clone());

    if config.block_parser.dont_parse_blocks {
        tracing::warn!("block parsing disabled; mempool checking is disabled with it");
    } else {
        match parser.recover().await {
            Ok(queued) => tracing::info!(queued, "block parser recovered"),
            Err(e) => tracing::warn!(error = %e, "block parser recovery failed"),
        }
        tasks.push(tokio::spawn(Arc::clone(&parser).run(shutdown_rx.clone())));
    }
    tasks.push(tokio::spawn(Arc::clone(&checker).run(shutdown_rx.clone())));

    let (events_tx, events_rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);
    let router = EventRouter::new(Arc::clone(&parser), Arc::clone(&checker));
    tasks.push(tokio::spawn(router.run(events_rx, shutdown_rx.clone())));
    if !config.block_parser.dont_parse_blocks && config.block_parser.best_block_poll_interval_sec > 0 {
        let poller = BestBlockPoller::new(
            Arc::clone(&rpc),
            Duration::from_secs(config.block_parser.best_block_poll_interval_sec),
            config.rpc.request_timeout(),
        );
        tasks.push(tokio::spawn(poller.run(events_tx, shutdown_rx.clone())));
    } else {
        drop(events_tx);
    }

    let clean_up = CleanUpTask::new(Arc::clone(&store), config.clean_up.clone());
    tasks.push(tokio::spawn(clean_up.run(shutdown_rx.clone())));

    // --- API server ---
    let app_state = api::AppState {
        version: format!("{} (callbacks {})", env!("CARGO_PKG_VERSION"), CALLBACK_API_VERSION),
        parser: Arc::clone(&status),
        scheduler: Arc::clone(&scheduler),
        nodes: Arc::clone(&nodes),
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!(addr = %api_addr, "API server listening");

    // --- Metrics server ---
    let metrics_state = metrics::MetricsState {
        metrics: Arc::new(GatewayMetrics::new().context("failed to register metrics")?),
        parser: Arc::clone(&status),
        scheduler: Arc::clone(&scheduler),
    };
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(metrics_state);
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!(addr = %metrics_addr, "metrics server listening");

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, stopping pipeline");
        }
    }

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        tracing::warn!(grace = ?SHUTDOWN_GRACE, "background tasks did not stop in time");
    }
    db.flush().context("failed to flush database")?;
    tracing::info!("mapi-node stopped");
    Ok(())
}

/// Creates the data directory, a default config file and a callback
/// signing key.
fn init_gateway(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("mapi_node=info", LogFormat::Pretty);

    let data_dir = expand_home(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let config_path = data_dir.join(CONFIG_FILE);
    let key_path = data_dir.join(KEY_FILE);
    if !args.force && (config_path.exists() || key_path.exists()) {
        bail!(
            "{} is already initialized; pass --force to overwrite",
            data_dir.display()
        );
    }

    let config = toml::to_string_pretty(&GatewayConfig::default()).context("failed to render default config")?;
    std::fs::write(&config_path, config)
        .with_context(|| format!("failed to write config to {}", config_path.display()))?;

    let signer = CallbackSigner::generate();
    std::fs::write(&key_path, signer.secret_hex())
        .with_context(|| format!("failed to write callback key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(
        public_key = %signer.public_key_hex(),
        key_path = %key_path.display(),
        "callback signing key generated"
    );

    println!("Gateway initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", config_path.display());
    println!("  Callback key   : {}", key_path.display());
    println!("  Public key     : {}", signer.public_key_hex());

    Ok(())
}

/// Queries a running gateway's status endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.api_url.trim_end_matches('/'));
    let (status, body) = http::get_text(&url)
        .await
        .with_context(|| format!("failed to query {}", url))?;
    if status != 200 {
        bail!("{} answered HTTP {}: {}", url, status, body);
    }
    println!("{}", body);
    Ok(())
}

/// The key passed on the command line wins over the key file.
fn load_signer(flag: Option<&str>, data_dir: &Path) -> Result<CallbackSigner> {
    if let Some(secret) = flag {
        return CallbackSigner::from_hex(secret.trim()).context("invalid --callback-key");
    }
    let key_path = data_dir.join(KEY_FILE);
    let secret = std::fs::read_to_string(&key_path).with_context(|| {
        format!(
            "failed to read callback key from {} (run `mapi-node init` first)",
            key_path.display()
        )
    })?;
    CallbackSigner::from_hex(secret.trim())
        .with_context(|| format!("invalid callback key in {}", key_path.display()))
}

/// Expands a leading `~/` using `$HOME`.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

fn print_version() {
    println!("mapi-node {}", env!("CARGO_PKG_VERSION"));
    println!("callbacks {}", CALLBACK_API_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
