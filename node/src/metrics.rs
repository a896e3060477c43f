//! # Prometheus Metrics
//!
//! Operational metrics for the gateway, scraped at `/metrics` on the
//! configured metrics port. Values are refreshed from the block parser
//! status and the notification scheduler at scrape time, so the pipeline
//! itself never touches Prometheus types.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] under the
//! `mapi` namespace.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

use mapi_gateway::chain::{BlockParserStatus, BlockParserStatusSnapshot};
use mapi_gateway::notification::NotificationScheduler;

/// Prometheus handles for every exported gauge.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    pub blocks_processed: IntGauge,
    pub blocks_parsed: IntGauge,
    pub blocks_duplicated: IntGauge,
    pub block_parser_errors: IntGauge,
    pub blocks_queued: IntGauge,
    pub txs_found: IntGauge,
    pub double_spends_found: IntGauge,
    pub best_block_height: IntGauge,
    pub average_parse_time_ms: Gauge,
    pub block_download_speed_mib_s: Gauge,
    pub notifications_fast_queued: IntGauge,
    pub notifications_slow_queued: IntGauge,
    pub slow_callback_hosts: IntGauge,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> Result<C, prometheus::Error> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl GatewayMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("mapi".into()), None)?;
        let int = |name: &str, help: &str| IntGauge::new(name, help).and_then(|g| register(&registry, g));
        let float = |name: &str, help: &str| Gauge::new(name, help).and_then(|g| register(&registry, g));

        Ok(Self {
            blocks_processed: int("blocks_processed", "Blocks taken off the parser queue")?,
            blocks_parsed: int("blocks_parsed", "Blocks fully parsed")?,
            blocks_duplicated: int("blocks_duplicated", "Announced blocks that were already parsed")?,
            block_parser_errors: int("block_parser_errors", "Block parse attempts that failed")?,
            blocks_queued: int("blocks_queued", "Blocks waiting in the parser queue")?,
            txs_found: int("txs_found", "Tracked transactions found in parsed blocks")?,
            double_spends_found: int("double_spends_found", "Double spends found in parsed blocks")?,
            best_block_height: int("best_block_height", "Height of the best parsed block")?,
            average_parse_time_ms: float("average_parse_time_ms", "Average block parse time in milliseconds")?,
            block_download_speed_mib_s: float(
                "block_download_speed_mib_s",
                "Average block download speed in MiB/s",
            )?,
            notifications_fast_queued: int(
                "notifications_fast_queued",
                "Callbacks queued for fast hosts",
            )?,
            notifications_slow_queued: int(
                "notifications_slow_queued",
                "Callbacks queued for slow hosts",
            )?,
            slow_callback_hosts: int("slow_callback_hosts", "Callback hosts currently classified slow")?,
            registry,
        })
    }

    /// Copy the current pipeline state into the gauges.
    pub fn refresh(&self, parser: &BlockParserStatusSnapshot, scheduler: &NotificationScheduler) {
        self.blocks_processed.set(parser.blocks_processed as i64);
        self.blocks_parsed.set(parser.blocks_parsed as i64);
        self.blocks_duplicated.set(parser.blocks_duplicated as i64);
        self.block_parser_errors.set(parser.num_of_errors as i64);
        self.blocks_queued.set(parser.blocks_queued as i64);
        self.txs_found.set(parser.total_txs_found as i64);
        self.double_spends_found.set(parser.total_ds_found as i64);
        self.best_block_height
            .set(parser.best_block_height.map(|h| h as i64).unwrap_or(0));
        self.average_parse_time_ms.set(parser.average_parse_time_ms);
        self.block_download_speed_mib_s
            .set(parser.average_block_download_speed_mib_s);
        self.notifications_fast_queued.set(scheduler.fast_len() as i64);
        self.notifications_slow_queued.set(scheduler.slow_len() as i64);
        self.slow_callback_hosts
            .set(scheduler.latency().get_hosts(true).len() as i64);
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// What the `/metrics` handler reads from.
#[derive(Clone)]
pub struct MetricsState {
    pub metrics: Arc<GatewayMetrics>,
    pub parser: Arc<BlockParserStatus>,
    pub scheduler: Arc<NotificationScheduler>,
}

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    state.metrics.refresh(&state.parser.snapshot(), &state.scheduler);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
