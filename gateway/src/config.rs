//! # Gateway Configuration & Constants
//!
//! Every tunable of the pipeline lives here, grouped by the subsystem that
//! reads it. `GatewayConfig` deserializes from TOML with every field
//! optional; anything missing falls back to the defaults below.
//!
//! ```toml
//! [block_parser]
//! max_block_chain_length_for_fork = 20
//!
//! [mempool_checker]
//! interval_sec = 60
//! missing_inputs_retries = 5
//!
//! [notifications]
//! slow_host_threshold_ms = 1000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Callback payload API version reported in every envelope.
pub const CALLBACK_API_VERSION: &str = "1.5.0";

/// One mebibyte. Download speed is reported in MiB/s.
pub const MIB: u64 = 1024 * 1024;

/// Default ceiling on a single block download. Blocks on BSV-style networks
/// routinely exceed the 4 GiB mark, so the ceiling is well above `u32`.
pub const DEFAULT_MAX_BLOCK_SIZE: u64 = 8 * 1024 * 1024 * 1024;

/// Default listening port for the status / administration API.
pub const DEFAULT_API_PORT: u16 = 5051;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 5052;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Chain tracker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockParserConfig {
    /// Disable block parsing entirely. Also disables the mempool checker.
    pub dont_parse_blocks: bool,
    /// How many ancestors a reorg may walk back and re-flip.
    pub max_block_chain_length_for_fork: u32,
    /// Upper bound on a streamed block download, in bytes.
    pub max_block_size: u64,
    /// Interval of the best-block polling fallback. Zero disables polling.
    pub best_block_poll_interval_sec: u64,
}

impl Default for BlockParserConfig {
    fn default() -> Self {
        Self {
            dont_parse_blocks: false,
            max_block_chain_length_for_fork: 20,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            best_block_poll_interval_sec: 30,
        }
    }
}

/// Mempool checker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolCheckerConfig {
    pub disabled: bool,
    /// Period between successful passes.
    pub interval_sec: u64,
    /// Period after a pass that returned `false`.
    pub unsuccessful_interval_sec: u64,
    /// Passes are skipped while the block parser backlog exceeds this.
    pub block_parser_queued_max: u64,
    /// Missing-inputs failures tolerated before giving up on a transaction.
    pub missing_inputs_retries: u32,
    /// Transactions per `sendrawtransactions` batch.
    pub resubmit_batch_size: usize,
    /// Transactions submitted more recently than this are not considered
    /// missing yet; peers may still be propagating them.
    pub resubmit_min_age_sec: u64,
    /// Refresh `submitted_at` when a peer reports the tx as already known.
    pub refresh_already_known: bool,
}

impl Default for MempoolCheckerConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            interval_sec: 60,
            unsuccessful_interval_sec: 10,
            block_parser_queued_max: 2,
            missing_inputs_retries: 5,
            resubmit_batch_size: 1000,
            resubmit_min_age_sec: 60,
            refresh_already_known: true,
        }
    }
}

/// Notification scheduler and dispatcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Period of the sweep that re-enqueues unsent notifications.
    pub notification_interval_sec: u64,
    /// Workers pulling from the fast channel.
    pub instant_notification_workers: usize,
    /// Workers pulling from the slow channel.
    pub slow_notification_workers: usize,
    /// Bound on overall queued notifications.
    pub max_notification_queue_size: usize,
    /// Bound on the slow channel.
    pub max_slow_notification_size: usize,
    /// Items handed to a worker per `take`.
    pub max_notifications_in_batch: usize,
    /// Average latency above which a host is classified slow.
    pub slow_host_threshold_ms: u64,
    /// Latency samples kept per host.
    pub saved_execution_times: usize,
    /// Delivery attempts before a notification is abandoned.
    pub notifications_retry_count: u32,
    pub fast_host_timeout_ms: u64,
    pub slow_host_timeout_ms: u64,
    /// Rows fetched per page by the merkle-proof sweep.
    pub sweep_page_size: usize,
    /// Depth bound on the double-spend descendant walk.
    pub max_descendant_depth: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            notification_interval_sec: 60,
            instant_notification_workers: 2,
            slow_notification_workers: 1,
            max_notification_queue_size: 1000,
            max_slow_notification_size: 100,
            max_notifications_in_batch: 100,
            slow_host_threshold_ms: 1000,
            saved_execution_times: 10,
            notifications_retry_count: 10,
            fast_host_timeout_ms: 1000,
            slow_host_timeout_ms: 10_000,
            sweep_page_size: 1000,
            max_descendant_depth: 100,
        }
    }
}

/// Peer RPC settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Timeout for a single peer request.
    pub request_timeout_sec: u64,
    /// Timeout for a full block download.
    pub block_download_timeout_sec: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_sec: 30,
            block_download_timeout_sec: 600,
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    pub fn block_download_timeout(&self) -> Duration {
        Duration::from_secs(self.block_download_timeout_sec)
    }
}

/// Row retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanUpConfig {
    /// Confirmed transactions and blocks older than this are deleted.
    pub clean_up_tx_after_days: u32,
    /// Never-confirmed transactions older than this are deleted.
    pub clean_up_tx_after_mempool_expired_days: u32,
    pub interval_sec: u64,
}

impl Default for CleanUpConfig {
    fn default() -> Self {
        Self {
            clean_up_tx_after_days: 3,
            clean_up_tx_after_mempool_expired_days: 14,
            interval_sec: 3600,
        }
    }
}

/// Log output settings consumed by the binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `pretty` or `json`.
    pub format: String,
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "pretty".to_string(),
            level: "mapi_node=info,mapi_gateway=info,tower_http=info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// GatewayConfig
// ---------------------------------------------------------------------------

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub block_parser: BlockParserConfig,
    pub mempool_checker: MempoolCheckerConfig,
    pub notifications: NotificationConfig,
    pub rpc: RpcConfig,
    pub clean_up: CleanUpConfig,
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml_from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_parser.max_block_chain_length_for_fork == 0 {
            return Err(ConfigError::Invalid {
                field: "block_parser.max_block_chain_length_for_fork",
                reason: "must be at least 1".into(),
            });
        }
        if self.mempool_checker.resubmit_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "mempool_checker.resubmit_batch_size",
                reason: "must be at least 1".into(),
            });
        }
        let n = &self.notifications;
        if n.max_notifications_in_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "notifications.max_notifications_in_batch",
                reason: "must be at least 1".into(),
            });
        }
        if n.max_slow_notification_size > n.max_notification_queue_size {
            return Err(ConfigError::Invalid {
                field: "notifications.max_slow_notification_size",
                reason: "cannot exceed max_notification_queue_size".into(),
            });
        }
        if n.saved_execution_times == 0 {
            return Err(ConfigError::Invalid {
                field: "notifications.saved_execution_times",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// The mempool checker depends on active-chain tracking.
    pub fn mempool_checker_enabled(&self) -> bool {
        !self.block_parser.dont_parse_blocks && !self.mempool_checker.disabled
    }
}

fn toml_from_str(s: &str) -> Result<GatewayConfig, ConfigError> {
    toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.block_parser.max_block_chain_length_for_fork, 20);
        assert!(config.mempool_checker_enabled());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [mempool_checker]
            missing_inputs_retries = 2

            [notifications]
            slow_host_threshold_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.mempool_checker.missing_inputs_retries, 2);
        assert_eq!(config.mempool_checker.interval_sec, 60);
        assert_eq!(config.notifications.slow_host_threshold_ms, 250);
        assert_eq!(config.notifications.max_slow_notification_size, 100);
    }

    #[test]
    fn dont_parse_blocks_disables_mempool_checker() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [block_parser]
            dont_parse_blocks = true
            "#,
        )
        .unwrap();
        assert!(!config.mempool_checker_enabled());
    }

    #[test]
    fn rejects_zero_fork_length() {
        let err = GatewayConfig::from_toml_str(
            r#"
            [block_parser]
            max_block_chain_length_for_fork = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_slow_queue_larger_than_total() {
        let mut config = GatewayConfig::default();
        config.notifications.max_slow_notification_size = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            GatewayConfig::from_toml_str("[block_parser"),
            Err(ConfigError::Parse(_))
        ));
    }
}
