//! Configuration management

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Transfer Configuration Constants
// ============================================================================

/// Default chunk size in bytes (1 MiB).
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 1024 * 1024;

/// Default attempt ceiling for one open, read, write or checkpoint call.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first retry in milliseconds.
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 500;

/// Default upper bound for a single backoff delay in milliseconds.
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 30_000;

/// Default growth factor between consecutive backoff delays.
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: u32 = 2;

/// Default deadline for a single adapter call in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Default number of bytes a sink may be re-sent for one chunk (64 MiB).
pub const DEFAULT_SINK_RETRY_BUDGET_BYTES: u64 = 64 * 1024 * 1024;

/// Default resume granularity for non-idempotent HTTP sinks. Zero means the
/// sink has no safe resume point and always restarts from offset 0.
pub const DEFAULT_SINK_RESUME_GRANULARITY_BYTES: u64 = 0;

/// Default number of transfers pumping at the same time.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 16;

/// Default cap on a metadata document buffered by the publishing sink (4 MiB).
pub const DEFAULT_METADATA_MAX_BYTES: usize = 4 * 1024 * 1024;

/// Default time a paused transfer may wait for a usable endpoint reference
/// before it is abandoned (24 h). Zero keeps it waiting indefinitely.
pub const DEFAULT_ENDPOINT_GRACE_SECS: u64 = 24 * 60 * 60;

/// Default HTTP connect timeout in seconds.
pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

/// User agent sent by the HTTP adapters.
pub const USER_AGENT: &str = concat!("dsc-transfer/", env!("CARGO_PKG_VERSION"));

/// Transfer engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub chunk_size_bytes: usize,
    pub retry: RetryConfig,
    pub call_timeout_secs: u64,
    pub sink_retry_budget_bytes: u64,
    pub sink_resume_granularity_bytes: u64,
    pub max_concurrent_transfers: usize,
    pub metadata_max_bytes: usize,
    pub http_connect_timeout_secs: u64,
    pub endpoint_grace_secs: u64,
}

/// Bounded exponential backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
}

impl TransferConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env();
        config.validate()?;

        Ok(config)
    }

    /// Read `DSC_*` variables, falling back to the defaults.
    pub fn from_env() -> Self {
        Self {
            chunk_size_bytes: env_or("DSC_CHUNK_SIZE_BYTES", DEFAULT_CHUNK_SIZE_BYTES),
            retry: RetryConfig {
                max_attempts: env_or("DSC_RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS),
                initial_backoff_ms: env_or(
                    "DSC_RETRY_INITIAL_BACKOFF_MS",
                    DEFAULT_RETRY_INITIAL_BACKOFF_MS,
                ),
                max_backoff_ms: env_or("DSC_RETRY_MAX_BACKOFF_MS", DEFAULT_RETRY_MAX_BACKOFF_MS),
                multiplier: env_or("DSC_RETRY_BACKOFF_MULTIPLIER", DEFAULT_RETRY_BACKOFF_MULTIPLIER),
            },
            call_timeout_secs: env_or("DSC_CALL_TIMEOUT_SECS", DEFAULT_CALL_TIMEOUT_SECS),
            sink_retry_budget_bytes: env_or(
                "DSC_SINK_RETRY_BUDGET_BYTES",
                DEFAULT_SINK_RETRY_BUDGET_BYTES,
            ),
            sink_resume_granularity_bytes: env_or(
                "DSC_SINK_RESUME_GRANULARITY_BYTES",
                DEFAULT_SINK_RESUME_GRANULARITY_BYTES,
            ),
            max_concurrent_transfers: env_or(
                "DSC_MAX_CONCURRENT_TRANSFERS",
                DEFAULT_MAX_CONCURRENT_TRANSFERS,
            ),
            metadata_max_bytes: env_or("DSC_METADATA_MAX_BYTES", DEFAULT_METADATA_MAX_BYTES),
            http_connect_timeout_secs: env_or(
                "DSC_HTTP_CONNECT_TIMEOUT_SECS",
                DEFAULT_HTTP_CONNECT_TIMEOUT_SECS,
            ),
            endpoint_grace_secs: env_or("DSC_ENDPOINT_GRACE_SECS", DEFAULT_ENDPOINT_GRACE_SECS),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size_bytes == 0 {
            anyhow::bail!("Chunk size must be greater than 0");
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("Retry max_attempts must be at least 1");
        }

        if self.retry.multiplier == 0 {
            anyhow::bail!("Retry backoff multiplier must be at least 1");
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            anyhow::bail!(
                "Initial backoff ({} ms) cannot exceed max backoff ({} ms)",
                self.retry.initial_backoff_ms,
                self.retry.max_backoff_ms
            );
        }

        if self.call_timeout_secs == 0 {
            anyhow::bail!("Adapter call timeout must be greater than 0");
        }

        if self.max_concurrent_transfers == 0 {
            anyhow::bail!("max_concurrent_transfers must be greater than 0");
        }

        if (self.sink_retry_budget_bytes as usize) < self.chunk_size_bytes {
            tracing::warn!(
                budget = self.sink_retry_budget_bytes,
                chunk_size = self.chunk_size_bytes,
                "Sink retry budget is smaller than one chunk; failed sink writes will not be retried"
            );
        }

        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn http_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.http_connect_timeout_secs)
    }

    /// `None` when paused transfers never expire.
    pub fn endpoint_grace(&self) -> Option<Duration> {
        (self.endpoint_grace_secs > 0).then(|| Duration::from_secs(self.endpoint_grace_secs))
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            retry: RetryConfig::default(),
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            sink_retry_budget_bytes: DEFAULT_SINK_RETRY_BUDGET_BYTES,
            sink_resume_granularity_bytes: DEFAULT_SINK_RESUME_GRANULARITY_BYTES,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            metadata_max_bytes: DEFAULT_METADATA_MAX_BYTES,
            http_connect_timeout_secs: DEFAULT_HTTP_CONNECT_TIMEOUT_SECS,
            endpoint_grace_secs: DEFAULT_ENDPOINT_GRACE_SECS,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_RETRY_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_RETRY_MAX_BACKOFF_MS,
            multiplier: DEFAULT_RETRY_BACKOFF_MULTIPLIER,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
