//! Connector host configuration

use anyhow::Context;
use dsc_transfer::TransferConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Host Configuration Constants
// ============================================================================

/// Default transfer state database.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://dsc-transfers.db";

/// Default size of the SQLite connection pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default delay before startup reconciliation in seconds.
pub const DEFAULT_RECONCILE_DELAY_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub reconcile_delay_secs: u64,
    /// Control-plane URL receiving transfer events
    pub callback_url: Option<String>,
    pub transfer: TransferConfig,
}

impl ConnectorConfig {
    /// Load configuration from `.env`, environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env();
        config.validate()?;

        Ok(config)
    }

    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DSC_DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            database_max_connections: std::env::var("DSC_DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            reconcile_delay_secs: std::env::var("DSC_RECONCILE_DELAY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RECONCILE_DELAY_SECS),
            callback_url: std::env::var("DSC_CALLBACK_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            transfer: TransferConfig::from_env(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.database_url.starts_with("sqlite:") {
            anyhow::bail!(
                "Database URL '{}' must use the sqlite: scheme",
                self.database_url
            );
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if let Some(ref url) = self.callback_url {
            url::Url::parse(url).with_context(|| format!("Invalid callback URL '{url}'"))?;
        }

        self.transfer.validate()
    }

    pub fn reconcile_delay(&self) -> Duration {
        Duration::from_secs(self.reconcile_delay_secs)
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            database_max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            reconcile_delay_secs: DEFAULT_RECONCILE_DELAY_SECS,
            callback_url: None,
            transfer: TransferConfig::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("DSC_DATABASE_URL", "sqlite::memory:");
        std::env::set_var("DSC_RECONCILE_DELAY_SECS", "0");
        std::env::set_var("DSC_CALLBACK_URL", "  ");

        let config = ConnectorConfig::from_env();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.reconcile_delay(), Duration::ZERO);
        assert_eq!(config.callback_url, None);
        assert_eq!(
            config.database_max_connections,
            DEFAULT_DATABASE_MAX_CONNECTIONS
        );

        std::env::remove_var("DSC_DATABASE_URL");
        std::env::remove_var("DSC_RECONCILE_DELAY_SECS");
        std::env::remove_var("DSC_CALLBACK_URL");
    }

    #[test]
    fn test_validate() {
        ConnectorConfig::default().validate().unwrap();

        let config = ConnectorConfig {
            database_url: "postgres://localhost/dsc".into(),
            ..ConnectorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ConnectorConfig {
            callback_url: Some("not a url".into()),
            ..ConnectorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
