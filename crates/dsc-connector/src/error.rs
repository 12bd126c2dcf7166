//! Error types for the connector host

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for connector operations
pub type Result<T> = std::result::Result<T, ConnectorError>;

#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Transfer engine rejected or failed an operation
    #[error(transparent)]
    Transfer(#[from] dsc_transfer::TransferError),

    #[error("Failed to read '{}': {source}. Verify the file path exists and is readable.", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in '{}': {source}", .path.display())]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration is missing or invalid
    #[error("Configuration error: {0}. Check the DSC_* environment variables.")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConnectorError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
