//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, DscError>;

#[derive(Error, Debug)]
pub enum DscError {
    #[error("Unknown transfer state: {0}")]
    UnknownState(String),

    #[error("Unknown failure kind: {0}")]
    UnknownFailureKind(String),
}
