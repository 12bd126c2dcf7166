//! Transfer error taxonomy and failure classification

use dsc_common::types::{FailureCause, FailureKind, TransferId, TransferState};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;

/// How the session reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retried locally within the attempt and byte budgets
    Transient,
    /// Moves the transfer to `Failed`
    Permanent,
    /// Invariant violation; aborts the affected transfer only
    Fatal,
}

/// Which adapter an I/O failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Sink,
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("source rejected credentials: {0}")]
    SourceAuthFailed(String),

    #[error("sink unreachable: {0}")]
    SinkUnreachable(String),

    #[error("sink rejected credentials: {0}")]
    SinkAuthFailed(String),

    #[error("sink commit failed: {0}")]
    SinkCommitFailed(String),

    #[error("sink validation failed: {0}")]
    SinkValidationFailed(String),

    #[error("endpoint reference for transfer {0} has expired")]
    EndpointExpired(TransferId),

    #[error("no endpoint reference recorded for transfer {0}")]
    EndpointMissing(TransferId),

    #[error("transfer {transfer_id} cannot resume at offset {offset}; restarting from offset 0")]
    DestructiveResumeRequired { transfer_id: TransferId, offset: u64 },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("adapter call exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TransferError>,
    },

    #[error("sink retry budget of {budget} bytes exhausted: {last}")]
    RetryBudgetExhausted {
        budget: u64,
        last: Box<TransferError>,
    },

    #[error("checkpoint for transfer {transfer_id} must advance past {current}, got {attempted}")]
    CheckpointRegression {
        transfer_id: TransferId,
        current: u64,
        attempted: u64,
    },

    #[error("corrupted persisted state: {0}")]
    CorruptedState(String),

    #[error("transfer {transfer_id} cannot move from {from} to {to}")]
    InvalidTransition {
        transfer_id: TransferId,
        from: TransferState,
        to: TransferState,
    },

    #[error("transfer not found: {0}")]
    NotFound(TransferId),

    #[error("transfer already admitted: {0}")]
    AlreadyExists(TransferId),

    #[error("transfer {0} already has an active worker")]
    AlreadyActive(TransferId),

    #[error("invalid transfer descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("worker for transfer {0} panicked")]
    WorkerPanicked(TransferId),
}

impl TransferError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::CorruptedState(msg.into())
    }

    pub fn class(&self) -> FailureClass {
        match self {
            TransferError::SourceUnreachable(_)
            | TransferError::SinkUnreachable(_)
            | TransferError::Transient(_)
            | TransferError::DeadlineExceeded(_)
            | TransferError::Storage(_) => FailureClass::Transient,

            TransferError::CheckpointRegression { .. }
            | TransferError::CorruptedState(_)
            | TransferError::InvalidTransition { .. }
            | TransferError::Migration(_)
            | TransferError::Serialization(_)
            | TransferError::WorkerPanicked(_) => FailureClass::Fatal,

            _ => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == FailureClass::Fatal
    }

    /// True when the session must wait for the control plane to supply a
    /// fresh endpoint reference.
    pub fn needs_endpoint_refresh(&self) -> bool {
        matches!(
            self,
            TransferError::EndpointExpired(_) | TransferError::EndpointMissing(_)
        )
    }

    /// Persisted category. Exhausted budgets report the kind of the last error.
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::SourceUnreachable(_) => FailureKind::SourceUnreachable,
            TransferError::SourceAuthFailed(_) => FailureKind::SourceAuthFailed,
            TransferError::SinkUnreachable(_) => FailureKind::SinkUnreachable,
            TransferError::SinkAuthFailed(_) => FailureKind::SinkAuthFailed,
            TransferError::SinkCommitFailed(_) => FailureKind::SinkCommitFailed,
            TransferError::SinkValidationFailed(_) => FailureKind::SinkValidationFailed,
            TransferError::EndpointExpired(_) | TransferError::EndpointMissing(_) => {
                FailureKind::EndpointExpired
            },
            TransferError::DestructiveResumeRequired { .. } => {
                FailureKind::DestructiveResumeRequired
            },
            TransferError::RetriesExhausted { last, .. }
            | TransferError::RetryBudgetExhausted { last, .. } => last.kind(),
            other => match other.class() {
                FailureClass::Transient => FailureKind::Transient,
                FailureClass::Permanent => FailureKind::Permanent,
                FailureClass::Fatal => FailureKind::Fatal,
            },
        }
    }

    pub fn to_cause(&self) -> FailureCause {
        FailureCause::new(self.kind(), self.to_string())
    }

    pub(crate) fn unreachable(side: Side, msg: impl Into<String>) -> Self {
        match side {
            Side::Source => Self::SourceUnreachable(msg.into()),
            Side::Sink => Self::SinkUnreachable(msg.into()),
        }
    }

    pub(crate) fn auth_failed(side: Side, msg: impl Into<String>) -> Self {
        match side {
            Side::Source => Self::SourceAuthFailed(msg.into()),
            Side::Sink => Self::SinkAuthFailed(msg.into()),
        }
    }

    /// Classify a non-success HTTP status.
    pub(crate) fn from_status(side: Side, status: u16, context: &str) -> Self {
        let msg = format!("{context}: HTTP {status}");
        match status {
            401 | 403 => Self::auth_failed(side, msg),
            408 | 429 => Self::Transient(msg),
            s if s >= 500 => Self::Transient(msg),
            _ => Self::Permanent(msg),
        }
    }

    /// Classify a transport-level reqwest failure.
    pub(crate) fn from_reqwest(side: Side, err: &reqwest::Error, context: &str) -> Self {
        let msg = format!("{context}: {err}");
        if err.is_connect() || err.is_timeout() {
            Self::unreachable(side, msg)
        } else if let Some(status) = err.status() {
            Self::from_status(side, status.as_u16(), context)
        } else if err.is_builder() {
            Self::Permanent(msg)
        } else {
            Self::Transient(msg)
        }
    }
}
