//! Common types used across the connector

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DscError;

/// Identifier of one logical transfer, supplied by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identifier for transfers admitted without one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TransferId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a transfer.
///
/// ```text
/// Pending -> Streaming -> Completed | Failed | Paused
/// Paused  -> Streaming | Abandoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Streaming,
    Paused,
    Completed,
    Failed,
    Abandoned,
}

impl TransferState {
    pub const ALL: [TransferState; 6] = [
        TransferState::Pending,
        TransferState::Streaming,
        TransferState::Paused,
        TransferState::Completed,
        TransferState::Failed,
        TransferState::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Pending => "pending",
            TransferState::Streaming => "streaming",
            TransferState::Paused => "paused",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Abandoned
        )
    }

    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Pending, Streaming)
                | (Streaming, Completed)
                | (Streaming, Failed)
                | (Streaming, Paused)
                | (Paused, Streaming)
                | (Paused, Abandoned)
        )
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransferState {
    type Err = DscError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DscError::UnknownState(s.to_string()))
    }
}

/// Category of the error that moved a transfer to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnreachable,
    SourceAuthFailed,
    SinkUnreachable,
    SinkAuthFailed,
    SinkCommitFailed,
    SinkValidationFailed,
    EndpointExpired,
    DestructiveResumeRequired,
    Transient,
    Permanent,
    Fatal,
}

impl FailureKind {
    pub const ALL: [FailureKind; 11] = [
        FailureKind::SourceUnreachable,
        FailureKind::SourceAuthFailed,
        FailureKind::SinkUnreachable,
        FailureKind::SinkAuthFailed,
        FailureKind::SinkCommitFailed,
        FailureKind::SinkValidationFailed,
        FailureKind::EndpointExpired,
        FailureKind::DestructiveResumeRequired,
        FailureKind::Transient,
        FailureKind::Permanent,
        FailureKind::Fatal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SourceUnreachable => "source_unreachable",
            FailureKind::SourceAuthFailed => "source_auth_failed",
            FailureKind::SinkUnreachable => "sink_unreachable",
            FailureKind::SinkAuthFailed => "sink_auth_failed",
            FailureKind::SinkCommitFailed => "sink_commit_failed",
            FailureKind::SinkValidationFailed => "sink_validation_failed",
            FailureKind::EndpointExpired => "endpoint_expired",
            FailureKind::DestructiveResumeRequired => "destructive_resume_required",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureKind {
    type Err = DscError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DscError::UnknownFailureKind(s.to_string()))
    }
}

/// Why a transfer failed. `message` carries the originating error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Last durably recorded progress point of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    pub transfer_id: TransferId,

    /// Bytes acknowledged by the sink so far
    pub offset: u64,

    /// SHA-256 hex digest of the last acknowledged chunk
    pub content_hash: Option<String>,

    pub recorded_at: DateTime<Utc>,
}

impl ChunkCheckpoint {
    pub fn new(transfer_id: TransferId, offset: u64, content_hash: Option<String>) -> Self {
        Self {
            transfer_id,
            offset,
            content_hash,
            recorded_at: Utc::now(),
        }
    }

    /// Checkpoint written when a transfer is admitted.
    pub fn initial(transfer_id: TransferId) -> Self {
        Self::new(transfer_id, 0, None)
    }
}
