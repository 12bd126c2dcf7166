//! Durable transfer state
//!
//! A [`TransferStore`] keeps one [`TransferRecord`] per transfer together
//! with its current checkpoint and endpoint reference. Stores enforce
//! admission uniqueness and strictly increasing checkpoints; lifecycle rules
//! live in the recovery manager.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsc_common::types::{ChunkCheckpoint, FailureCause, TransferId, TransferState};
use serde::Serialize;

use crate::descriptor::{EndpointReferenceEntry, TransferDescriptor};
use crate::error::Result;

pub use memory::MemoryTransferStore;
pub use sqlite::SqliteTransferStore;

/// Persisted aggregate for one transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferRecord {
    pub descriptor: TransferDescriptor,
    pub state: TransferState,
    pub checkpoint: ChunkCheckpoint,
    pub failure: Option<FailureCause>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Record for a freshly admitted transfer. The descriptor is stored
    /// without its endpoint credentials.
    pub fn pending(descriptor: &TransferDescriptor) -> Self {
        let checkpoint = ChunkCheckpoint::initial(descriptor.transfer_id.clone());
        Self {
            descriptor: descriptor.persisted(),
            state: TransferState::Pending,
            checkpoint,
            failure: None,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &TransferId {
        &self.descriptor.transfer_id
    }
}

#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Create record, checkpoint and endpoint entry in one step. Fails with
    /// `AlreadyExists` when the id is taken.
    async fn insert(&self, record: &TransferRecord, endpoint: &EndpointReferenceEntry) -> Result<()>;

    async fn get(&self, id: &TransferId) -> Result<Option<TransferRecord>>;

    /// Records in a non-terminal state, oldest first.
    async fn list_active(&self) -> Result<Vec<TransferRecord>>;

    async fn list_all(&self) -> Result<Vec<TransferRecord>>;

    /// Overwrite state and failure cause.
    async fn update_state(
        &self,
        id: &TransferId,
        state: TransferState,
        failure: Option<&FailureCause>,
    ) -> Result<()>;

    /// Replace the checkpoint. Fails with `CheckpointRegression` unless the
    /// new offset is strictly greater than the stored one.
    async fn write_checkpoint(&self, checkpoint: &ChunkCheckpoint) -> Result<()>;

    /// Put the checkpoint back to offset 0.
    async fn reset_checkpoint(&self, id: &TransferId) -> Result<()>;

    async fn get_endpoint(&self, id: &TransferId) -> Result<Option<EndpointReferenceEntry>>;

    async fn put_endpoint(&self, entry: &EndpointReferenceEntry) -> Result<()>;

    async fn delete_endpoint(&self, id: &TransferId) -> Result<()>;
}
