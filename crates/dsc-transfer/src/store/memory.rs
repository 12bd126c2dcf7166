use async_trait::async_trait;
use chrono::Utc;
use dsc_common::types::{ChunkCheckpoint, FailureCause, TransferId, TransferState};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{TransferRecord, TransferStore};
use crate::descriptor::EndpointReferenceEntry;
use crate::error::{Result, TransferError};

#[derive(Default)]
struct Tables {
    records: HashMap<TransferId, TransferRecord>,
    endpoints: HashMap<TransferId, EndpointReferenceEntry>,
}

/// Process-local store for embedding and tests. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryTransferStore {
    tables: RwLock<Tables>,
}

impl MemoryTransferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut records: Vec<TransferRecord>) -> Vec<TransferRecord> {
    records.sort_by(|a, b| {
        a.descriptor
            .created_at
            .cmp(&b.descriptor.created_at)
            .then_with(|| a.id().cmp(b.id()))
    });
    records
}

#[async_trait]
impl TransferStore for MemoryTransferStore {
    async fn insert(&self, record: &TransferRecord, endpoint: &EndpointReferenceEntry) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.records.contains_key(record.id()) {
            return Err(TransferError::AlreadyExists(record.id().clone()));
        }
        tables.records.insert(record.id().clone(), record.clone());
        tables
            .endpoints
            .insert(record.id().clone(), endpoint.clone());
        Ok(())
    }

    async fn get(&self, id: &TransferId) -> Result<Option<TransferRecord>> {
        Ok(self.tables.read().await.records.get(id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<TransferRecord>> {
        let tables = self.tables.read().await;
        Ok(sorted(
            tables
                .records
                .values()
                .filter(|r| !r.state.is_terminal())
                .cloned()
                .collect(),
        ))
    }

    async fn list_all(&self) -> Result<Vec<TransferRecord>> {
        Ok(sorted(self.tables.read().await.records.values().cloned().collect()))
    }

    async fn update_state(
        &self,
        id: &TransferId,
        state: TransferState,
        failure: Option<&FailureCause>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .records
            .get_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;
        record.state = state;
        record.failure = failure.cloned();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn write_checkpoint(&self, checkpoint: &ChunkCheckpoint) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .records
            .get_mut(&checkpoint.transfer_id)
            .ok_or_else(|| TransferError::NotFound(checkpoint.transfer_id.clone()))?;

        if checkpoint.offset <= record.checkpoint.offset {
            return Err(TransferError::CheckpointRegression {
                transfer_id: checkpoint.transfer_id.clone(),
                current: record.checkpoint.offset,
                attempted: checkpoint.offset,
            });
        }

        record.checkpoint = checkpoint.clone();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn reset_checkpoint(&self, id: &TransferId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .records
            .get_mut(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;
        record.checkpoint = ChunkCheckpoint::initial(id.clone());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_endpoint(&self, id: &TransferId) -> Result<Option<EndpointReferenceEntry>> {
        Ok(self.tables.read().await.endpoints.get(id).cloned())
    }

    async fn put_endpoint(&self, entry: &EndpointReferenceEntry) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.records.contains_key(&entry.transfer_id) {
            return Err(TransferError::NotFound(entry.transfer_id.clone()));
        }
        tables
            .endpoints
            .insert(entry.transfer_id.clone(), entry.clone());
        Ok(())
    }

    async fn delete_endpoint(&self, id: &TransferId) -> Result<()> {
        self.tables.write().await.endpoints.remove(id);
        Ok(())
    }
}
