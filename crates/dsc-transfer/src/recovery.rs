//! Recovery manager
//!
//! Owns every durable mutation of transfer state. Mutations for one
//! transfer id are serialized; distinct ids never contend. Terminal
//! transitions evict the endpoint reference and notify the control plane.

use dsc_common::types::{ChunkCheckpoint, FailureCause, TransferId, TransferState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::descriptor::{EndpointReferenceEntry, TransferDescriptor};
use crate::endpoint::EndpointReferenceCache;
use crate::error::{Result, TransferError};
use crate::notify::{TransferEvent, TransferObserver};
use crate::sink::SinkCapabilities;
use crate::store::{TransferRecord, TransferStore};

/// One async mutex per transfer id.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<TransferId, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, id: &TransferId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn forget(&self, id: &TransferId) {
        self.locks.lock().await.remove(id);
    }
}

pub struct RecoveryManager {
    store: Arc<dyn TransferStore>,
    endpoints: EndpointReferenceCache,
    observer: Arc<dyn TransferObserver>,
    locks: KeyedLocks,
    reconciled: AtomicBool,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn TransferStore>, observer: Arc<dyn TransferObserver>) -> Self {
        Self {
            endpoints: EndpointReferenceCache::new(store.clone()),
            store,
            observer,
            locks: KeyedLocks::default(),
            reconciled: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn TransferStore> {
        &self.store
    }

    pub fn endpoints(&self) -> &EndpointReferenceCache {
        &self.endpoints
    }

    /// Create state `Pending`, checkpoint 0 and the endpoint entry together.
    #[instrument(skip_all, fields(transfer_id = %descriptor.transfer_id))]
    pub async fn admit(&self, descriptor: TransferDescriptor) -> Result<TransferRecord> {
        let _guard = self.locks.lock(&descriptor.transfer_id).await;

        let entry = EndpointReferenceEntry::new(descriptor.transfer_id.clone(), &descriptor.endpoint);
        let record = TransferRecord::pending(&descriptor);
        self.store.insert(&record, &entry).await?;
        self.endpoints.remember(entry).await;

        info!("Transfer admitted");
        Ok(record)
    }

    pub async fn record(&self, id: &TransferId) -> Result<TransferRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| TransferError::NotFound(id.clone()))
    }

    pub async fn list(&self) -> Result<Vec<TransferRecord>> {
        self.store.list_all().await
    }

    /// Durably record progress. Only streaming transfers accept checkpoints
    /// and offsets must strictly increase.
    pub async fn persist_checkpoint(&self, checkpoint: ChunkCheckpoint) -> Result<()> {
        let id = checkpoint.transfer_id.clone();
        let _guard = self.locks.lock(&id).await;

        let record = self.record(&id).await?;
        if record.state != TransferState::Streaming {
            return Err(TransferError::InvalidTransition {
                transfer_id: id,
                from: record.state,
                to: TransferState::Streaming,
            });
        }

        self.store.write_checkpoint(&checkpoint).await?;
        debug!(transfer_id = %id, offset = checkpoint.offset, "Checkpoint persisted");
        Ok(())
    }

    /// Move to a non-terminal state.
    pub async fn transition(&self, id: &TransferId, to: TransferState) -> Result<TransferRecord> {
        if to.is_terminal() {
            return Err(TransferError::permanent(format!(
                "terminal state {to} must be reached through complete, fail or abandon"
            )));
        }
        let _guard = self.locks.lock(id).await;
        self.change_state(id, to, None).await
    }

    pub async fn complete(&self, id: &TransferId, bytes: u64) -> Result<TransferRecord> {
        let record = self.finish(id, TransferState::Completed, None).await?;
        self.notify(&TransferEvent::Completed {
            transfer_id: id.clone(),
            bytes,
        })
        .await;
        Ok(record)
    }

    pub async fn fail(&self, id: &TransferId, cause: FailureCause) -> Result<TransferRecord> {
        let record = self
            .finish(id, TransferState::Failed, Some(&cause))
            .await?;
        self.notify(&TransferEvent::Failed {
            transfer_id: id.clone(),
            cause,
        })
        .await;
        Ok(record)
    }

    pub async fn abandon(&self, id: &TransferId) -> Result<TransferRecord> {
        let record = self.finish(id, TransferState::Abandoned, None).await?;
        self.notify(&TransferEvent::Abandoned {
            transfer_id: id.clone(),
            offset: record.checkpoint.offset,
        })
        .await;
        Ok(record)
    }

    /// Current endpoint reference for a session start or resume.
    pub async fn endpoint(&self, id: &TransferId) -> Result<EndpointReferenceEntry> {
        self.endpoints.get(id).await
    }

    /// Replace the endpoint reference of an active transfer.
    pub async fn refresh_endpoint(&self, entry: EndpointReferenceEntry) -> Result<()> {
        let _guard = self.locks.lock(&entry.transfer_id).await;

        let record = self.record(&entry.transfer_id).await?;
        if record.state.is_terminal() {
            return Err(TransferError::permanent(format!(
                "transfer {} is {}; its endpoint reference can no longer change",
                entry.transfer_id, record.state
            )));
        }

        self.endpoints.refresh(entry).await
    }

    /// Offset a session may continue from. A sink that cannot accept the
    /// checkpointed offset gets the checkpoint reset to 0, and the control
    /// plane is told the restart is destructive.
    pub async fn plan_resume(
        &self,
        record: &TransferRecord,
        capabilities: SinkCapabilities,
    ) -> Result<u64> {
        let offset = record.checkpoint.offset;
        if capabilities.can_resume_at(offset) {
            return Ok(offset);
        }

        {
            let _guard = self.locks.lock(record.id()).await;
            self.store.reset_checkpoint(record.id()).await?;
        }

        warn!(
            transfer_id = %record.id(),
            offset,
            granularity = ?capabilities.resume_granularity,
            "Sink cannot resume at checkpoint, restarting from offset 0"
        );
        self.notify(&TransferEvent::DestructiveResumeRequired {
            transfer_id: record.id().clone(),
            offset,
            granularity: capabilities.resume_granularity,
        })
        .await;

        Ok(0)
    }

    /// Startup phase: move transfers left `Streaming` by an unclean shutdown
    /// to `Paused` and return every non-terminal transfer for re-driving.
    /// Runs once per manager; later calls return nothing.
    #[instrument(skip(self))]
    pub async fn reconcile_on_startup(&self) -> Result<Vec<TransferRecord>> {
        if self.reconciled.swap(true, Ordering::SeqCst) {
            debug!("Startup reconciliation already ran");
            return Ok(Vec::new());
        }

        let mut recovered = Vec::new();
        for record in self.store.list_active().await? {
            let record = if record.state == TransferState::Streaming {
                let _guard = self.locks.lock(record.id()).await;
                info!(
                    transfer_id = %record.id(),
                    offset = record.checkpoint.offset,
                    "Transfer was streaming at shutdown, pausing"
                );
                self.change_state(record.id(), TransferState::Paused, None)
                    .await?
            } else {
                record
            };
            recovered.push(record);
        }

        info!(count = recovered.len(), "Startup reconciliation finished");
        Ok(recovered)
    }

    pub(crate) async fn notify(&self, event: &TransferEvent) {
        self.observer.notify(event).await;
    }

    async fn finish(
        &self,
        id: &TransferId,
        to: TransferState,
        failure: Option<&FailureCause>,
    ) -> Result<TransferRecord> {
        let record = {
            let _guard = self.locks.lock(id).await;
            self.change_state(id, to, failure).await?
        };

        if let Err(e) = self.endpoints.evict(id).await {
            warn!(transfer_id = %id, error = %e, "Failed to evict endpoint reference");
        }
        self.locks.forget(id).await;
        Ok(record)
    }

    /// Caller holds the lock for `id`.
    async fn change_state(
        &self,
        id: &TransferId,
        to: TransferState,
        failure: Option<&FailureCause>,
    ) -> Result<TransferRecord> {
        let mut record = self.record(id).await?;
        if !record.state.can_transition_to(to) {
            return Err(TransferError::InvalidTransition {
                transfer_id: id.clone(),
                from: record.state,
                to,
            });
        }

        self.store.update_state(id, to, failure).await?;
        debug!(transfer_id = %id, from = %record.state, %to, "State changed");

        record.state = to;
        record.failure = failure.cloned();
        Ok(record)
    }
}
