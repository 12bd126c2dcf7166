//! Worker pool
//!
//! One tokio task per active transfer, bounded by a semaphore. A panic or
//! fatal error inside a worker fails only that worker's transfer.

use dsc_common::types::{TransferId, TransferState};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapters::AdapterFactory;
use crate::config::TransferConfig;
use crate::descriptor::TransferDescriptor;
use crate::error::{Result, TransferError};
use crate::recovery::RecoveryManager;
use crate::session::{SessionControl, SessionOutcome, TransferSession};

struct Worker {
    control: SessionControl,
    handle: JoinHandle<Result<SessionOutcome>>,
}

struct PoolInner {
    manager: Arc<RecoveryManager>,
    adapters: Arc<dyn AdapterFactory>,
    config: TransferConfig,
    permits: Arc<Semaphore>,
    workers: Mutex<HashMap<TransferId, Worker>>,
    /// Outcomes of finished workers replaced by a newer one for the same id.
    replaced: Mutex<Vec<(TransferId, Result<SessionOutcome>)>>,
}

#[derive(Clone)]
pub struct TransferWorkerPool {
    inner: Arc<PoolInner>,
}

impl TransferWorkerPool {
    pub fn new(
        manager: Arc<RecoveryManager>,
        adapters: Arc<dyn AdapterFactory>,
        config: &TransferConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                manager,
                adapters,
                config: config.clone(),
                permits: Arc::new(Semaphore::new(config.max_concurrent_transfers)),
                workers: Mutex::new(HashMap::new()),
                replaced: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn manager(&self) -> &Arc<RecoveryManager> {
        &self.inner.manager
    }

    /// Admit `descriptor` and spawn its worker.
    pub async fn start(&self, descriptor: TransferDescriptor) -> Result<TransferId> {
        descriptor.validate()?;
        let record = self.inner.manager.admit(descriptor).await?;
        let id = record.id().clone();
        self.spawn(id.clone()).await?;
        Ok(id)
    }

    /// Spawn a worker for a pending or paused transfer.
    pub async fn resume(&self, id: &TransferId) -> Result<()> {
        self.spawn(id.clone()).await
    }

    /// Ask the worker to stop at the next chunk boundary.
    pub async fn pause(&self, id: &TransferId) -> Result<()> {
        if let Some(worker) = self.inner.workers.lock().await.get(id) {
            if !worker.handle.is_finished() {
                worker.control.pause();
                return Ok(());
            }
        }

        let record = self.inner.manager.record(id).await?;
        match record.state {
            TransferState::Paused => Ok(()),
            state => Err(TransferError::InvalidTransition {
                transfer_id: id.clone(),
                from: state,
                to: TransferState::Paused,
            }),
        }
    }

    /// Abandon a transfer: cooperatively when a worker is running, directly
    /// when it is paused.
    pub async fn cancel(&self, id: &TransferId) -> Result<()> {
        if let Some(worker) = self.inner.workers.lock().await.get(id) {
            if !worker.handle.is_finished() {
                worker.control.cancel();
                return Ok(());
            }
        }

        self.inner.manager.abandon(id).await?;
        Ok(())
    }

    /// Wait for the worker of `id` to finish.
    pub async fn wait(&self, id: &TransferId) -> Result<SessionOutcome> {
        let worker = self
            .inner
            .workers
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;

        self.join(id, worker).await
    }

    /// Wait until no worker is left, including workers spawned meanwhile.
    pub async fn join_all(&self) -> Vec<(TransferId, Result<SessionOutcome>)> {
        let mut outcomes = Vec::new();
        loop {
            outcomes.append(&mut *self.inner.replaced.lock().await);
            let drained: Vec<(TransferId, Worker)> =
                self.inner.workers.lock().await.drain().collect();
            if drained.is_empty() {
                return outcomes;
            }
            for (id, worker) in drained {
                let outcome = self.join(&id, worker).await;
                outcomes.push((id, outcome));
            }
        }
    }

    /// Graceful shutdown: every running worker stops at its next chunk
    /// boundary with its checkpoint intact.
    pub async fn pause_all(&self) {
        let workers = self.inner.workers.lock().await;
        info!(count = workers.len(), "Pausing all transfers");
        for worker in workers.values() {
            worker.control.pause();
        }
    }

    /// Run startup reconciliation and spawn one worker per recovered
    /// transfer.
    pub async fn recover(&self) -> Result<Vec<TransferId>> {
        let records = self.inner.manager.reconcile_on_startup().await?;

        let mut resumed = Vec::with_capacity(records.len());
        for record in records {
            match self.spawn(record.id().clone()).await {
                Ok(()) => resumed.push(record.id().clone()),
                Err(e) => warn!(transfer_id = %record.id(), error = %e, "Failed to resume recovered transfer"),
            }
        }

        info!(count = resumed.len(), "Recovered transfers resumed");
        Ok(resumed)
    }

    /// Ids with a running worker.
    pub async fn active(&self) -> Vec<TransferId> {
        self.inner
            .workers
            .lock()
            .await
            .iter()
            .filter(|(_, worker)| !worker.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Collect the outcomes of workers that already finished.
    pub async fn reap(&self) -> Vec<(TransferId, Result<SessionOutcome>)> {
        let finished: Vec<(TransferId, Worker)> = {
            let mut workers = self.inner.workers.lock().await;
            let ids: Vec<TransferId> = workers
                .iter()
                .filter(|(_, worker)| worker.handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| workers.remove(&id).map(|worker| (id, worker)))
                .collect()
        };

        let mut outcomes = std::mem::take(&mut *self.inner.replaced.lock().await);
        for (id, worker) in finished {
            let outcome = self.join(&id, worker).await;
            outcomes.push((id, outcome));
        }
        outcomes
    }

    async fn spawn(&self, id: TransferId) -> Result<()> {
        let mut workers = self.inner.workers.lock().await;
        if let Some(existing) = workers.get(&id) {
            if !existing.handle.is_finished() {
                return Err(TransferError::AlreadyActive(id));
            }
        }

        let (control, rx) = SessionControl::new();
        let session = TransferSession::new(
            self.inner.manager.clone(),
            self.inner.adapters.clone(),
            &self.inner.config,
            rx,
        );
        let permits = self.inner.permits.clone();
        let manager = self.inner.manager.clone();
        let worker_id = id.clone();

        let handle = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| TransferError::permanent("worker pool is closed"))?;

            match AssertUnwindSafe(session.resume(&worker_id)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let err = TransferError::WorkerPanicked(worker_id.clone());
                    error!(transfer_id = %worker_id, "Worker panicked");
                    if let Err(e) = manager.fail(&worker_id, err.to_cause()).await {
                        error!(transfer_id = %worker_id, error = %e, "Failed to record worker panic");
                    }
                    Err(err)
                },
            }
        });

        if let Some(previous) = workers.insert(id.clone(), Worker { control, handle }) {
            drop(workers);
            let outcome = self.join(&id, previous).await;
            debug!(transfer_id = %id, "Replaced finished worker");
            self.inner.replaced.lock().await.push((id, outcome));
        }
        Ok(())
    }

    async fn join(&self, id: &TransferId, worker: Worker) -> Result<SessionOutcome> {
        match worker.handle.await {
            Ok(outcome) => {
                match &outcome {
                    Ok(o) => info!(transfer_id = %id, outcome = ?o, "Worker finished"),
                    Err(e) => warn!(transfer_id = %id, error = %e, "Worker finished with error"),
                }
                outcome
            },
            Err(join_error) => {
                error!(transfer_id = %id, error = %join_error, "Worker task aborted");
                let err = TransferError::WorkerPanicked(id.clone());
                if join_error.is_panic() {
                    if let Err(e) = self.inner.manager.fail(id, err.to_cause()).await {
                        error!(transfer_id = %id, error = %e, "Failed to record worker panic");
                    }
                }
                Err(err)
            },
        }
    }
}
