//! Transfer session
//!
//! Drives one transfer through its state machine: resolve the endpoint
//! reference, pick the resume offset, open the adapters and pump chunks from
//! source to sink. Every acknowledged chunk is checkpointed before the next
//! read. Pause and cancel are honored at chunk boundaries.

use dsc_common::checksum::sha256_hex;
use chrono::Utc;
use dsc_common::types::{ChunkCheckpoint, TransferId, TransferState};
use futures::TryStreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::AdapterFactory;
use crate::config::TransferConfig;
use crate::descriptor::{EndpointReference, TransferDescriptor};
use crate::error::{Result, TransferError};
use crate::notify::TransferEvent;
use crate::recovery::RecoveryManager;
use crate::retry::{exhausted, with_deadline, RetryPolicy};
use crate::sink::SinkHandle;
use crate::source::{self, Chunk, SourceHandle};
use crate::store::TransferRecord;

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed { bytes: u64 },
    Paused { offset: u64 },
    Abandoned { offset: u64 },
    Failed(dsc_common::types::FailureCause),
    /// The endpoint reference expired or is missing. State is unchanged.
    AwaitingEndpoint,
}

impl SessionOutcome {
    /// True when the transfer can still make progress.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            SessionOutcome::Paused { .. } | SessionOutcome::AwaitingEndpoint
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

/// Sending half of a session's control channel.
#[derive(Debug, Clone)]
pub struct SessionControl {
    tx: Arc<watch::Sender<ControlSignal>>,
}

impl SessionControl {
    pub fn new() -> (Self, watch::Receiver<ControlSignal>) {
        let (tx, rx) = watch::channel(ControlSignal::Run);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Stop at the next chunk boundary and keep the checkpoint. A pending
    /// cancel wins.
    pub fn pause(&self) {
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Run {
                *signal = ControlSignal::Pause;
                true
            } else {
                false
            }
        });
    }

    /// Stop at the next chunk boundary and abandon the transfer.
    pub fn cancel(&self) {
        self.tx.send_replace(ControlSignal::Cancel);
    }

    pub fn signal(&self) -> ControlSignal {
        *self.tx.borrow()
    }
}

/// Where the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Exhausted(u64),
    Paused(u64),
    Cancelled(u64),
}

pub struct TransferSession {
    manager: Arc<RecoveryManager>,
    adapters: Arc<dyn AdapterFactory>,
    retry: RetryPolicy,
    chunk_size: usize,
    call_timeout: Duration,
    sink_retry_budget: u64,
    endpoint_grace: Option<Duration>,
    control: watch::Receiver<ControlSignal>,
}

impl TransferSession {
    pub fn new(
        manager: Arc<RecoveryManager>,
        adapters: Arc<dyn AdapterFactory>,
        config: &TransferConfig,
        control: watch::Receiver<ControlSignal>,
    ) -> Self {
        Self {
            manager,
            adapters,
            retry: RetryPolicy::new(&config.retry),
            chunk_size: config.chunk_size_bytes,
            call_timeout: config.call_timeout(),
            sink_retry_budget: config.sink_retry_budget_bytes,
            endpoint_grace: config.endpoint_grace(),
            control,
        }
    }

    /// Validate and admit `descriptor`, then stream it.
    pub async fn start(self, descriptor: TransferDescriptor) -> Result<SessionOutcome> {
        descriptor.validate()?;
        let record = self.manager.admit(descriptor).await?;
        self.drive(record).await
    }

    /// Continue a pending or paused transfer from its last checkpoint.
    pub async fn resume(self, id: &TransferId) -> Result<SessionOutcome> {
        let record = self.manager.record(id).await?;
        self.drive(record).await
    }

    #[instrument(skip_all, fields(transfer_id = %record.id()))]
    async fn drive(&self, record: TransferRecord) -> Result<SessionOutcome> {
        let id = record.id().clone();

        if !record.state.can_transition_to(TransferState::Streaming) {
            return Err(TransferError::InvalidTransition {
                transfer_id: id,
                from: record.state,
                to: TransferState::Streaming,
            });
        }

        if record.state == TransferState::Paused && self.signal() == ControlSignal::Cancel {
            let record = self.manager.abandon(&id).await?;
            return Ok(SessionOutcome::Abandoned {
                offset: record.checkpoint.offset,
            });
        }

        let entry = match self.manager.endpoint(&id).await {
            Ok(entry) => entry,
            Err(err) if err.needs_endpoint_refresh() => {
                if self.grace_elapsed(&record) {
                    warn!(
                        error = %err,
                        paused_since = %record.updated_at,
                        "No usable endpoint reference within the grace period, abandoning"
                    );
                    let record = self.manager.abandon(&id).await?;
                    return Ok(SessionOutcome::Abandoned {
                        offset: record.checkpoint.offset,
                    });
                }
                warn!(error = %err, "Transfer waits for a fresh endpoint reference");
                self.manager
                    .notify(&TransferEvent::EndpointRefreshRequired {
                        transfer_id: id.clone(),
                    })
                    .await;
                return Ok(SessionOutcome::AwaitingEndpoint);
            },
            Err(err) => return Err(err),
        };

        let capabilities = self.adapters.sink_capabilities(&record.descriptor.sink);
        let offset = self.manager.plan_resume(&record, capabilities).await?;

        self.manager
            .transition(&id, TransferState::Streaming)
            .await?;

        if let Some(boundary) = self.stop_requested(offset) {
            return self.settle(&id, boundary).await;
        }

        self.stream(&id, &record.descriptor, &entry.reference(), offset)
            .await
    }

    async fn stream(
        &self,
        id: &TransferId,
        descriptor: &TransferDescriptor,
        reference: &EndpointReference,
        offset: u64,
    ) -> Result<SessionOutcome> {
        let opened = self
            .retry
            .run("open source", self.call_timeout, || {
                self.adapters.open_source(&descriptor.source, reference)
            })
            .await;
        let mut source = match opened {
            Ok(source) => source,
            Err(err) => return self.fail(id, err).await,
        };

        let opened = self
            .retry
            .run("open sink", self.call_timeout, || {
                self.adapters.open_sink(&descriptor.sink, offset)
            })
            .await;
        let mut sink = match opened {
            Ok(sink) => sink,
            Err(err) => {
                close_source(source.as_mut()).await;
                return self.fail(id, err).await;
            },
        };

        info!(
            source = %source.describe(),
            sink = %sink.describe(),
            offset,
            total = ?source.total_len(),
            "Streaming"
        );

        let result = match self
            .pump(id, source.as_mut(), sink.as_mut(), offset)
            .await
        {
            Ok(Boundary::Exhausted(total)) => self.commit(sink.as_mut(), total).await,
            other => other,
        };

        close_source(source.as_mut()).await;
        close_sink(sink.as_mut()).await;

        match result {
            Ok(boundary) => self.settle(id, boundary).await,
            Err(err) => self.fail(id, err).await,
        }
    }

    async fn pump(
        &self,
        id: &TransferId,
        source: &mut dyn SourceHandle,
        sink: &mut dyn SinkHandle,
        start: u64,
    ) -> Result<Boundary> {
        let mut offset = start;
        let mut first_write = start > 0;
        let mut read_failures = 0u32;

        'reopen: loop {
            let mut chunks = source::read(&mut *source, offset, self.chunk_size);

            loop {
                if let Some(boundary) = self.stop_requested(offset) {
                    return Ok(boundary);
                }

                match with_deadline(self.call_timeout, chunks.try_next()).await {
                    Ok(Some(chunk)) => {
                        read_failures = 0;
                        self.deliver(id, sink, &chunk, first_write).await?;
                        first_write = false;

                        offset = chunk.end_offset();
                        let checkpoint = ChunkCheckpoint::new(
                            id.clone(),
                            offset,
                            Some(sha256_hex(&chunk.data)),
                        );
                        self.retry
                            .run("persist checkpoint", self.call_timeout, || {
                                self.manager.persist_checkpoint(checkpoint.clone())
                            })
                            .await?;
                        debug!(offset, bytes = chunk.len(), "Chunk delivered");
                    },
                    Ok(None) => return Ok(Boundary::Exhausted(offset)),
                    Err(err) if err.is_transient() => {
                        read_failures += 1;
                        let Some(delay) = self.retry.delay_after(read_failures) else {
                            return Err(exhausted(read_failures, err));
                        };
                        warn!(
                            offset,
                            attempt = read_failures,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Source read failed, reopening"
                        );
                        drop(chunks);
                        tokio::time::sleep(delay).await;
                        continue 'reopen;
                    },
                    Err(err) => return Err(err),
                }
            }
        }
    }

    /// Write one chunk, retrying the same buffer on transient failures.
    async fn deliver(
        &self,
        id: &TransferId,
        sink: &mut dyn SinkHandle,
        chunk: &Chunk,
        first_write: bool,
    ) -> Result<()> {
        let mut attempt = 0u32;
        let mut resent = 0u64;

        loop {
            attempt += 1;
            match with_deadline(self.call_timeout, sink.write(chunk)).await {
                Ok(written) => {
                    if first_write && written.resume_accepted == Some(false) {
                        return Err(TransferError::DestructiveResumeRequired {
                            transfer_id: id.clone(),
                            offset: chunk.offset,
                        });
                    }
                    if written.bytes_accepted < chunk.len() {
                        return Err(TransferError::permanent(format!(
                            "sink accepted {} of {} bytes at offset {}",
                            written.bytes_accepted,
                            chunk.len(),
                            chunk.offset
                        )));
                    }
                    return Ok(());
                },
                Err(err) if err.is_transient() => {
                    let Some(delay) = self.retry.delay_after(attempt) else {
                        return Err(exhausted(attempt, err));
                    };
                    resent += chunk.len() as u64;
                    if resent > self.sink_retry_budget {
                        return Err(TransferError::RetryBudgetExhausted {
                            budget: self.sink_retry_budget,
                            last: Box::new(err),
                        });
                    }
                    warn!(
                        offset = chunk.offset,
                        attempt,
                        resent,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Sink write failed, retrying chunk"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Finalize the artifact once. Never retried.
    async fn commit(&self, sink: &mut dyn SinkHandle, total: u64) -> Result<Boundary> {
        let receipt = match with_deadline(self.call_timeout, sink.commit(total)).await {
            Ok(receipt) => receipt,
            Err(TransferError::DeadlineExceeded(deadline)) => {
                return Err(TransferError::SinkCommitFailed(format!(
                    "commit did not finish within {deadline:?}"
                )));
            },
            Err(err) => return Err(err),
        };

        info!(
            total_bytes = receipt.total_bytes,
            reference = ?receipt.reference,
            "Sink committed"
        );
        Ok(Boundary::Exhausted(total))
    }

    async fn settle(&self, id: &TransferId, boundary: Boundary) -> Result<SessionOutcome> {
        match boundary {
            Boundary::Exhausted(bytes) => {
                self.manager.complete(id, bytes).await?;
                Ok(SessionOutcome::Completed { bytes })
            },
            Boundary::Paused(offset) => {
                self.manager
                    .transition(id, TransferState::Paused)
                    .await?;
                info!(offset, "Transfer paused");
                Ok(SessionOutcome::Paused { offset })
            },
            Boundary::Cancelled(offset) => {
                self.manager
                    .transition(id, TransferState::Paused)
                    .await?;
                self.manager.abandon(id).await?;
                Ok(SessionOutcome::Abandoned { offset })
            },
        }
    }

    async fn fail(&self, id: &TransferId, err: TransferError) -> Result<SessionOutcome> {
        if err.is_fatal() {
            error!(error = %err, "Transfer aborted");
        } else {
            warn!(error = %err, "Transfer failed");
        }

        let cause = err.to_cause();
        self.manager.fail(id, cause.clone()).await?;
        Ok(SessionOutcome::Failed(cause))
    }

    fn signal(&self) -> ControlSignal {
        *self.control.borrow()
    }

    /// A paused transfer expires once it has not moved for the grace period.
    fn grace_elapsed(&self, record: &TransferRecord) -> bool {
        let Some(grace) = self.endpoint_grace else {
            return false;
        };
        record.state == TransferState::Paused
            && chrono::Duration::from_std(grace)
                .is_ok_and(|grace| Utc::now() - record.updated_at >= grace)
    }

    fn stop_requested(&self, offset: u64) -> Option<Boundary> {
        match self.signal() {
            ControlSignal::Run => None,
            ControlSignal::Pause => Some(Boundary::Paused(offset)),
            ControlSignal::Cancel => Some(Boundary::Cancelled(offset)),
        }
    }
}

async fn close_source(source: &mut dyn SourceHandle) {
    if let Err(e) = source.close().await {
        warn!(source = %source.describe(), error = %e, "Failed to close source");
    }
}

async fn close_sink(sink: &mut dyn SinkHandle) {
    if let Err(e) = sink.close().await {
        warn!(sink = %sink.describe(), error = %e, "Failed to close sink");
    }
}
