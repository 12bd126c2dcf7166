//! Control-plane notification

use async_trait::async_trait;
use dsc_common::types::{FailureCause, TransferId};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Something the control plane needs to hear about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Completed {
        transfer_id: TransferId,
        bytes: u64,
    },
    Failed {
        transfer_id: TransferId,
        cause: FailureCause,
    },
    Abandoned {
        transfer_id: TransferId,
        offset: u64,
    },
    /// A non-idempotent sink could not continue at `offset`; the transfer
    /// restarts from zero.
    DestructiveResumeRequired {
        transfer_id: TransferId,
        offset: u64,
        granularity: Option<u64>,
    },
    /// The endpoint reference is expired or missing; the transfer waits for
    /// a refresh.
    EndpointRefreshRequired {
        transfer_id: TransferId,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &TransferId {
        match self {
            TransferEvent::Completed { transfer_id, .. }
            | TransferEvent::Failed { transfer_id, .. }
            | TransferEvent::Abandoned { transfer_id, .. }
            | TransferEvent::DestructiveResumeRequired { transfer_id, .. }
            | TransferEvent::EndpointRefreshRequired { transfer_id } => transfer_id,
        }
    }
}

#[async_trait]
pub trait TransferObserver: Send + Sync {
    /// Delivery problems are the observer's own business and never fail the
    /// transfer.
    async fn notify(&self, event: &TransferEvent);
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

#[async_trait]
impl TransferObserver for LogObserver {
    async fn notify(&self, event: &TransferEvent) {
        match event {
            TransferEvent::Completed { transfer_id, bytes } => {
                info!(%transfer_id, bytes, "Transfer completed");
            },
            TransferEvent::Failed { transfer_id, cause } => {
                error!(%transfer_id, kind = %cause.kind, message = %cause.message, "Transfer failed");
            },
            TransferEvent::Abandoned { transfer_id, offset } => {
                info!(%transfer_id, offset, "Transfer abandoned");
            },
            TransferEvent::DestructiveResumeRequired {
                transfer_id,
                offset,
                granularity,
            } => {
                warn!(%transfer_id, offset, ?granularity, "Sink cannot resume, restarting from offset 0");
            },
            TransferEvent::EndpointRefreshRequired { transfer_id } => {
                warn!(%transfer_id, "Endpoint reference must be refreshed before the transfer can continue");
            },
        }
    }
}

/// Forwards events to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TransferObserver for ChannelObserver {
    async fn notify(&self, event: &TransferEvent) {
        if self.tx.send(event.clone()).is_err() {
            warn!(transfer_id = %event.transfer_id(), "Event receiver dropped");
        }
    }
}

/// POSTs each event as JSON to a control-plane callback URL.
#[derive(Debug, Clone)]
pub struct HttpCallbackObserver {
    client: Client,
    url: String,
}

impl HttpCallbackObserver {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TransferObserver for HttpCallbackObserver {
    async fn notify(&self, event: &TransferEvent) {
        match self.client.post(&self.url).json(event).send().await {
            Ok(response) if response.status().is_success() => {},
            Ok(response) => {
                warn!(
                    transfer_id = %event.transfer_id(),
                    url = %self.url,
                    status = response.status().as_u16(),
                    "Control plane rejected transfer event"
                );
            },
            Err(e) => {
                warn!(
                    transfer_id = %event.transfer_id(),
                    url = %self.url,
                    error = %e,
                    "Failed to deliver transfer event"
                );
            },
        }
    }
}

/// Delivers every event to each observer in turn.
pub struct Observers(pub Vec<std::sync::Arc<dyn TransferObserver>>);

#[async_trait]
impl TransferObserver for Observers {
    async fn notify(&self, event: &TransferEvent) {
        for observer in &self.0 {
            observer.notify(event).await;
        }
    }
}
