//! DSC Transfer Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resumable streaming data plane for data-space connectors.
//!
//! # Overview
//!
//! A transfer moves one payload from a source to a sink in fixed-size
//! chunks. After every chunk the sink acknowledges, the offset is
//! checkpointed durably, so an interrupted transfer continues where it
//! stopped instead of starting over.
//!
//! - **Adapters**: [`source`] (HTTP ranged reads, S3-compatible objects and
//!   prefixes, local files and directories) and [`sink`] (HTTP upload, DCAT
//!   metadata publishing, per-part routing), opened through an
//!   [`AdapterFactory`]
//! - **Sessions**: [`TransferSession`] runs the state machine and the chunk
//!   pump; [`TransferWorkerPool`] runs one session per active transfer
//! - **Recovery**: [`RecoveryManager`] owns state and checkpoints through a
//!   [`TransferStore`] (SQLite or in-memory) and reconciles after restarts
//! - **Endpoint references**: [`EndpointReferenceCache`] hands out the
//!   negotiated source address and credentials until they expire
//! - **Notification**: [`TransferObserver`] implementations tell the control
//!   plane about terminal states and required actions
//!
//! # Example
//!
//! ```no_run
//! use dsc_transfer::{
//!     DefaultAdapters, LogObserver, RecoveryManager, SqliteTransferStore, TransferConfig,
//!     TransferDescriptor, TransferWorkerPool,
//! };
//! use std::sync::Arc;
//!
//! # async fn run(descriptor: TransferDescriptor) -> anyhow::Result<()> {
//! let config = TransferConfig::load()?;
//! let store = SqliteTransferStore::connect("sqlite://transfers.db", 5).await?;
//! let manager = Arc::new(RecoveryManager::new(Arc::new(store), Arc::new(LogObserver)));
//! let pool = TransferWorkerPool::new(manager, Arc::new(DefaultAdapters::new(&config)?), &config);
//!
//! pool.recover().await?;
//! let id = pool.start(descriptor).await?;
//! println!("{:?}", pool.wait(&id).await?);
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod notify;
pub mod recovery;
pub mod retry;
pub mod session;
pub mod sink;
pub mod source;
pub mod store;
pub mod worker;

pub use adapters::{AdapterFactory, DefaultAdapters};
pub use config::{RetryConfig, TransferConfig};
pub use descriptor::{
    Credentials, EndpointReference, EndpointReferenceEntry, HttpSinkMode, SinkSpec, SourceSpec,
    TransferDescriptor,
};
pub use endpoint::EndpointReferenceCache;
pub use error::{FailureClass, Result, TransferError};
pub use notify::{
    ChannelObserver, HttpCallbackObserver, LogObserver, Observers, TransferEvent, TransferObserver,
};
pub use recovery::RecoveryManager;
pub use retry::RetryPolicy;
pub use session::{ControlSignal, SessionControl, SessionOutcome, TransferSession};
pub use sink::{CommitReceipt, SinkCapabilities, SinkHandle, WriteResult};
pub use source::{Chunk, SourceHandle};
pub use store::{MemoryTransferStore, SqliteTransferStore, TransferRecord, TransferStore};
pub use worker::TransferWorkerPool;
