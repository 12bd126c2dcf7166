//! Cancel command implementation

use crate::config::ConnectorConfig;
use crate::error::Result;
use dsc_common::types::TransferId;
use dsc_transfer::{LogObserver, TransferRecord};
use std::sync::Arc;
use tracing::info;

/// Abandon a paused transfer. A transfer still streaming in a running host
/// must be paused there first.
pub async fn run(config: &ConnectorConfig, transfer_id: &str) -> Result<TransferRecord> {
    let (store, manager) = super::open_manager(config, Arc::new(LogObserver)).await?;
    let id = TransferId::from(transfer_id);
    let abandoned = manager.abandon(&id).await;
    store.close().await;

    let record = abandoned?;
    info!(transfer_id = %id, offset = record.checkpoint.offset, "Transfer abandoned");
    println!(
        "Transfer {} abandoned at offset {}",
        id, record.checkpoint.offset
    );
    Ok(record)
}
