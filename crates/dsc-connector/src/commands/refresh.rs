//! Refresh-endpoint command implementation

use crate::config::ConnectorConfig;
use crate::error::Result;
use dsc_common::types::TransferId;
use dsc_transfer::{EndpointReference, EndpointReferenceEntry, LogObserver};
use std::path::Path;
use std::sync::Arc;

/// Store a renewed endpoint reference. A transfer waiting for one is picked
/// up by the next `run`.
pub async fn run(config: &ConnectorConfig, transfer_id: &str, file: &Path) -> Result<()> {
    let reference: EndpointReference = super::read_json(file).await?;
    let id = TransferId::from(transfer_id);

    let (store, manager) = super::open_manager(config, Arc::new(LogObserver)).await?;
    let refreshed = manager
        .refresh_endpoint(EndpointReferenceEntry::new(id.clone(), &reference))
        .await;
    store.close().await;
    refreshed?;

    match reference.expires_at {
        Some(expires_at) => println!("Endpoint reference for {id} valid until {expires_at}"),
        None => println!("Endpoint reference for {id} refreshed"),
    }
    Ok(())
}
