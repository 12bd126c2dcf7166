//! Status command implementation

use crate::config::ConnectorConfig;
use crate::error::Result;
use chrono::{DateTime, Utc};
use dsc_common::types::{FailureCause, TransferId, TransferState};
use dsc_transfer::{
    EndpointReferenceEntry, LogObserver, RecoveryManager, SinkSpec, SourceSpec, TransferRecord,
};
use serde::Serialize;
use std::sync::Arc;

/// Transfer record as shown to operators. Credentials never leave the
/// database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferSummary {
    pub transfer_id: TransferId,
    pub state: TransferState,
    pub offset: u64,
    pub source: String,
    pub sink: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TransferSummary {
    /// `endpoint` is the live endpoint entry; terminal transfers have none.
    pub fn new(record: &TransferRecord, endpoint: Option<&EndpointReferenceEntry>) -> Self {
        let source = match &record.descriptor.source {
            SourceSpec::HttpStreaming { path } => match path {
                Some(path) => format!("http:{path}"),
                None => "http".to_string(),
            },
            SourceSpec::ObjectStorage { bucket, key, .. } => format!("s3://{bucket}/{key}"),
            SourceSpec::LocalFile { path } => format!("file://{}", path.display()),
            SourceSpec::LocalDirectory { path } => format!("file://{}/", path.display()),
            SourceSpec::ObjectPrefix { bucket, prefix, .. } => format!("s3://{bucket}/{prefix}"),
        };
        let sink = match &record.descriptor.sink {
            SinkSpec::Http { url, .. } => url.clone(),
            SinkSpec::MetadataPublish {
                api_url, catalogue, ..
            } => format!("{api_url} (catalogue {catalogue})"),
            SinkSpec::Routing {
                url,
                api_url,
                catalogue,
                ..
            } => format!("{url} + {api_url} (catalogue {catalogue})"),
        };

        Self {
            transfer_id: record.id().clone(),
            state: record.state,
            offset: record.checkpoint.offset,
            source,
            sink,
            failure: record.failure.clone(),
            endpoint_expires_at: endpoint.and_then(|entry| entry.expires_at),
            updated_at: record.updated_at,
        }
    }
}

/// Summaries for one transfer, or for all of them ordered by id.
pub async fn collect(
    manager: &RecoveryManager,
    transfer_id: Option<&str>,
) -> Result<Vec<TransferSummary>> {
    let records = match transfer_id {
        Some(id) => vec![manager.record(&TransferId::from(id)).await?],
        None => {
            let mut records = manager.list().await?;
            records.sort_by(|a, b| a.id().cmp(b.id()));
            records
        },
    };

    let mut summaries = Vec::with_capacity(records.len());
    for record in &records {
        let endpoint = manager.store().get_endpoint(record.id()).await?;
        summaries.push(TransferSummary::new(record, endpoint.as_ref()));
    }
    Ok(summaries)
}

pub async fn run(config: &ConnectorConfig, transfer_id: Option<&str>) -> Result<()> {
    let (store, manager) = super::open_manager(config, Arc::new(LogObserver)).await?;
    let summaries = collect(&manager, transfer_id).await;
    store.close().await;

    let summaries = summaries?;
    if transfer_id.is_none() && summaries.is_empty() {
        println!("No transfers recorded.");
        return Ok(());
    }

    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}
