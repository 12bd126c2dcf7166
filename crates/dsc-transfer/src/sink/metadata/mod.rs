//! Metadata-publishing sink
//!
//! Buffers a JSON dataset description and registers it with a DCAT-AP hub
//! on commit, optionally followed by a distribution for the data file.

pub mod dcat;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, info, instrument, warn};

use super::{CommitReceipt, SinkCapabilities, SinkHandle, WriteResult};
use crate::descriptor::SinkSpec;
use crate::error::{Result, Side, TransferError};
use crate::source::{file_name, Chunk};

pub use dcat::{Dataset, DatasetMetadata};

const API_KEY_HEADER: &str = "X-API-Key";
const TURTLE: &str = "text/turtle";

pub struct MetadataPublishSink {
    hub: Hub,
    dataset_id: Option<String>,
    distribution_file: Option<String>,
    max_bytes: usize,
    buffer: Vec<u8>,
}

impl MetadataPublishSink {
    /// Probe the hub and prepare an empty document buffer.
    #[instrument(skip(client, spec))]
    pub async fn open(client: Client, spec: &SinkSpec, max_bytes: usize) -> Result<Self> {
        let SinkSpec::MetadataPublish {
            api_url,
            catalogue,
            api_key,
            dataset_id,
            distribution_file,
        } = spec
        else {
            return Err(TransferError::InvalidDescriptor(
                "metadata sink opened with a non-metadata sink spec".into(),
            ));
        };

        Ok(Self {
            hub: Hub::open(client, api_url, catalogue, api_key.as_deref()).await?,
            dataset_id: dataset_id.clone().filter(|id| !id.is_empty()),
            distribution_file: distribution_file.clone().filter(|f| !f.is_empty()),
            max_bytes,
            buffer: Vec::new(),
        })
    }
}

/// Client for one catalogue of a DCAT-AP hub.
pub(crate) struct Hub {
    client: Client,
    api_url: String,
    catalogue: String,
    api_key: Option<String>,
}

impl Hub {
    /// Fails when the hub rejects the key or cannot be reached.
    pub(crate) async fn open(
        client: Client,
        api_url: &str,
        catalogue: &str,
        api_key: Option<&str>,
    ) -> Result<Self> {
        let hub = Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            catalogue: catalogue.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()).map(str::to_string),
        };
        hub.check_reachable().await?;
        Ok(hub)
    }

    pub(crate) fn describe(&self) -> String {
        format!("{}?catalogue={}", self.api_url, self.catalogue)
    }

    pub(crate) fn dataset_uri(&self, dataset: &Dataset) -> String {
        dataset.uri(&self.api_url)
    }

    async fn check_reachable(&self) -> Result<()> {
        let response = self
            .with_key(self.client.head(&self.api_url))
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(Side::Sink, &e, "metadata hub check"))?;

        let status = response.status();
        match status.as_u16() {
            401 | 403 => Err(TransferError::from_status(
                Side::Sink,
                status.as_u16(),
                "metadata hub check",
            )),
            _ if status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED => {
                info!(api_url = %self.api_url, catalogue = %self.catalogue, "Metadata hub is reachable");
                Ok(())
            },
            code => {
                warn!(api_url = %self.api_url, status = code, "Metadata hub check returned unexpected status");
                Ok(())
            },
        }
    }

    fn with_key(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    pub(crate) async fn publish_dataset(&self, dataset: &Dataset) -> Result<()> {
        let turtle = dataset.to_turtle(&self.api_url);
        debug!(dataset_id = %dataset.id, "Generated DCAT-AP Turtle:\n{turtle}");

        let response = self
            .with_key(self.client.put(dataset.uri(&self.api_url)))
            .query(&[("catalogue", self.catalogue.as_str())])
            .header(CONTENT_TYPE, TURTLE)
            .header(ACCEPT, "application/json")
            .body(turtle)
            .send()
            .await
            .map_err(|e| TransferError::SinkCommitFailed(format!("dataset registration: {e}")))?;

        let status = response.status();
        if status.is_success() {
            info!(dataset_id = %dataset.id, status = status.as_u16(), "Dataset registered");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let msg = format!(
            "dataset registration answered HTTP {}: {}",
            status.as_u16(),
            body.trim()
        );
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(TransferError::SinkValidationFailed(msg))
            },
            _ => Err(TransferError::SinkCommitFailed(msg)),
        }
    }

    pub(crate) async fn publish_distribution(&self, dataset: &Dataset, path: &str) -> Result<String> {
        let name = file_name(path);
        let distribution_id = dcat::distribution_id(&name);
        let turtle = dcat::distribution_turtle(&self.api_url, &dataset.id, &name, &dataset.modified);

        let response = self
            .with_key(
                self.client
                    .post(format!("{}/distributions", dataset.uri(&self.api_url))),
            )
            .header(CONTENT_TYPE, TURTLE)
            .header(ACCEPT, "application/json")
            .body(turtle)
            .send()
            .await
            .map_err(|e| {
                TransferError::SinkCommitFailed(format!("distribution registration: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::SinkCommitFailed(format!(
                "distribution registration answered HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        info!(dataset_id = %dataset.id, %distribution_id, "Distribution registered");
        Ok(distribution_id)
    }
}

#[async_trait]
impl SinkHandle for MetadataPublishSink {
    fn describe(&self) -> String {
        self.hub.describe()
    }

    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities {
            idempotent_writes: false,
            resume_granularity: None,
        }
    }

    async fn write(&mut self, chunk: &Chunk) -> Result<WriteResult> {
        if self.buffer.len() + chunk.len() > self.max_bytes {
            return Err(TransferError::SinkValidationFailed(format!(
                "metadata document exceeds {} bytes",
                self.max_bytes
            )));
        }

        self.buffer.extend_from_slice(&chunk.data);
        Ok(WriteResult::accepted(chunk.len()))
    }

    #[instrument(skip(self))]
    async fn commit(&mut self, total_bytes: u64) -> Result<CommitReceipt> {
        let dataset = DatasetMetadata::parse(&self.buffer)
            .and_then(|metadata| {
                metadata.resolve(self.dataset_id.as_deref(), Utc::now().date_naive())
            })
            .map_err(TransferError::SinkValidationFailed)?;

        self.hub.publish_dataset(&dataset).await?;

        if let Some(path) = &self.distribution_file {
            self.hub.publish_distribution(&dataset, path).await?;
        }

        Ok(CommitReceipt {
            total_bytes,
            reference: Some(self.hub.dataset_uri(&dataset)),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.buffer = Vec::new();
        Ok(())
    }
}
