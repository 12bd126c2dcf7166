//! Resolution of descriptor specs to concrete adapters

use async_trait::async_trait;
use reqwest::Client;

use crate::config::{TransferConfig, USER_AGENT};
use crate::descriptor::{join_endpoint, EndpointReference, SinkSpec, SourceSpec};
use crate::error::{Result, TransferError};
use crate::sink::{
    capabilities_for, HttpSink, MetadataPublishSink, RoutingSink, SinkCapabilities, SinkHandle,
};
use crate::source::{
    HttpStreamSource, LocalDirectorySource, LocalFileSource, ObjectLocation, ObjectPrefixSource,
    ObjectStorageSource, SourceHandle,
};

/// Opens the adapters named by a descriptor.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn open_source(
        &self,
        spec: &SourceSpec,
        endpoint: &EndpointReference,
    ) -> Result<Box<dyn SourceHandle>>;

    /// `start_offset` is the first byte the sink will receive.
    async fn open_sink(&self, spec: &SinkSpec, start_offset: u64) -> Result<Box<dyn SinkHandle>>;

    /// What the sink for `spec` will guarantee once opened. Consulted before
    /// opening to pick the resume offset.
    fn sink_capabilities(&self, spec: &SinkSpec) -> SinkCapabilities;
}

/// The built-in adapters sharing one HTTP connection pool.
#[derive(Clone)]
pub struct DefaultAdapters {
    client: Client,
    config: TransferConfig,
}

impl DefaultAdapters {
    pub fn new(config: &TransferConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.http_connect_timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransferError::permanent(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl AdapterFactory for DefaultAdapters {
    async fn open_source(
        &self,
        spec: &SourceSpec,
        endpoint: &EndpointReference,
    ) -> Result<Box<dyn SourceHandle>> {
        let source: Box<dyn SourceHandle> = match spec {
            SourceSpec::HttpStreaming { path } => {
                let url = join_endpoint(&endpoint.endpoint, path.as_deref());
                Box::new(HttpStreamSource::open(self.client.clone(), &url, &endpoint.credentials).await?)
            },
            SourceSpec::ObjectStorage {
                bucket,
                key,
                region,
                path_style,
            } => {
                let location = ObjectLocation {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    region: region.clone(),
                    path_style: *path_style,
                };
                Box::new(
                    ObjectStorageSource::open(endpoint, location, self.config.http_connect_timeout())
                        .await?,
                )
            },
            SourceSpec::LocalFile { path } => Box::new(LocalFileSource::open(path).await?),
            SourceSpec::LocalDirectory { path } => Box::new(LocalDirectorySource::open(path).await?),
            SourceSpec::ObjectPrefix {
                bucket,
                prefix,
                region,
                path_style,
            } => Box::new(
                ObjectPrefixSource::open(
                    endpoint,
                    bucket,
                    prefix,
                    region.as_deref(),
                    *path_style,
                    self.config.http_connect_timeout(),
                )
                .await?,
            ),
        };
        Ok(source)
    }

    async fn open_sink(&self, spec: &SinkSpec, start_offset: u64) -> Result<Box<dyn SinkHandle>> {
        let sink: Box<dyn SinkHandle> = match spec {
            SinkSpec::Http { .. } => Box::new(HttpSink::open(
                self.client.clone(),
                spec,
                self.config.sink_resume_granularity_bytes,
                start_offset,
            )
            .await?),
            SinkSpec::MetadataPublish { .. } => Box::new(
                MetadataPublishSink::open(self.client.clone(), spec, self.config.metadata_max_bytes)
                    .await?,
            ),
            SinkSpec::Routing { .. } => Box::new(
                RoutingSink::open(
                    self.client.clone(),
                    spec,
                    self.config.metadata_max_bytes,
                    start_offset,
                )
                .await?,
            ),
        };
        Ok(sink)
    }

    fn sink_capabilities(&self, spec: &SinkSpec) -> SinkCapabilities {
        capabilities_for(spec, self.config.sink_resume_granularity_bytes)
    }
}
