use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_credential_types::Credentials as AccessKey;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::Client;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::snapshot::PartIndex;
use super::{Chunk, SourceHandle};
use crate::descriptor::{Credentials, EndpointReference};
use crate::error::{Result, TransferError};

const DEFAULT_REGION: &str = "us-east-1";

/// Location of the object inside the store.
#[derive(Debug, Clone)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
    pub region: Option<String>,
    pub path_style: bool,
}

/// One object in an S3-compatible store, read with a ranged `GetObject`
/// per chunk.
pub struct ObjectStorageSource {
    client: Client,
    bucket: String,
    key: String,
    len: u64,
    part_name: String,
}

impl ObjectStorageSource {
    #[instrument(skip(endpoint), fields(endpoint = %endpoint.endpoint))]
    pub async fn open(
        endpoint: &EndpointReference,
        location: ObjectLocation,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = build_client(
            endpoint,
            location.region.as_deref(),
            location.path_style,
            connect_timeout,
        )?;

        let head = client
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| classify(e, "HeadObject"))?;

        let len = head
            .content_length()
            .and_then(|len| u64::try_from(len).ok())
            .ok_or_else(|| {
                TransferError::permanent(format!(
                    "s3://{}/{} reported no content length",
                    location.bucket, location.key
                ))
            })?;

        info!(bucket = %location.bucket, key = %location.key, len, "Opened object storage source");

        Ok(Self {
            client,
            part_name: location.key.clone(),
            bucket: location.bucket,
            key: location.key,
            len,
        })
    }
}

/// Objects under a key prefix, listed once on open and read as one
/// multi-part payload in key order.
pub struct ObjectPrefixSource {
    client: Client,
    bucket: String,
    prefix: String,
    index: PartIndex,
}

impl ObjectPrefixSource {
    #[instrument(skip(endpoint), fields(endpoint = %endpoint.endpoint))]
    pub async fn open(
        endpoint: &EndpointReference,
        bucket: &str,
        prefix: &str,
        region: Option<&str>,
        path_style: bool,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = build_client(endpoint, region, path_style, connect_timeout)?;

        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| classify(e, "ListObjectsV2"))?;

            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                let size = object
                    .size()
                    .and_then(|size| u64::try_from(size).ok())
                    .unwrap_or(0);
                if key.ends_with('/') || size == 0 {
                    continue;
                }
                objects.push((key.to_string(), object.e_tag().map(str::to_string), size));
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }
        objects.sort_by(|a, b| a.0.cmp(&b.0));

        let mut seen = HashSet::new();
        let entries: Vec<(String, u64)> = objects
            .into_iter()
            .filter(|(key, etag, size)| match etag {
                Some(etag) if !seen.insert((etag.clone(), *size)) => {
                    debug!(%key, %etag, "Skipping object with duplicate content");
                    false
                },
                _ => true,
            })
            .map(|(key, _, size)| (key, size))
            .collect();

        let index = PartIndex::new(entries);
        info!(
            %bucket,
            %prefix,
            parts = index.parts().len(),
            len = index.total_len(),
            "Opened object prefix source"
        );

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            index,
        })
    }

    pub fn index(&self) -> &PartIndex {
        &self.index
    }
}

fn build_client(
    endpoint: &EndpointReference,
    region: Option<&str>,
    path_style: bool,
    connect_timeout: Duration,
) -> Result<Client> {
    let Credentials::AccessKey {
        access_key_id,
        secret_access_key,
        session_token,
    } = &endpoint.credentials
    else {
        return Err(TransferError::InvalidDescriptor(
            "object storage source needs access key credentials".into(),
        ));
    };

    let credentials = AccessKey::new(
        access_key_id,
        secret_access_key,
        session_token.clone(),
        None,
        "dsc-transfer",
    );

    let region = region.unwrap_or(DEFAULT_REGION).to_string();

    // No SDK retries; failures surface to the session.
    let config = aws_sdk_s3::Config::builder()
        .credentials_provider(credentials)
        .region(Region::new(region))
        .force_path_style(path_style)
        .endpoint_url(&endpoint.endpoint)
        .retry_config(RetryConfig::disabled())
        .timeout_config(
            TimeoutConfig::builder()
                .connect_timeout(connect_timeout)
                .build(),
        )
        .build();

    Ok(Client::from_conf(config))
}

fn classify<E>(err: SdkError<E, HttpResponse>, context: &str) -> TransferError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let msg = format!("{context}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            TransferError::SourceUnreachable(msg)
        },
        SdkError::ConstructionFailure(_) => TransferError::permanent(msg),
        _ => match err.raw_response().map(|r| r.status().as_u16()) {
            Some(401 | 403) => TransferError::SourceAuthFailed(msg),
            Some(status) if status == 408 || status == 429 || status >= 500 => {
                TransferError::transient(msg)
            },
            Some(_) => TransferError::permanent(msg),
            None => TransferError::transient(msg),
        },
    }
}

/// Inclusive HTTP byte range for one chunk.
fn byte_range(offset: u64, max_len: usize, len: u64) -> String {
    let end = offset.saturating_add(max_len as u64).min(len) - 1;
    format!("bytes={offset}-{end}")
}

#[async_trait]
impl SourceHandle for ObjectStorageSource {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.len)
    }

    async fn read_chunk(&mut self, offset: u64, max_len: usize) -> Result<Option<Chunk>> {
        if offset >= self.len || max_len == 0 {
            return Ok(None);
        }

        let range = byte_range(offset, max_len, self.len);
        debug!(object = %self.describe(), %range, "GetObject");

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .range(range)
            .send()
            .await
            .map_err(|e| classify(e, "GetObject"))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| TransferError::transient(format!("GetObject body: {e}")))?
            .into_bytes();

        if data.is_empty() {
            return Ok(None);
        }

        Ok(Some(Chunk::new(offset, data, Some(self.part_name.clone()))))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SourceHandle for ObjectPrefixSource {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.index.total_len())
    }

    async fn read_chunk(&mut self, offset: u64, max_len: usize) -> Result<Option<Chunk>> {
        let Some((index, len)) = self.index.span(offset, max_len) else {
            return Ok(None);
        };
        if len == 0 {
            return Ok(None);
        }
        let part = &self.index.parts()[index];
        let local = offset - part.start;

        let range = byte_range(local, len, part.len);
        debug!(key = %part.name, %range, "GetObject");

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&part.name)
            .range(range)
            .send()
            .await
            .map_err(|e| classify(e, "GetObject"))?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| TransferError::transient(format!("GetObject body: {e}")))?
            .into_bytes();

        if data.len() != len {
            return Err(TransferError::permanent(format!(
                "s3://{}/{} changed while the snapshot was transferring",
                self.bucket, part.name
            )));
        }

        Ok(Some(Chunk::new(offset, data, Some(part.name.clone()))))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
