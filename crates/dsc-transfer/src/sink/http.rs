use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use tracing::{debug, info, instrument, warn};

use super::{capabilities_for, CommitReceipt, SinkCapabilities, SinkHandle, WriteResult};
use crate::descriptor::{HttpSinkMode, SinkSpec};
use crate::error::{Result, Side, TransferError};
use crate::source::{file_name, Chunk};

const OCTET_STREAM: &str = "application/octet-stream";

/// Generic HTTP data sink.
///
/// `ranged` mode PUTs every chunk with a `Content-Range` and can replay any
/// range. `parts` mode POSTs chunks for the receiver to append, tagged with
/// the part path so the receiver can route them.
pub struct HttpSink {
    client: Client,
    url: String,
    mode: HttpSinkMode,
    auth_key: Option<String>,
    part_name: Option<String>,
    resume_granularity: Option<u64>,
    start_offset: u64,
    writes: u64,
    last_part: Option<String>,
}

impl HttpSink {
    /// `default_granularity` applies to `parts` mode when the descriptor
    /// does not declare one; zero means no safe resume point.
    ///
    /// The endpoint is checked with `HEAD`. Rejected credentials and refused
    /// connections fail the open; any other answer is left to the writes.
    #[instrument(skip(client, spec))]
    pub async fn open(
        client: Client,
        spec: &SinkSpec,
        default_granularity: u64,
        start_offset: u64,
    ) -> Result<Self> {
        let SinkSpec::Http {
            url,
            mode,
            auth_key,
            part_name,
            ..
        } = spec
        else {
            return Err(TransferError::InvalidDescriptor(
                "HTTP sink opened with a non-HTTP sink spec".into(),
            ));
        };

        let resume_granularity = capabilities_for(spec, default_granularity).resume_granularity;

        let sink = Self {
            client,
            url: url.clone(),
            mode: *mode,
            auth_key: auth_key.clone().filter(|k| !k.is_empty()),
            part_name: part_name.clone(),
            resume_granularity,
            start_offset,
            writes: 0,
            last_part: None,
        };
        sink.check_reachable().await?;

        debug!(url = %url, ?mode, start_offset, ?resume_granularity, "Opened HTTP sink");
        Ok(sink)
    }

    async fn check_reachable(&self) -> Result<()> {
        let response = self
            .authorize(self.client.head(&self.url))
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(Side::Sink, &e, "sink check"))?;

        let status = response.status().as_u16();
        match status {
            401 | 403 => Err(TransferError::from_status(Side::Sink, status, "sink check")),
            _ => {
                debug!(status, "HTTP sink reachable");
                Ok(())
            },
        }
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.auth_key {
            Some(key) => builder.header(AUTHORIZATION, format!("Bearer {key}")),
            None => builder,
        }
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        self.authorize(builder.header(CONTENT_TYPE, OCTET_STREAM))
    }

    fn resuming(&self) -> bool {
        self.writes == 0 && self.start_offset > 0 && self.mode == HttpSinkMode::Ranged
    }

    fn part_path(&self, chunk: Option<&Chunk>) -> String {
        self.part_name
            .clone()
            .or_else(|| chunk.and_then(|c| c.part_name.clone()))
            .or_else(|| self.last_part.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[async_trait]
impl SinkHandle for HttpSink {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities {
            idempotent_writes: self.mode == HttpSinkMode::Ranged,
            resume_granularity: self.resume_granularity,
        }
    }

    #[instrument(skip(self, chunk), fields(offset = chunk.offset, len = chunk.len()))]
    async fn write(&mut self, chunk: &Chunk) -> Result<WriteResult> {
        if chunk.is_empty() {
            return Ok(WriteResult::accepted(0));
        }

        let request = match self.mode {
            HttpSinkMode::Ranged => self.request(self.client.put(&self.url)).header(
                CONTENT_RANGE,
                format!("bytes {}-{}/*", chunk.offset, chunk.end_offset() - 1),
            ),
            HttpSinkMode::Parts => {
                let path = self.part_path(Some(chunk));
                self.request(self.client.post(&self.url))
                    .header("X-File-Name", file_name(&path))
                    .header("X-File-Path", path)
                    .header("X-Chunk-Offset", chunk.offset.to_string())
            },
        };

        let response = request
            .body(chunk.data.clone())
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(Side::Sink, &e, "chunk upload"))?;

        let status = response.status().as_u16();
        if self.resuming() && matches!(status, 409 | 416) {
            warn!(status, offset = chunk.offset, "Sink refused to continue the artifact");
            return Ok(WriteResult {
                bytes_accepted: 0,
                resume_accepted: Some(false),
            });
        }
        if !(200..300).contains(&status) {
            return Err(TransferError::from_status(Side::Sink, status, "chunk upload"));
        }

        let resume_accepted = self.resuming().then_some(true);
        self.writes += 1;
        if chunk.part_name.is_some() {
            self.last_part.clone_from(&chunk.part_name);
        }

        Ok(WriteResult {
            bytes_accepted: chunk.len(),
            resume_accepted,
        })
    }

    #[instrument(skip(self))]
    async fn commit(&mut self, total_bytes: u64) -> Result<CommitReceipt> {
        let request = match self.mode {
            HttpSinkMode::Ranged => self
                .request(self.client.put(&self.url))
                .header(CONTENT_RANGE, format!("bytes */{total_bytes}")),
            HttpSinkMode::Parts => self
                .request(self.client.post(&self.url))
                .header("X-File-Path", self.part_path(None))
                .header("X-Transfer-Complete", "true")
                .header("X-Total-Length", total_bytes.to_string()),
        };

        let response = request
            .body(Vec::new())
            .send()
            .await
            .map_err(|e| TransferError::SinkCommitFailed(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::SinkCommitFailed(format!(
                "{} answered HTTP {}: {}",
                self.url,
                status.as_u16(),
                body.trim()
            )));
        }

        info!(total_bytes, "HTTP sink committed");

        Ok(CommitReceipt {
            total_bytes,
            reference: Some(self.url.clone()),
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
