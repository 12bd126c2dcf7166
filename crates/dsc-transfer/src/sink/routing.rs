//! Routing sink for multi-part snapshots
//!
//! Each part goes where its extension says: `.csv` data is appended to the
//! data lake through a `parts` HTTP sink, `.json` documents are published to
//! the metadata hub once the part is complete, and anything else is
//! acknowledged and dropped.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::path::Path;
use tracing::{debug, info, instrument};

use super::metadata::{DatasetMetadata, Hub};
use super::{CommitReceipt, HttpSink, SinkCapabilities, SinkHandle, WriteResult};
use crate::descriptor::{HttpSinkMode, SinkSpec};
use crate::error::{Result, TransferError};
use crate::source::Chunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Data,
    Metadata,
    Skip,
}

fn route(part: Option<&str>) -> Route {
    let extension = part
        .and_then(|name| Path::new(name).extension())
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match extension.as_deref() {
        Some("csv") => Route::Data,
        Some("json") => Route::Metadata,
        _ => Route::Skip,
    }
}

/// Name of the directory holding `part`, used as the dataset id when the
/// document does not carry one.
fn parent_dir(part: &str) -> Option<String> {
    Path::new(part)
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
}

pub struct RoutingSink {
    lake: HttpSink,
    hub: Hub,
    max_document_bytes: usize,
    document: Option<(String, Vec<u8>)>,
    forwarded: u64,
    published: Vec<String>,
}

impl RoutingSink {
    /// Opens the data lake and the hub. Both are checked with `HEAD`.
    #[instrument(skip(client, spec))]
    pub async fn open(
        client: Client,
        spec: &SinkSpec,
        max_document_bytes: usize,
        start_offset: u64,
    ) -> Result<Self> {
        let SinkSpec::Routing {
            url,
            auth_key,
            api_url,
            catalogue,
            api_key,
        } = spec
        else {
            return Err(TransferError::InvalidDescriptor(
                "routing sink opened with a non-routing sink spec".into(),
            ));
        };

        let lake_spec = SinkSpec::Http {
            url: url.clone(),
            mode: HttpSinkMode::Parts,
            auth_key: auth_key.clone(),
            part_name: None,
            resume_granularity: None,
        };
        let lake = HttpSink::open(client.clone(), &lake_spec, 0, start_offset).await?;
        let hub = Hub::open(client, api_url, catalogue, api_key.as_deref()).await?;

        debug!(lake = %url, hub = %hub.describe(), "Opened routing sink");

        Ok(Self {
            lake,
            hub,
            max_document_bytes,
            document: None,
            forwarded: 0,
            published: Vec::new(),
        })
    }

    /// Publishes the buffered document, if any.
    async fn finish_document(&mut self) -> Result<()> {
        let Some((part, buffer)) = self.document.take() else {
            return Ok(());
        };

        let dataset = DatasetMetadata::parse(&buffer)
            .and_then(|metadata| {
                let dataset_id = metadata.dataset_id.clone().or_else(|| parent_dir(&part));
                metadata.resolve(dataset_id.as_deref(), Utc::now().date_naive())
            })
            .map_err(|e| TransferError::SinkValidationFailed(format!("{part}: {e}")))?;

        self.hub.publish_dataset(&dataset).await?;
        self.published.push(self.hub.dataset_uri(&dataset));
        Ok(())
    }
}

#[async_trait]
impl SinkHandle for RoutingSink {
    fn describe(&self) -> String {
        format!("{} + {}", self.lake.describe(), self.hub.describe())
    }

    fn capabilities(&self) -> SinkCapabilities {
        SinkCapabilities::default()
    }

    #[instrument(skip(self, chunk), fields(offset = chunk.offset, part = ?chunk.part_name))]
    async fn write(&mut self, chunk: &Chunk) -> Result<WriteResult> {
        let part = chunk.part_name.as_deref();
        if self
            .document
            .as_ref()
            .is_some_and(|(name, _)| Some(name.as_str()) != part)
        {
            self.finish_document().await?;
        }

        match route(part) {
            Route::Data => {
                let result = self.lake.write(chunk).await?;
                self.forwarded += result.bytes_accepted as u64;
                Ok(result)
            },
            Route::Metadata => {
                let name = part.unwrap_or_default();
                let (_, buffer) = self
                    .document
                    .get_or_insert_with(|| (name.to_string(), Vec::new()));
                if buffer.len() + chunk.len() > self.max_document_bytes {
                    return Err(TransferError::SinkValidationFailed(format!(
                        "{name}: metadata document exceeds {} bytes",
                        self.max_document_bytes
                    )));
                }
                buffer.extend_from_slice(&chunk.data);
                Ok(WriteResult::accepted(chunk.len()))
            },
            Route::Skip => {
                debug!("No route for part, dropping chunk");
                Ok(WriteResult::accepted(chunk.len()))
            },
        }
    }

    #[instrument(skip(self))]
    async fn commit(&mut self, total_bytes: u64) -> Result<CommitReceipt> {
        self.finish_document().await?;

        if self.forwarded > 0 {
            self.lake.commit(self.forwarded).await?;
        }

        info!(
            total_bytes,
            forwarded = self.forwarded,
            datasets = self.published.len(),
            "Routing sink committed"
        );

        Ok(CommitReceipt {
            total_bytes,
            reference: Some(self.lake.describe()),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.document = None;
        self.lake.close().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec(server: &MockServer) -> SinkSpec {
        SinkSpec::Routing {
            url: format!("{}/lake", server.uri()),
            auth_key: Some("lake-key".into()),
            api_url: format!("{}/datasets", server.uri()),
            catalogue: "city-lab".into(),
            api_key: Some("hub-key".into()),
        }
    }

    async fn reachable() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    fn chunk(offset: u64, data: &str, part: &str) -> Chunk {
        Chunk::new(offset, data.as_bytes().to_vec(), Some(part.to_string()))
    }

    #[test]
    fn test_routes_by_extension() {
        assert_eq!(route(Some("air/readings.CSV")), Route::Data);
        assert_eq!(route(Some("air/meta.json")), Route::Metadata);
        assert_eq!(route(Some("air/notes.txt")), Route::Skip);
        assert_eq!(route(Some("README")), Route::Skip);
        assert_eq!(route(None), Route::Skip);
        assert_eq!(parent_dir("2026/air/meta.json").as_deref(), Some("air"));
        assert_eq!(parent_dir("meta.json"), None);
    }

    #[tokio::test]
    async fn test_snapshot_parts_are_routed() {
        let server = reachable().await;
        Mock::given(method("POST"))
            .and(path("/lake"))
            .and(header("Authorization", "Bearer lake-key"))
            .and(header("X-File-Name", "readings.csv"))
            .and(header("X-File-Path", "air/readings.csv"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/datasets/air"))
            .and(query_param("catalogue", "city-lab"))
            .and(header("X-API-Key", "hub-key"))
            .and(body_string_contains("Air quality"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let mut sink = RoutingSink::open(Client::new(), &spec(&server), 4096, 0)
            .await
            .unwrap();
        assert_eq!(sink.capabilities(), SinkCapabilities::default());

        let meta_head = r#"{"title": "Air "#;
        let meta_tail = r#"quality"}"#;
        let parts = [
            chunk(0, meta_head, "air/meta.json"),
            chunk(15, meta_tail, "air/meta.json"),
            chunk(24, "a,b\n1,2\n", "air/readings.csv"),
            chunk(32, "ignored", "air/notes.txt"),
        ];
        for part in &parts {
            let result = sink.write(part).await.unwrap();
            assert_eq!(result.bytes_accepted, part.len());
        }
        let receipt = sink.commit(39).await.unwrap();
        assert_eq!(receipt.total_bytes, 39);
        assert_eq!(sink.forwarded, 8);
        assert_eq!(sink.published, vec![format!("{}/datasets/air", server.uri())]);

        let lake_bodies: Vec<Vec<u8>> = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.url.path() == "/lake" && r.method.as_str() == "POST" && !r.body.is_empty())
            .map(|r| r.body)
            .collect();
        assert_eq!(lake_bodies, vec![b"a,b\n1,2\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_invalid_document_fails_before_hub() {
        let server = reachable().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let mut sink = RoutingSink::open(Client::new(), &spec(&server), 4096, 0)
            .await
            .unwrap();
        sink.write(&chunk(0, "[1, 2]", "air/meta.json")).await.unwrap();

        let err = sink
            .write(&chunk(6, "x", "air/other.txt"))
            .await
            .unwrap_err();
        match err {
            TransferError::SinkValidationFailed(msg) => assert!(msg.starts_with("air/meta.json")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_hub_key_fails_open() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/lake"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/datasets"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = RoutingSink::open(Client::new(), &spec(&server), 4096, 0)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::SinkAuthFailed(_)));
    }
}
