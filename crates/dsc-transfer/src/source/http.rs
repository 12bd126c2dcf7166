use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument, warn};

use super::{file_name, Chunk, SourceHandle};
use crate::descriptor::Credentials;
use crate::error::{Result, Side, TransferError};

/// Open ranged GET whose body has been consumed up to `position`.
struct OpenBody {
    position: u64,
    response: Response,
    leftover: Bytes,
}

/// Streams a payload over HTTP. One ranged GET stays open across chunks and
/// is re-issued only when a read is requested at a different offset.
pub struct HttpStreamSource {
    client: Client,
    url: String,
    credentials: Credentials,
    total_len: Option<u64>,
    body: Option<OpenBody>,
    part_name: String,
}

impl HttpStreamSource {
    #[instrument(skip(client, credentials))]
    pub async fn open(client: Client, url: &str, credentials: &Credentials) -> Result<Self> {
        if matches!(credentials, Credentials::AccessKey { .. }) {
            return Err(TransferError::InvalidDescriptor(
                "access key credentials cannot authenticate an HTTP source".into(),
            ));
        }

        let head = authorize(client.head(url), credentials)
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(Side::Source, &e, "HEAD"))?;

        let status = head.status();
        let total_len = if status.is_success() {
            head
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
        } else if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            debug!(url, "Source does not answer HEAD, length unknown");
            None
        } else {
            return Err(TransferError::from_status(Side::Source, status.as_u16(), "HEAD"));
        };

        debug!(url, ?total_len, "Opened HTTP source");

        Ok(Self {
            client,
            url: url.to_string(),
            credentials: credentials.clone(),
            total_len,
            body: None,
            part_name: file_name(url.split(['?', '#']).next().unwrap_or(url)),
        })
    }

    async fn request_from(&self, offset: u64) -> Result<Option<OpenBody>> {
        let response = authorize(self.client.get(&self.url), &self.credentials)
            .header(RANGE, format!("bytes={offset}-"))
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(Side::Source, &e, "GET"))?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {},
            StatusCode::OK if offset == 0 => {},
            StatusCode::OK => {
                return Err(TransferError::permanent(format!(
                    "{} ignored Range request at offset {offset}",
                    self.url
                )));
            },
            StatusCode::RANGE_NOT_SATISFIABLE => return Ok(None),
            status => {
                return Err(TransferError::from_status(
                    Side::Source,
                    status.as_u16(),
                    "GET",
                ))
            },
        }

        Ok(Some(OpenBody {
            position: offset,
            response,
            leftover: Bytes::new(),
        }))
    }
}

fn authorize(request: RequestBuilder, credentials: &Credentials) -> RequestBuilder {
    match credentials {
        Credentials::Bearer { token } => request.bearer_auth(token),
        Credentials::Header { name, value } => request.header(name.as_str(), value.as_str()),
        Credentials::None | Credentials::AccessKey { .. } => request,
    }
}

#[async_trait]
impl SourceHandle for HttpStreamSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn total_len(&self) -> Option<u64> {
        self.total_len
    }

    async fn read_chunk(&mut self, offset: u64, max_len: usize) -> Result<Option<Chunk>> {
        if self.total_len.is_some_and(|len| offset >= len) {
            return Ok(None);
        }

        if self.body.as_ref().is_some_and(|b| b.position != offset) {
            debug!(url = %self.url, offset, "Re-issuing ranged GET");
            self.body = None;
        }

        let mut body = match self.body.take() {
            Some(body) => body,
            None => match self.request_from(offset).await? {
                Some(body) => body,
                None => return Ok(None),
            },
        };

        let mut buf = BytesMut::with_capacity(max_len);
        let mut leftover = std::mem::take(&mut body.leftover);
        let mut exhausted = false;

        loop {
            if !leftover.is_empty() {
                let take = leftover.len().min(max_len - buf.len());
                buf.extend_from_slice(&leftover.split_to(take));
            }
            if buf.len() >= max_len {
                break;
            }
            match body.response.chunk().await {
                Ok(Some(bytes)) => leftover = bytes,
                Ok(None) => {
                    exhausted = true;
                    break;
                },
                Err(e) => {
                    warn!(url = %self.url, offset, error = %e, "Body read failed, dropping stream");
                    return Err(TransferError::from_reqwest(Side::Source, &e, "GET body"));
                },
            }
        }

        let data = buf.freeze();
        body.position = offset + data.len() as u64;
        body.leftover = leftover;
        if exhausted {
            self.total_len.get_or_insert(body.position);
        } else {
            self.body = Some(body);
        }

        if data.is_empty() {
            return Ok(None);
        }

        Ok(Some(Chunk::new(offset, data, Some(self.part_name.clone()))))
    }

    async fn close(&mut self) -> Result<()> {
        self.body = None;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 199) as u8).collect()
    }

    async fn server_with(data: &[u8]) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/exports/readings.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/exports/readings.csv"))
            .and(header("Range", "bytes=0-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(data.to_vec()))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_reads_whole_payload_over_one_request() {
        let data = payload(300);
        let server = server_with(&data).await;
        let url = format!("{}/exports/readings.csv", server.uri());

        let mut source = HttpStreamSource::open(Client::new(), &url, &Credentials::None)
            .await
            .unwrap();

        let mut collected = Vec::new();
        let mut offset = 0;
        while let Some(chunk) = source.read_chunk(offset, 100).await.unwrap() {
            assert_eq!(chunk.offset, offset);
            assert!(chunk.len() <= 100);
            assert_eq!(chunk.part_name.as_deref(), Some("readings.csv"));
            offset = chunk.end_offset();
            collected.extend_from_slice(&chunk.data);
        }

        assert_eq!(collected, data);
        assert_eq!(source.total_len(), Some(300));
        let gets = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.as_str() == "GET")
            .count();
        assert_eq!(gets, 1);
    }

    #[tokio::test]
    async fn test_resume_reissues_range_at_offset() {
        let data = payload(300);
        let server = server_with(&data).await;
        Mock::given(method("GET"))
            .and(path("/exports/readings.csv"))
            .and(header("Range", "bytes=200-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(data[200..].to_vec()))
            .mount(&server)
            .await;
        let url = format!("{}/exports/readings.csv", server.uri());

        let mut source = HttpStreamSource::open(Client::new(), &url, &Credentials::None)
            .await
            .unwrap();
        let chunk = source.read_chunk(200, 100).await.unwrap().unwrap();
        assert_eq!(&chunk.data[..], &data[200..]);
    }

    #[tokio::test]
    async fn test_ignored_range_is_permanent() {
        let data = payload(50);
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data))
            .mount(&server)
            .await;

        let mut source = HttpStreamSource::open(Client::new(), &server.uri(), &Credentials::None)
            .await
            .unwrap();
        assert_eq!(source.total_len(), None);

        let err = source.read_chunk(10, 10).await.unwrap_err();
        assert!(matches!(err, TransferError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(header("Authorization", "Bearer expired"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let creds = Credentials::Bearer {
            token: "expired".into(),
        };
        let err = HttpStreamSource::open(Client::new(), &server.uri(), &creds)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::SourceAuthFailed(_)));
    }
}
