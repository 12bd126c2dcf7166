//! Transfer descriptors supplied by the control plane

use chrono::{DateTime, Utc};
use dsc_common::types::TransferId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, TransferError};

/// Immutable request to move one payload from a source to a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    pub transfer_id: TransferId,
    pub source: SourceSpec,
    pub sink: SinkSpec,
    pub endpoint: EndpointReference,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceSpec {
    /// Ranged GETs against the endpoint reference URL, optionally joined
    /// with `path`.
    HttpStreaming {
        #[serde(default)]
        path: Option<String>,
    },

    /// One object in an S3-compatible store reached through the endpoint
    /// reference.
    ObjectStorage {
        bucket: String,
        key: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default = "default_true")]
        path_style: bool,
    },

    LocalFile { path: PathBuf },

    /// Every regular file under a directory, read in path order as one
    /// multi-part payload. Files with identical content are read once.
    LocalDirectory { path: PathBuf },

    /// Every object under a key prefix, read in key order as one multi-part
    /// payload. Directory markers and objects repeating an earlier ETag and
    /// size are left out.
    ObjectPrefix {
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default = "default_true")]
        path_style: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SinkSpec {
    Http {
        url: String,
        #[serde(default)]
        mode: HttpSinkMode,
        /// Sent as `Authorization: Bearer ...`
        #[serde(default)]
        auth_key: Option<String>,
        /// Overrides the part name reported by the source
        #[serde(default)]
        part_name: Option<String>,
        /// Offsets that are multiples of this value are safe resume points
        /// for `parts` mode
        #[serde(default)]
        resume_granularity: Option<u64>,
    },

    MetadataPublish {
        api_url: String,
        catalogue: String,
        #[serde(default)]
        api_key: Option<String>,
        /// Falls back to `datasetId` inside the document
        #[serde(default)]
        dataset_id: Option<String>,
        /// Registers a distribution for this file after the dataset
        #[serde(default)]
        distribution_file: Option<String>,
    },

    /// Routes snapshot parts by extension: `.csv` to the data lake at `url`
    /// as `parts` uploads, `.json` to the metadata hub. Other parts are
    /// dropped.
    Routing {
        url: String,
        #[serde(default)]
        auth_key: Option<String>,
        api_url: String,
        catalogue: String,
        #[serde(default)]
        api_key: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpSinkMode {
    /// `PUT` with `Content-Range`; replaying a range is harmless
    Ranged,
    /// One `POST` per chunk; the receiver appends
    #[default]
    Parts,
}

/// Negotiated address and credentials for the source side of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointReference {
    pub endpoint: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Credential material. Opaque to the engine; only adapters interpret it.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Header {
        name: String,
        value: String,
    },
    AccessKey {
        access_key_id: String,
        secret_access_key: String,
        #[serde(default)]
        session_token: Option<String>,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Bearer { .. } => f.write_str("Bearer(***)"),
            Credentials::Header { name, .. } => write!(f, "Header({name}: ***)"),
            Credentials::AccessKey { access_key_id, .. } => {
                write!(f, "AccessKey({access_key_id}, ***)")
            },
        }
    }
}

/// Cached endpoint reference, keyed by transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointReferenceEntry {
    pub transfer_id: TransferId,
    pub endpoint: String,
    pub credentials: Credentials,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EndpointReferenceEntry {
    pub fn new(transfer_id: TransferId, reference: &EndpointReference) -> Self {
        Self {
            transfer_id,
            endpoint: reference.endpoint.clone(),
            credentials: reference.credentials.clone(),
            expires_at: reference.expires_at,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    pub fn reference(&self) -> EndpointReference {
        EndpointReference {
            endpoint: self.endpoint.clone(),
            credentials: self.credentials.clone(),
            expires_at: self.expires_at,
        }
    }
}

impl TransferDescriptor {
    pub fn new(transfer_id: TransferId, source: SourceSpec, sink: SinkSpec, endpoint: EndpointReference) -> Self {
        Self {
            transfer_id,
            source,
            sink,
            endpoint,
            created_at: Utc::now(),
        }
    }

    /// Copy kept in the transfer record. Credentials and expiry live only in
    /// the endpoint reference entry, which is destroyed at terminal state.
    pub fn persisted(&self) -> Self {
        let mut copy = self.clone();
        copy.endpoint.credentials = Credentials::None;
        copy.endpoint.expires_at = None;
        copy
    }

    /// Structural checks run before admission. Reachability is checked by
    /// the adapters when they open.
    pub fn validate(&self) -> Result<()> {
        if self.transfer_id.as_str().trim().is_empty() {
            return Err(invalid("transfer id must not be empty"));
        }

        if let Some(expiry) = self.endpoint.expires_at {
            if expiry <= Utc::now() {
                return Err(TransferError::EndpointExpired(self.transfer_id.clone()));
            }
        }

        match &self.source {
            SourceSpec::HttpStreaming { .. } => {
                require_http_url(&self.endpoint.endpoint, "endpoint reference")?;
            },
            SourceSpec::ObjectStorage { bucket, key, .. } => {
                if bucket.is_empty() || key.is_empty() {
                    return Err(invalid("object storage source needs a bucket and a key"));
                }
                if key.ends_with('/') {
                    return Err(invalid(format!("object key '{key}' names a directory marker")));
                }
                require_http_url(&self.endpoint.endpoint, "object storage endpoint")?;
                if !matches!(self.endpoint.credentials, Credentials::AccessKey { .. }) {
                    return Err(invalid("object storage source needs access key credentials"));
                }
            },
            SourceSpec::LocalFile { path } | SourceSpec::LocalDirectory { path } => {
                if path.as_os_str().is_empty() {
                    return Err(invalid("local source needs a path"));
                }
            },
            SourceSpec::ObjectPrefix { bucket, .. } => {
                if bucket.is_empty() {
                    return Err(invalid("object prefix source needs a bucket"));
                }
                require_http_url(&self.endpoint.endpoint, "object storage endpoint")?;
                if !matches!(self.endpoint.credentials, Credentials::AccessKey { .. }) {
                    return Err(invalid("object storage source needs access key credentials"));
                }
            },
        }

        match &self.sink {
            SinkSpec::Http {
                url,
                resume_granularity,
                ..
            } => {
                require_http_url(url, "HTTP sink url")?;
                if *resume_granularity == Some(0) {
                    return Err(invalid("resume granularity must be positive when set"));
                }
            },
            SinkSpec::MetadataPublish {
                api_url, catalogue, ..
            } => {
                require_http_url(api_url, "metadata API url")?;
                if catalogue.trim().is_empty() {
                    return Err(invalid("metadata sink needs a catalogue"));
                }
            },
            SinkSpec::Routing {
                url,
                api_url,
                catalogue,
                ..
            } => {
                require_http_url(url, "data lake url")?;
                require_http_url(api_url, "metadata API url")?;
                if catalogue.trim().is_empty() {
                    return Err(invalid("routing sink needs a catalogue"));
                }
            },
        }

        Ok(())
    }
}

/// Source URL for HTTP streaming: the endpoint joined with the optional path.
pub(crate) fn join_endpoint(endpoint: &str, path: Option<&str>) -> String {
    match path.map(|p| p.trim_start_matches('/')).filter(|p| !p.is_empty()) {
        Some(path) => format!("{}/{}", endpoint.trim_end_matches('/'), path),
        None => endpoint.to_string(),
    }
}

fn require_http_url(value: &str, what: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(value).map_err(|e| invalid(format!("{what} '{value}': {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(invalid(format!("{what} '{value}' uses unsupported scheme '{other}'"))),
    }
}

fn invalid(msg: impl Into<String>) -> TransferError {
    TransferError::InvalidDescriptor(msg.into())
}

fn default_true() -> bool {
    true
}
