//! Sink adapters
//!
//! A sink receives chunks in offset order and finalizes the artifact on
//! [`SinkHandle::commit`]. What a sink can tolerate after a restart is
//! described by its [`SinkCapabilities`].

pub mod http;
pub mod metadata;
pub mod routing;

use async_trait::async_trait;

use crate::descriptor::{HttpSinkMode, SinkSpec};
use crate::error::Result;
use crate::source::Chunk;

pub use http::HttpSink;
pub use metadata::MetadataPublishSink;
pub use routing::RoutingSink;

/// Restart guarantees of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SinkCapabilities {
    /// Re-delivering a byte range leaves the artifact unchanged
    pub idempotent_writes: bool,
    /// Offsets that are multiples of this value are safe resume points for a
    /// non-idempotent sink
    pub resume_granularity: Option<u64>,
}

impl SinkCapabilities {
    /// True when a transfer checkpointed at `offset` can continue there.
    pub fn can_resume_at(&self, offset: u64) -> bool {
        if offset == 0 || self.idempotent_writes {
            return true;
        }
        matches!(self.resume_granularity, Some(g) if g > 0 && offset % g == 0)
    }
}

/// Capabilities a sink described by `spec` will report once opened.
/// `default_granularity` fills in for `parts` HTTP sinks that do not declare
/// one; zero means none.
pub fn capabilities_for(spec: &SinkSpec, default_granularity: u64) -> SinkCapabilities {
    match spec {
        SinkSpec::Http {
            mode: HttpSinkMode::Ranged,
            ..
        } => SinkCapabilities {
            idempotent_writes: true,
            resume_granularity: None,
        },
        SinkSpec::Http {
            mode: HttpSinkMode::Parts,
            resume_granularity,
            ..
        } => SinkCapabilities {
            idempotent_writes: false,
            resume_granularity: resume_granularity
                .or(Some(default_granularity))
                .filter(|g| *g > 0),
        },
        SinkSpec::MetadataPublish { .. } | SinkSpec::Routing { .. } => SinkCapabilities::default(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub bytes_accepted: usize,
    /// Reported on the first write of a handle opened past offset 0
    pub resume_accepted: Option<bool>,
}

impl WriteResult {
    pub fn accepted(bytes: usize) -> Self {
        Self {
            bytes_accepted: bytes,
            resume_accepted: None,
        }
    }
}

/// What the downstream reported when the artifact was finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub total_bytes: u64,
    pub reference: Option<String>,
}

/// An opened destination.
#[async_trait]
pub trait SinkHandle: Send {
    fn describe(&self) -> String;

    fn capabilities(&self) -> SinkCapabilities;

    async fn write(&mut self, chunk: &Chunk) -> Result<WriteResult>;

    /// Finalize the artifact after `total_bytes` were acknowledged. Called
    /// at most once and never retried.
    async fn commit(&mut self, total_bytes: u64) -> Result<CommitReceipt>;

    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_points() {
        let idempotent = SinkCapabilities {
            idempotent_writes: true,
            resume_granularity: None,
        };
        assert!(idempotent.can_resume_at(12_345));

        let parts = SinkCapabilities {
            idempotent_writes: false,
            resume_granularity: Some(100),
        };
        assert!(parts.can_resume_at(0));
        assert!(parts.can_resume_at(300));
        assert!(!parts.can_resume_at(250));

        let append_only = SinkCapabilities::default();
        assert!(append_only.can_resume_at(0));
        assert!(!append_only.can_resume_at(100));
    }

    #[test]
    fn test_capabilities_from_spec() {
        let parts = SinkSpec::Http {
            url: "http://lake/ingest".into(),
            mode: HttpSinkMode::Parts,
            auth_key: None,
            part_name: None,
            resume_granularity: None,
        };
        assert_eq!(capabilities_for(&parts, 0).resume_granularity, None);
        assert_eq!(capabilities_for(&parts, 4096).resume_granularity, Some(4096));

        let metadata = SinkSpec::MetadataPublish {
            api_url: "http://hub/datasets".into(),
            catalogue: "c".into(),
            api_key: None,
            dataset_id: None,
            distribution_file: None,
        };
        assert_eq!(capabilities_for(&metadata, 4096), SinkCapabilities::default());

        let routing = SinkSpec::Routing {
            url: "http://lake/ingest".into(),
            auth_key: None,
            api_url: "http://hub/datasets".into(),
            catalogue: "c".into(),
            api_key: None,
        };
        assert_eq!(capabilities_for(&routing, 4096), SinkCapabilities::default());
    }
}
