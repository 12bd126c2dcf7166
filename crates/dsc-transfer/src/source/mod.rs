//! Source adapters
//!
//! Every origin is read through [`SourceHandle::read_chunk`], which returns
//! the bytes starting at a chunk-aligned offset. [`read`] turns an open
//! handle into a lazy stream of chunks starting at any offset previously
//! reached, which is how sessions resume.

pub mod directory;
pub mod http;
pub mod local;
pub mod object_store;
pub mod snapshot;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::Result;

pub use directory::LocalDirectorySource;
pub use http::HttpStreamSource;
pub use local::LocalFileSource;
pub use object_store::{ObjectLocation, ObjectPrefixSource, ObjectStorageSource};
pub use snapshot::{Part, PartIndex};

/// A contiguous slice of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
    /// Path of the file or object the bytes belong to, as the origin names it
    pub part_name: Option<String>,
}

impl Chunk {
    pub fn new(offset: u64, data: impl Into<Bytes>, part_name: Option<String>) -> Self {
        Self {
            offset,
            data: data.into(),
            part_name,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset of the first byte after this chunk.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// An opened origin.
#[async_trait]
pub trait SourceHandle: Send {
    /// Human readable location for logs.
    fn describe(&self) -> String;

    /// Total payload length when the origin knows it.
    fn total_len(&self) -> Option<u64>;

    /// Read at most `max_len` bytes starting at `offset`. `None` means the
    /// origin is exhausted.
    async fn read_chunk(&mut self, offset: u64, max_len: usize) -> Result<Option<Chunk>>;

    /// Release connections and descriptors.
    async fn close(&mut self) -> Result<()>;
}

/// Lazy sequence of chunks starting at `from`. The stream ends after the
/// first error; callers reopen it at the last acknowledged offset.
pub fn read(
    handle: &mut dyn SourceHandle,
    from: u64,
    chunk_size: usize,
) -> BoxStream<'_, Result<Chunk>> {
    stream::try_unfold((handle, from), move |(handle, offset)| async move {
        match handle.read_chunk(offset, chunk_size).await? {
            Some(chunk) if !chunk.is_empty() => {
                let next = chunk.end_offset();
                Ok(Some((chunk, (handle, next))))
            },
            _ => Ok(None),
        }
    })
    .boxed()
}

/// Last path segment after `/` or `\`, or `unknown`.
pub(crate) fn file_name(path: &str) -> String {
    let name = path.rsplit(['/', '\\']).next().unwrap_or_default();
    if name.is_empty() {
        "unknown".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    struct SliceSource {
        data: Vec<u8>,
        requested: Vec<u64>,
    }

    #[async_trait]
    impl SourceHandle for SliceSource {
        fn describe(&self) -> String {
            "slice".into()
        }

        fn total_len(&self) -> Option<u64> {
            Some(self.data.len() as u64)
        }

        async fn read_chunk(&mut self, offset: u64, max_len: usize) -> Result<Option<Chunk>> {
            self.requested.push(offset);
            let start = offset as usize;
            if start >= self.data.len() {
                return Ok(None);
            }
            let end = (start + max_len).min(self.data.len());
            Ok(Some(Chunk::new(offset, self.data[start..end].to_vec(), None)))
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_read_starts_at_offset_and_stays_aligned() {
        let mut source = SliceSource {
            data: (0..=255u8).cycle().take(1000).collect(),
            requested: Vec::new(),
        };

        let chunks: Vec<Chunk> = read(&mut source, 400, 300).try_collect().await.unwrap();

        assert_eq!(
            chunks.iter().map(|c| (c.offset, c.len())).collect::<Vec<_>>(),
            vec![(400, 300), (700, 300)]
        );
        assert_eq!(source.requested, vec![400, 700, 1000]);
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("data/2026/readings.csv"), "readings.csv");
        assert_eq!(file_name(r"C:\exports\a.json"), "a.json");
        assert_eq!(file_name("plain"), "plain");
        assert_eq!(file_name("dir/"), "unknown");
        assert_eq!(file_name(""), "unknown");
    }
}
