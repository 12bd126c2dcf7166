use async_trait::async_trait;
use dsc_common::checksum::sha256_file;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use super::local::{open_error, LocalFileSource};
use super::snapshot::PartIndex;
use super::{Chunk, SourceHandle};
use crate::error::{Result, TransferError};

/// Snapshot of a directory tree.
///
/// Part names are paths relative to the root with `/` separators. Each part
/// is read through a [`LocalFileSource`] kept open while the reads stay
/// inside it.
pub struct LocalDirectorySource {
    root: PathBuf,
    index: PartIndex,
    current: Option<(usize, LocalFileSource)>,
    closed: bool,
}

impl LocalDirectorySource {
    #[instrument]
    pub async fn open(root: &Path) -> Result<Self> {
        let walk_root = root.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || snapshot(&walk_root))
            .await
            .map_err(|e| TransferError::permanent(format!("directory walk failed: {e}")))??;

        let index = PartIndex::new(entries);
        info!(
            root = %root.display(),
            parts = index.parts().len(),
            len = index.total_len(),
            "Opened directory snapshot source"
        );

        Ok(Self {
            root: root.to_path_buf(),
            index,
            current: None,
            closed: false,
        })
    }

    pub fn index(&self) -> &PartIndex {
        &self.index
    }
}

struct Candidate {
    name: String,
    path: PathBuf,
    len: u64,
}

/// Regular files under `root` in name order, first occurrence of each
/// content only.
fn snapshot(root: &Path) -> Result<Vec<(String, u64)>> {
    let metadata = std::fs::metadata(root).map_err(|e| open_error(root, e))?;
    if !metadata.is_dir() {
        return Err(TransferError::permanent(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut candidates = Vec::new();
    walk(root, root, &mut candidates);
    candidates.sort_by(|a, b| a.name.cmp(&b.name));

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let digest = match sha256_file(&candidate.path) {
            Ok(digest) => digest,
            Err(e) => {
                warn!(path = %candidate.path.display(), error = %e, "Skipping unreadable file");
                continue;
            },
        };
        if !seen.insert(digest) {
            debug!(part = %candidate.name, "Skipping file with duplicate content");
            continue;
        }
        entries.push((candidate.name, candidate.len));
    }
    Ok(entries)
}

/// Collects regular files, following file symlinks but not directory ones.
fn walk(root: &Path, dir: &Path, out: &mut Vec<Candidate>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
            return;
        },
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            walk(root, &path, out);
            continue;
        }

        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(Candidate {
            name,
            path,
            len: metadata.len(),
        });
    }
}

#[async_trait]
impl SourceHandle for LocalDirectorySource {
    fn describe(&self) -> String {
        format!("file://{}/", self.root.display())
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.index.total_len())
    }

    async fn read_chunk(&mut self, offset: u64, max_len: usize) -> Result<Option<Chunk>> {
        if self.closed {
            return Err(TransferError::permanent(format!(
                "{} read after close",
                self.describe()
            )));
        }

        let Some((index, len)) = self.index.span(offset, max_len) else {
            return Ok(None);
        };
        if len == 0 {
            return Ok(None);
        }
        let part = self.index.parts()[index].clone();

        if self.current.as_ref().map(|(i, _)| *i) != Some(index) {
            let file = LocalFileSource::open(&self.root.join(&part.name)).await?;
            if file.total_len() != Some(part.len) {
                return Err(changed(&part.name));
            }
            if let Some((_, mut previous)) = self.current.replace((index, file)) {
                previous.close().await?;
            }
        }
        let Some((_, file)) = self.current.as_mut() else {
            return Err(changed(&part.name));
        };

        match file.read_chunk(offset - part.start, len).await? {
            Some(chunk) if chunk.len() == len => {
                Ok(Some(Chunk::new(offset, chunk.data, Some(part.name))))
            },
            _ => Err(changed(&part.name)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        if let Some((_, mut file)) = self.current.take() {
            file.close().await?;
        }
        Ok(())
    }
}

fn changed(part: &str) -> TransferError {
    TransferError::permanent(format!("{part} changed while the snapshot was transferring"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::source::read;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("air/2026")).unwrap();
        std::fs::write(dir.path().join("air/meta.json"), br#"{"title": "Air"}"#).unwrap();
        std::fs::write(dir.path().join("air/2026/readings.csv"), vec![b'r'; 300]).unwrap();
        std::fs::write(dir.path().join("air/2026/copy.csv"), vec![b'r'; 300]).unwrap();
        std::fs::write(dir.path().join("air/empty.csv"), b"").unwrap();
        std::fs::write(dir.path().join("zz.txt"), b"tail").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_snapshot_orders_and_dedupes_parts() {
        let dir = tree();
        let source = LocalDirectorySource::open(dir.path()).await.unwrap();

        let names: Vec<&str> = source
            .index()
            .parts()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["air/2026/copy.csv", "air/meta.json", "zz.txt"]);
        assert_eq!(source.total_len(), Some(300 + 16 + 4));
    }

    #[tokio::test]
    async fn test_chunks_stay_inside_one_part() {
        let dir = tree();
        let mut source = LocalDirectorySource::open(dir.path()).await.unwrap();

        let chunks: Vec<Chunk> = read(&mut source, 0, 256).try_collect().await.unwrap();
        assert_eq!(
            chunks
                .iter()
                .map(|c| (c.offset, c.len(), c.part_name.clone().unwrap()))
                .collect::<Vec<_>>(),
            vec![
                (0, 256, "air/2026/copy.csv".to_string()),
                (256, 44, "air/2026/copy.csv".to_string()),
                (300, 16, "air/meta.json".to_string()),
                (316, 4, "zz.txt".to_string()),
            ]
        );

        let again = source.read_chunk(300, 256).await.unwrap().unwrap();
        assert_eq!(&again.data[..], br#"{"title": "Air"}"#);
    }

    #[tokio::test]
    async fn test_changed_part_is_permanent() {
        let dir = tree();
        let mut source = LocalDirectorySource::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("zz.txt"), b"longer tail").unwrap();

        let err = source.read_chunk(316, 256).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_root_must_be_a_directory() {
        let dir = tree();
        let err = LocalDirectorySource::open(&dir.path().join("zz.txt"))
            .await
            .err()
            .unwrap();
        assert!(!err.is_transient());

        let err = LocalDirectorySource::open(&dir.path().join("missing"))
            .await
            .err()
            .unwrap();
        assert!(!err.is_transient());
    }
}
