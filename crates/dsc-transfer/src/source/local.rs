use async_trait::async_trait;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument};

use super::{Chunk, SourceHandle};
use crate::error::{Result, TransferError};

/// Seek + read over a file on local disk.
pub struct LocalFileSource {
    path: PathBuf,
    file: Option<File>,
    /// Cursor position, unknown while a read is in flight. A read cancelled
    /// by a deadline leaves the cursor anywhere inside its chunk.
    position: Option<u64>,
    len: u64,
    part_name: String,
}

impl LocalFileSource {
    #[instrument]
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).await.map_err(|e| open_error(path, e))?;
        let metadata = file.metadata().await.map_err(|e| open_error(path, e))?;

        if !metadata.is_file() {
            return Err(TransferError::permanent(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        debug!(path = %path.display(), len = metadata.len(), "Opened local file source");

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            position: Some(0),
            len: metadata.len(),
            part_name: path.to_string_lossy().into_owned(),
        })
    }
}

pub(super) fn open_error(path: &Path, err: std::io::Error) -> TransferError {
    let msg = format!("{}: {err}", path.display());
    match err.kind() {
        ErrorKind::NotFound => TransferError::permanent(msg),
        ErrorKind::PermissionDenied => TransferError::SourceAuthFailed(msg),
        _ => TransferError::SourceUnreachable(msg),
    }
}

#[async_trait]
impl SourceHandle for LocalFileSource {
    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }

    fn total_len(&self) -> Option<u64> {
        Some(self.len)
    }

    async fn read_chunk(&mut self, offset: u64, max_len: usize) -> Result<Option<Chunk>> {
        let Some(file) = self.file.as_mut() else {
            return Err(TransferError::permanent(format!(
                "{} read after close",
                self.describe()
            )));
        };

        if offset >= self.len {
            return Ok(None);
        }

        if self.position != Some(offset) {
            self.position = None;
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| TransferError::transient(format!("seek to {offset}: {e}")))?;
        }
        self.position = None;

        let want = max_len.min((self.len - offset) as usize);
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| TransferError::transient(format!("read at {offset}: {e}")))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.position = Some(offset + filled as u64);

        if filled == 0 {
            return Ok(None);
        }

        Ok(Some(Chunk::new(offset, buf, Some(self.part_name.clone()))))
    }

    async fn close(&mut self) -> Result<()> {
        self.file.take();
        Ok(())
    }
}
