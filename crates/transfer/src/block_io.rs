use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::TransferError;

// ---------------------------------------------------------------------------
// BlockReader
// ---------------------------------------------------------------------------

/// Reads blocks of a file at explicit offsets.
pub struct BlockReader {
    file: File,
    path: PathBuf,
    file_len: u64,
    processed: u64,
}

impl BlockReader {
    /// Opens `path` for reading.
    pub async fn open(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path).await?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(TransferError::InvalidPath(format!(
                "not a regular file: {}",
                path.display()
            )));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            file_len: meta.len(),
            processed: 0,
        })
    }

    /// Reads exactly `len` bytes starting at `offset`.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, TransferError> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        self.processed += len as u64;
        Ok(buf)
    }

    /// Length of the file when it was opened.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Total bytes read so far.
    pub fn size(&self) -> u64 {
        self.processed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// BlockWriter
// ---------------------------------------------------------------------------

/// Writes blocks of a file at explicit offsets.
///
/// The file is created (and truncated) on [`create`](Self::create); parent
/// directories are created as needed.
pub struct BlockWriter {
    file: File,
    path: PathBuf,
    written: u64,
}

impl BlockWriter {
    pub async fn create(path: &Path) -> Result<Self, TransferError> {
        create_parent(path).await?;
        let file = File::create(path).await?;
        Ok(Self::with_file(file, path))
    }

    /// Like [`create`](Self::create), but fails if `path` already exists,
    /// so no other writer can share the file.
    pub async fn create_new(path: &Path) -> Result<Self, TransferError> {
        create_parent(path).await?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        Ok(Self::with_file(file, path))
    }

    fn with_file(file: File, path: &Path) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            written: 0,
        }
    }

    /// Writes `data` at `offset`.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Total bytes written so far.
    pub fn size(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and syncs the file to disk.
    pub async fn close(mut self) -> Result<(), TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

async fn create_parent(path: &Path) -> Result<(), TransferError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}
