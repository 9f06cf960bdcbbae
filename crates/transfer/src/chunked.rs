use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use beamdrop_protocol::constants::CHUNK_SIZE;

use crate::TransferError;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Outgoing files
// ---------------------------------------------------------------------------

/// Where the bytes of an outgoing file come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// A file on local disk, read lazily chunk by chunk.
    Path(PathBuf),
    /// Bytes already in memory.
    Memory(Arc<[u8]>),
}

/// A file handed to the sender.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub source: FileSource,
    pub name: String,
    pub mime: String,
    /// Creation time in Unix milliseconds; `None` means "now".
    pub created_at: Option<i64>,
}

impl OutgoingFile {
    /// A file on disk, named after its final path component.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        Self {
            source: FileSource::Path(path),
            name,
            mime: "application/octet-stream".into(),
            created_at: None,
        }
    }

    /// An in-memory file.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        Self {
            source: FileSource::Memory(Arc::from(data)),
            name: name.into(),
            mime: "application/octet-stream".into(),
            created_at: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = mime.into();
        self
    }

    /// Creation time, defaulting to the current time.
    pub(crate) fn timestamp(&self) -> i64 {
        self.created_at.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or_default()
        })
    }
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

enum ReaderSource {
    File(tokio::fs::File),
    Memory(Arc<[u8]>),
}

/// Reads a file source sequentially in fixed-size chunks.
pub struct ChunkReader {
    source: ReaderSource,
    chunk_size: usize,
    offset: u64,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `source` for chunked reading.
    ///
    /// If `chunk_size` is 0, [`CHUNK_SIZE`] is used.
    pub async fn open(source: &FileSource, chunk_size: usize) -> Result<Self, TransferError> {
        let chunk_size = if chunk_size == 0 {
            CHUNK_SIZE
        } else {
            chunk_size
        };
        let (source, file_size) = match source {
            FileSource::Path(path) => {
                let file = tokio::fs::File::open(path).await?;
                let size = file.metadata().await?.len();
                (ReaderSource::File(file), size)
            }
            FileSource::Memory(data) => {
                let size = data.len() as u64;
                (ReaderSource::Memory(Arc::clone(data)), size)
            }
        };
        Ok(Self {
            source,
            chunk_size,
            offset: 0,
            file_size,
        })
    }

    /// Reads the next chunk. Returns `None` at EOF.
    ///
    /// Every chunk is exactly `chunk_size` bytes except the last, which holds
    /// whatever remains.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = remaining.min(self.chunk_size as u64) as usize;
        let buf = match &mut self.source {
            ReaderSource::File(file) => {
                let mut buf = vec![0u8; read_size];
                file.read_exact(&mut buf).await?;
                buf
            }
            ReaderSource::Memory(data) => {
                let start = self.offset as usize;
                data[start..start + read_size].to_vec()
            }
        };
        self.offset += read_size as u64;
        Ok(Some(buf))
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.offset)
    }
}
