//! Storage backends for received bytes.
//!
//! Two backends sit behind one contract: [`FileStore`] streams chunks into a
//! backing file at their final offsets, and [`ChunkBuffer`] accumulates them
//! in memory. [`StorageCapabilities::detect`] decides once per process which
//! one new transfers use.

use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use beamdrop_protocol::StorageMode;

use crate::TransferError;
use crate::validation::validate_storage_key;

/// Extension appended to transfer ids to form backing file names.
const FILE_EXTENSION: &str = "part";

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What the local environment offers for storing received bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageCapabilities {
    pub mode: StorageMode,
    pub supports_durable_file: bool,
    pub environment_label: String,
}

impl StorageCapabilities {
    /// Probes `root` for durable, randomly writable file support.
    ///
    /// A throwaway file is created, written at a non-zero offset and deleted.
    /// Any failure along the way selects buffered mode.
    pub async fn detect(root: &Path) -> Self {
        match probe(root).await {
            Ok(()) => {
                info!(root = %root.display(), "durable file storage available");
                Self {
                    mode: StorageMode::Streaming,
                    supports_durable_file: true,
                    environment_label: environment_label("disk"),
                }
            }
            Err(e) => {
                warn!(root = %root.display(), error = %e, "file storage probe failed, buffering in memory");
                Self::buffered()
            }
        }
    }

    /// Capabilities of an environment without durable file support.
    pub fn buffered() -> Self {
        Self {
            mode: StorageMode::Buffered,
            supports_durable_file: false,
            environment_label: environment_label("memory"),
        }
    }
}

async fn probe(root: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(root).await?;
    let path = root.join(format!(".probe-{}", uuid::Uuid::new_v4()));
    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(16)).await?;
        file.write_all(b"probe").await?;
        file.flush().await?;
        Ok::<_, std::io::Error>(())
    }
    .await;
    let removed = tokio::fs::remove_file(&path).await;
    result?;
    removed
}

fn environment_label(backend: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".into());
    format!(
        "{}/{} {host} ({backend})",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

// ---------------------------------------------------------------------------
// Buffered backend
// ---------------------------------------------------------------------------

/// In-memory chunk accumulator, indexed by chunk number.
///
/// Sparse: chunks may arrive in any order and missing indices take no space.
#[derive(Debug, Clone, Default)]
pub struct ChunkBuffer {
    chunks: BTreeMap<u64, Vec<u8>>,
    total_chunks: u64,
}

impl ChunkBuffer {
    pub fn new(total_chunks: u64) -> Self {
        Self {
            chunks: BTreeMap::new(),
            total_chunks,
        }
    }

    /// Stores `data` at `index`, replacing any earlier copy.
    pub fn store(&mut self, index: u64, data: Vec<u8>) {
        self.chunks.insert(index, data);
    }

    /// Number of distinct chunk slots filled.
    pub fn filled(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn is_complete(&self) -> bool {
        self.filled() >= self.total_chunks
    }

    /// Concatenates the stored chunks in index order.
    pub fn assemble(&self) -> Vec<u8> {
        let len = self.chunks.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(len);
        for chunk in self.chunks.values() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Streaming backend
// ---------------------------------------------------------------------------

/// Reference to a transfer's backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub transfer_id: String,
    pub path: PathBuf,
}

/// Outcome of draining and closing a write handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub bytes_written: u64,
    /// Writes that failed and were skipped.
    pub failed_writes: u64,
}

enum WriteOp {
    Write { offset: u64, data: Vec<u8> },
    Close { done: oneshot::Sender<WriteReport> },
}

/// Backing-file store for streaming-mode transfers.
///
/// Each open transfer owns exactly one write handle, held by a dedicated
/// writer task. Writes for a transfer go through that task's queue, so a
/// chunk write never overlaps an earlier write or the final close.
pub struct FileStore {
    root: PathBuf,
    writers: Mutex<HashMap<String, mpsc::UnboundedSender<WriteOp>>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn writers(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<WriteOp>>> {
        self.writers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path of the backing file for `transfer_id`.
    pub fn file_ref(&self, transfer_id: &str) -> Result<FileRef, TransferError> {
        validate_storage_key(transfer_id)?;
        Ok(FileRef {
            transfer_id: transfer_id.to_string(),
            path: self.root.join(format!("{transfer_id}.{FILE_EXTENSION}")),
        })
    }

    /// Creates an empty backing file, truncating any leftover.
    pub async fn create_file(&self, transfer_id: &str) -> Result<FileRef, TransferError> {
        let file_ref = self.file_ref(transfer_id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::File::create(&file_ref.path).await?;
        debug!(transfer = %transfer_id, path = %file_ref.path.display(), "backing file created");
        Ok(file_ref)
    }

    /// Opens the write handle for `file_ref`.
    ///
    /// Fails if the transfer already has an open handle.
    pub async fn open_writable(&self, file_ref: &FileRef) -> Result<(), TransferError> {
        if self.writers().contains_key(&file_ref.transfer_id) {
            return Err(TransferError::StorageUnavailable(format!(
                "write handle already open for {}",
                file_ref.transfer_id
            )));
        }

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&file_ref.path)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut writers = self.writers();
            if writers.contains_key(&file_ref.transfer_id) {
                return Err(TransferError::StorageUnavailable(format!(
                    "write handle already open for {}",
                    file_ref.transfer_id
                )));
            }
            writers.insert(file_ref.transfer_id.clone(), tx);
        }
        tokio::spawn(run_writer(file_ref.transfer_id.clone(), file, rx));
        Ok(())
    }

    /// Returns `true` while `transfer_id` has an open write handle.
    pub fn is_open(&self, transfer_id: &str) -> bool {
        self.writers().contains_key(transfer_id)
    }

    /// Queues `data` to be written at `offset`.
    ///
    /// Returns immediately. Writes for a transfer whose handle is closing or
    /// closed are logged and skipped.
    pub fn write_at(&self, transfer_id: &str, offset: u64, data: Vec<u8>) {
        let sent = match self.writers().get(transfer_id) {
            Some(tx) => tx.send(WriteOp::Write { offset, data }).is_ok(),
            None => false,
        };
        if !sent {
            warn!(transfer = %transfer_id, offset, "write after handle closed, skipping");
        }
    }

    /// Drains pending writes, flushes and closes the handle.
    ///
    /// Returns `None` if the transfer had no open handle.
    pub async fn close(&self, transfer_id: &str) -> Option<WriteReport> {
        let tx = self.writers().remove(transfer_id)?;
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(WriteOp::Close { done: done_tx }).is_err() {
            return None;
        }
        done_rx.await.ok()
    }

    /// Best-effort close of every open handle. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<String> = self.writers().keys().cloned().collect();
        let mut closed = 0;
        for id in ids {
            match self.close(&id).await {
                Some(_) => closed += 1,
                None => warn!(transfer = %id, "write handle did not close cleanly"),
            }
        }
        closed
    }

    /// Reads the whole backing file.
    pub async fn read_all(&self, file_ref: &FileRef) -> Result<Vec<u8>, TransferError> {
        Ok(tokio::fs::read(&file_ref.path).await?)
    }

    /// Closes any open handle and removes the backing file.
    ///
    /// A missing file is not an error.
    pub async fn delete(&self, transfer_id: &str) -> Result<(), TransferError> {
        let file_ref = self.file_ref(transfer_id)?;
        if self.is_open(transfer_id) {
            self.close(transfer_id).await;
        }
        match tokio::fs::remove_file(&file_ref.path).await {
            Ok(()) => {
                debug!(transfer = %transfer_id, "backing file deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Owns one transfer's write handle and applies queued operations in order.
async fn run_writer(
    transfer_id: String,
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    let mut report = WriteReport::default();
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Write { offset, data } => match write_chunk(&mut file, offset, &data).await {
                Ok(()) => {
                    report.bytes_written += data.len() as u64;
                    trace!(transfer = %transfer_id, offset, len = data.len(), "chunk written");
                }
                Err(e) => {
                    report.failed_writes += 1;
                    warn!(transfer = %transfer_id, offset, error = %e, "chunk write failed, skipping");
                }
            },
            WriteOp::Close { done } => {
                if let Err(e) = file.sync_all().await {
                    warn!(transfer = %transfer_id, error = %e, "flush on close failed");
                }
                let _ = done.send(report);
                return;
            }
        }
    }
    // Store dropped the queue without a close (deleted transfer).
    let _ = file.flush().await;
}

async fn write_chunk(file: &mut tokio::fs::File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn detect_on_writable_dir_selects_streaming() {
        let dir = TempDir::new().unwrap();
        let caps = StorageCapabilities::detect(dir.path()).await;
        assert_eq!(caps.mode, StorageMode::Streaming);
        assert!(caps.supports_durable_file);
        assert!(caps.environment_label.contains("disk"));
        // The probe leaves nothing behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn detect_on_unusable_root_selects_buffered() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let caps = StorageCapabilities::detect(&blocker.join("store")).await;
        assert_eq!(caps.mode, StorageMode::Buffered);
        assert!(!caps.supports_durable_file);
    }

    #[test]
    fn chunk_buffer_assembles_in_index_order() {
        let mut buf = ChunkBuffer::new(3);
        buf.store(2, b"C".to_vec());
        buf.store(0, b"A".to_vec());
        assert_eq!(buf.filled(), 2);
        assert!(!buf.is_complete());

        buf.store(1, b"B".to_vec());
        assert!(buf.is_complete());
        assert_eq!(buf.assemble(), b"ABC");
    }

    #[test]
    fn chunk_buffer_duplicate_does_not_double_count() {
        let mut buf = ChunkBuffer::new(2);
        buf.store(0, b"x".to_vec());
        buf.store(0, b"y".to_vec());
        assert_eq!(buf.filled(), 1);
        assert_eq!(buf.assemble(), b"y");
    }

    #[tokio::test]
    async fn writes_at_offsets_out_of_order() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let file_ref = store.create_file("t1").await.unwrap();
        store.open_writable(&file_ref).await.unwrap();
        assert!(store.is_open("t1"));

        store.write_at("t1", 5, b" World".to_vec());
        store.write_at("t1", 0, b"Hello".to_vec());

        let report = store.close("t1").await.unwrap();
        assert_eq!(report.bytes_written, 11);
        assert_eq!(report.failed_writes, 0);
        assert!(!store.is_open("t1"));

        assert_eq!(store.read_all(&file_ref).await.unwrap(), b"Hello World");
    }

    #[tokio::test]
    async fn second_handle_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let file_ref = store.create_file("t1").await.unwrap();
        store.open_writable(&file_ref).await.unwrap();

        let again = store.open_writable(&file_ref).await;
        assert!(matches!(again, Err(TransferError::StorageUnavailable(_))));
        store.close("t1").await;
    }

    #[tokio::test]
    async fn write_after_close_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let file_ref = store.create_file("t1").await.unwrap();
        store.open_writable(&file_ref).await.unwrap();
        store.write_at("t1", 0, b"abc".to_vec());
        store.close("t1").await.unwrap();

        // Tolerated: no panic, no error, file unchanged.
        store.write_at("t1", 3, b"def".to_vec());
        assert_eq!(store.read_all(&file_ref).await.unwrap(), b"abc");
        assert!(store.close("t1").await.is_none());
    }

    #[tokio::test]
    async fn delete_removes_file_and_handle() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let file_ref = store.create_file("t1").await.unwrap();
        store.open_writable(&file_ref).await.unwrap();

        store.delete("t1").await.unwrap();
        assert!(!store.is_open("t1"));
        assert!(!file_ref.path.exists());

        // Deleting again is fine.
        store.delete("t1").await.unwrap();
    }

    #[tokio::test]
    async fn close_all_closes_every_handle() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        for id in ["a", "b", "c"] {
            let file_ref = store.create_file(id).await.unwrap();
            store.open_writable(&file_ref).await.unwrap();
        }
        assert_eq!(store.close_all().await, 3);
        assert!(!store.is_open("a"));
        assert_eq!(store.close_all().await, 0);
    }

    #[tokio::test]
    async fn unsafe_id_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let result = store.create_file("../escape").await;
        assert!(matches!(result, Err(TransferError::InvalidKey(_))));
    }
}
