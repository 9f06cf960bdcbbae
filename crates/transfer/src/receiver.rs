//! Receiving half of the transfer engine.
//!
//! Every inbound message is applied through the [`Sequencer`] under its
//! transfer id, so one transfer's messages never overlap each other.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use beamdrop_protocol::{
    Direction, FileMetadata, StorageMode, TransferMessage, TransferStatus, chunk_offset,
};

use crate::TransferError;
use crate::sequencer::{Completion, Sequencer};
use crate::storage::{ChunkBuffer, FileRef, FileStore};
use crate::types::{Transfer, TransferPayload, TransferRegistry};

/// Applies inbound protocol messages to the registry and storage.
#[derive(Clone)]
pub struct TransferReceiver {
    registry: Arc<TransferRegistry>,
    /// Present when the environment supports streaming storage.
    store: Option<Arc<FileStore>>,
    sequencer: Sequencer,
    chunk_size: usize,
}

impl TransferReceiver {
    pub fn new(
        registry: Arc<TransferRegistry>,
        store: Option<Arc<FileStore>>,
        chunk_size: usize,
    ) -> Self {
        Self {
            registry,
            store,
            sequencer: Sequencer::new(),
            chunk_size,
        }
    }

    /// Schedules `msg` behind earlier messages for the same transfer.
    pub fn handle(&self, msg: TransferMessage) -> Completion {
        let key = msg.transfer_id().to_string();
        let this = self.clone();
        self.sequencer
            .submit(&key, async move { this.apply(msg).await })
    }

    async fn apply(&self, msg: TransferMessage) -> Result<(), TransferError> {
        match msg {
            TransferMessage::Metadata {
                transfer_id,
                metadata,
                total_chunks,
            } => {
                self.on_metadata(transfer_id, metadata, total_chunks)
                    .await
            }
            TransferMessage::Chunk {
                transfer_id,
                chunk_index,
                data,
            } => self.on_chunk(&transfer_id, chunk_index, data),
            TransferMessage::Complete { transfer_id } => self.on_complete(&transfer_id).await,
        }
    }

    async fn on_metadata(
        &self,
        id: String,
        metadata: FileMetadata,
        total_chunks: u64,
    ) -> Result<(), TransferError> {
        if self.registry.contains(&id) {
            warn!(transfer = %id, "duplicate metadata, ignoring");
            return Ok(());
        }
        // Offsets are derived from the local chunk size.
        let expected = beamdrop_protocol::total_chunks(metadata.size, self.chunk_size);
        if total_chunks != expected {
            return Err(TransferError::ChunkCountMismatch {
                transfer_id: id,
                announced: total_chunks,
                expected,
            });
        }

        let (mode, payload) = match &self.store {
            Some(store) => match open_backing(store, &id).await {
                Ok(file_ref) => (StorageMode::Streaming, TransferPayload::Streaming(file_ref)),
                Err(e) => {
                    warn!(transfer = %id, error = %e, "backing file unavailable, buffering in memory");
                    (
                        StorageMode::Buffered,
                        TransferPayload::Buffered(ChunkBuffer::new(total_chunks)),
                    )
                }
            },
            None => (
                StorageMode::Buffered,
                TransferPayload::Buffered(ChunkBuffer::new(total_chunks)),
            ),
        };

        info!(
            transfer = %id,
            name = %metadata.name,
            size = metadata.size,
            total_chunks,
            mode = ?mode,
            "incoming transfer started"
        );
        let record = Transfer::new(id, Direction::Incoming, metadata, total_chunks, mode);
        self.registry.insert(record, payload);
        Ok(())
    }

    fn on_chunk(&self, id: &str, chunk_index: u64, data: Vec<u8>) -> Result<(), TransferError> {
        let Some(transfer) = self.registry.get(id) else {
            return Err(TransferError::UnknownTransfer(id.to_string()));
        };
        if transfer.status.is_terminal() {
            debug!(transfer = %id, chunk_index, status = ?transfer.status, "chunk for finished transfer, dropping");
            return Ok(());
        }
        if chunk_index >= transfer.total_chunks {
            return Err(TransferError::InvalidChunk {
                transfer_id: id.to_string(),
                chunk_index,
                total_chunks: transfer.total_chunks,
            });
        }

        let total = transfer.total_chunks as f64;
        let len = data.len();
        match transfer.storage_mode {
            StorageMode::Streaming => {
                let store = self
                    .store
                    .as_ref()
                    .ok_or_else(|| TransferError::StorageUnavailable(id.to_string()))?;
                let offset = chunk_offset(chunk_index, self.chunk_size).ok_or_else(|| {
                    TransferError::InvalidChunk {
                        transfer_id: id.to_string(),
                        chunk_index,
                        total_chunks: transfer.total_chunks,
                    }
                })?;
                store.write_at(id, offset, data);
                // Based on the last index seen, not on flushed bytes.
                self.registry
                    .set_progress(id, (chunk_index + 1) as f64 / total * 100.0);
            }
            StorageMode::Buffered => {
                let filled = self
                    .registry
                    .with_payload(id, |payload| match payload {
                        TransferPayload::Buffered(buffer) => {
                            buffer.store(chunk_index, data);
                            Some(buffer.filled())
                        }
                        _ => None,
                    })
                    .flatten()
                    .ok_or_else(|| TransferError::PayloadUnavailable(id.to_string()))?;
                self.registry
                    .set_progress(id, filled as f64 / total * 100.0);
            }
        }
        trace!(transfer = %id, chunk_index, len, "chunk applied");
        Ok(())
    }

    async fn on_complete(&self, id: &str) -> Result<(), TransferError> {
        let Some(transfer) = self.registry.get(id) else {
            return Err(TransferError::UnknownTransfer(id.to_string()));
        };

        match transfer.storage_mode {
            StorageMode::Streaming => {
                let report = match &self.store {
                    Some(store) => store.close(id).await,
                    None => None,
                };
                match report {
                    // Failed writes do not fail the transfer.
                    Some(report) if report.failed_writes > 0 => warn!(
                        transfer = %id,
                        failed_writes = report.failed_writes,
                        bytes_written = report.bytes_written,
                        "transfer completed with failed chunk writes"
                    ),
                    Some(report) => {
                        debug!(transfer = %id, bytes_written = report.bytes_written, "backing file closed")
                    }
                    None => warn!(transfer = %id, "no open write handle at completion"),
                }
            }
            StorageMode::Buffered => {
                let missing = self.registry.with_payload(id, |payload| match payload {
                    TransferPayload::Buffered(buffer) if !buffer.is_complete() => {
                        Some(buffer.total_chunks() - buffer.filled())
                    }
                    _ => None,
                });
                if let Some(Some(missing)) = missing {
                    warn!(transfer = %id, missing, "transfer completed with missing chunks");
                }
            }
        }

        if self.registry.advance(id, TransferStatus::Completed, None) {
            info!(
                transfer = %id,
                name = %transfer.metadata.name,
                size = transfer.metadata.size,
                "transfer received"
            );
        }
        Ok(())
    }
}

async fn open_backing(store: &FileStore, id: &str) -> Result<FileRef, TransferError> {
    let file_ref = store.create_file(id).await?;
    if let Err(e) = store.open_writable(&file_ref).await {
        let _ = store.delete(id).await;
        return Err(e);
    }
    Ok(file_ref)
}
