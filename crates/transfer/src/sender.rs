//! Sending half of the transfer engine.
//!
//! Splits a file into chunk messages and paces them against the channel's
//! buffered-amount counter.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use beamdrop_protocol::constants::{
    BACKPRESSURE_POLL_INTERVAL, CHUNK_SIZE, MAX_BUFFERED_AMOUNT, YIELD_EVERY_CHUNKS,
};
use beamdrop_protocol::{
    Direction, FileMetadata, StorageMode, TransferMessage, TransferStatus, total_chunks,
};

use crate::TransferError;
use crate::channel::{ChannelError, DataChannel};
use crate::chunked::{ChunkReader, OutgoingFile};
use crate::types::{Transfer, TransferPayload, TransferRegistry};

/// Pacing parameters for outgoing transfers.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub chunk_size: usize,
    /// Chunks are held back while the channel buffers more than this.
    pub max_buffered_amount: usize,
    pub poll_interval: Duration,
    /// Yield to the scheduler after this many chunks. 0 disables yielding.
    pub yield_every: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_buffered_amount: MAX_BUFFERED_AMOUNT,
            poll_interval: BACKPRESSURE_POLL_INTERVAL,
            yield_every: YIELD_EVERY_CHUNKS,
        }
    }
}

/// A registered outgoing transfer, ready to stream.
struct Prepared {
    id: String,
    metadata: FileMetadata,
    total_chunks: u64,
    reader: ChunkReader,
}

/// Streams files over one channel.
#[derive(Clone)]
pub struct TransferSender {
    registry: Arc<TransferRegistry>,
    channel: Arc<dyn DataChannel>,
    storage_mode: StorageMode,
    config: SenderConfig,
}

impl TransferSender {
    pub fn new(
        registry: Arc<TransferRegistry>,
        channel: Arc<dyn DataChannel>,
        storage_mode: StorageMode,
        config: SenderConfig,
    ) -> Self {
        Self {
            registry,
            channel,
            storage_mode,
            config,
        }
    }

    /// Registers `file` and streams it in the background.
    ///
    /// Returns the new transfer id as soon as the transfer is registered;
    /// progress and the outcome are observed through the registry. Only a
    /// source that cannot be opened fails here.
    pub async fn send(&self, file: OutgoingFile) -> Result<String, TransferError> {
        let prepared = self.prepare(file).await?;
        let id = prepared.id.clone();
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.pump(prepared).await;
        });
        Ok(id)
    }

    /// Like [`send`](Self::send) but streams inline and returns once the
    /// `complete` message has been handed to the channel.
    pub async fn send_to_completion(&self, file: OutgoingFile) -> Result<String, TransferError> {
        let prepared = self.prepare(file).await?;
        let id = prepared.id.clone();
        self.pump(prepared).await?;
        Ok(id)
    }

    async fn prepare(&self, file: OutgoingFile) -> Result<Prepared, TransferError> {
        let reader = ChunkReader::open(&file.source, self.config.chunk_size).await?;
        let metadata = FileMetadata {
            name: file.name.clone(),
            size: reader.file_size(),
            mime: file.mime.clone(),
            timestamp: file.timestamp(),
        };
        let total = total_chunks(metadata.size, self.config.chunk_size);
        let id = uuid::Uuid::new_v4().to_string();

        self.registry.insert(
            Transfer::new(
                id.clone(),
                Direction::Outgoing,
                metadata.clone(),
                total,
                self.storage_mode,
            ),
            TransferPayload::None,
        );

        Ok(Prepared {
            id,
            metadata,
            total_chunks: total,
            reader,
        })
    }

    /// Streams a prepared transfer, marking it failed on any error.
    async fn pump(&self, prepared: Prepared) -> Result<(), TransferError> {
        let id = prepared.id.clone();
        let result = self.stream(prepared).await;
        if let Err(e) = &result {
            error!(transfer = %id, error = %e, "send failed");
            self.registry
                .advance(&id, TransferStatus::Failed, Some(e.to_string()));
        }
        result
    }

    async fn stream(&self, prepared: Prepared) -> Result<(), TransferError> {
        let Prepared {
            id,
            metadata,
            total_chunks,
            mut reader,
        } = prepared;
        let size = metadata.size;
        let name = metadata.name.clone();

        self.emit(&TransferMessage::Metadata {
            transfer_id: id.clone(),
            metadata,
            total_chunks,
        })?;
        debug!(transfer = %id, size, total_chunks, "metadata sent");

        let mut chunk_index: u64 = 0;
        while let Some(data) = reader.next_chunk().await? {
            self.wait_for_capacity().await?;

            let len = data.len();
            self.emit(&TransferMessage::Chunk {
                transfer_id: id.clone(),
                chunk_index,
                data,
            })?;
            trace!(transfer = %id, chunk_index, len, "chunk sent");
            chunk_index += 1;

            let offset = reader.offset();
            let progress = (offset as f64 / size as f64).min(1.0) * 100.0;
            self.registry.set_progress(&id, progress);
            if offset == size {
                self.registry.advance(&id, TransferStatus::Completed, None);
            }

            if self.config.yield_every > 0 && chunk_index % self.config.yield_every as u64 == 0 {
                tokio::task::yield_now().await;
            }
        }

        if size == 0 {
            self.registry.advance(&id, TransferStatus::Completed, None);
        }

        self.emit(&TransferMessage::Complete {
            transfer_id: id.clone(),
        })?;
        info!(transfer = %id, name = %name, size, "transfer sent");
        Ok(())
    }

    fn emit(&self, msg: &TransferMessage) -> Result<(), TransferError> {
        let bytes = msg.encode()?;
        self.channel.send(bytes)?;
        Ok(())
    }

    /// Polls until the channel buffers no more than the configured ceiling.
    async fn wait_for_capacity(&self) -> Result<(), TransferError> {
        while self.channel.buffered_amount() > self.config.max_buffered_amount {
            if !self.channel.is_open() {
                return Err(ChannelError::Closed.into());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockChannel;

    fn small_config() -> SenderConfig {
        SenderConfig {
            chunk_size: 4,
            max_buffered_amount: 100,
            poll_interval: Duration::from_millis(50),
            yield_every: 2,
        }
    }

    fn sender(channel: Arc<MockChannel>, config: SenderConfig) -> (TransferSender, Arc<TransferRegistry>) {
        let registry = Arc::new(TransferRegistry::new());
        let sender = TransferSender::new(
            Arc::clone(&registry),
            channel,
            StorageMode::Buffered,
            config,
        );
        (sender, registry)
    }

    fn decode_all(sent: &[Vec<u8>]) -> Vec<TransferMessage> {
        sent.iter()
            .map(|b| TransferMessage::decode(b).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn emits_metadata_chunks_then_complete() {
        let channel = Arc::new(MockChannel::default());
        let (sender, registry) = sender(Arc::clone(&channel), small_config());

        let id = sender
            .send_to_completion(OutgoingFile::from_bytes("a.txt", b"0123456789".to_vec()))
            .await
            .unwrap();

        let msgs = decode_all(&channel.take_sent());
        assert_eq!(msgs.len(), 5);
        match &msgs[0] {
            TransferMessage::Metadata {
                transfer_id,
                metadata,
                total_chunks,
            } => {
                assert_eq!(transfer_id, &id);
                assert_eq!(metadata.name, "a.txt");
                assert_eq!(metadata.size, 10);
                assert_eq!(*total_chunks, 3);
            }
            other => panic!("expected metadata, got {other:?}"),
        }

        let mut payload = Vec::new();
        for (i, msg) in msgs[1..4].iter().enumerate() {
            match msg {
                TransferMessage::Chunk {
                    chunk_index, data, ..
                } => {
                    assert_eq!(*chunk_index, i as u64);
                    payload.extend_from_slice(data);
                }
                other => panic!("expected chunk, got {other:?}"),
            }
        }
        assert_eq!(payload, b"0123456789");
        assert!(matches!(&msgs[4], TransferMessage::Complete { transfer_id } if transfer_id == &id));

        let t = registry.get(&id).unwrap();
        assert_eq!(t.status, TransferStatus::Completed);
        assert_eq!(t.progress, 100.0);
        assert_eq!(t.direction, Direction::Outgoing);
    }

    #[tokio::test]
    async fn example_150kib_file_uses_three_chunks() {
        let channel = Arc::new(MockChannel::default());
        let (sender, _) = sender(Arc::clone(&channel), SenderConfig::default());

        let data = vec![7u8; 150 * 1024];
        sender
            .send_to_completion(OutgoingFile::from_bytes("big.bin", data))
            .await
            .unwrap();

        let sizes: Vec<usize> = decode_all(&channel.take_sent())
            .into_iter()
            .filter_map(|m| match m {
                TransferMessage::Chunk { data, .. } => Some(data.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![64 * 1024, 64 * 1024, 22 * 1024]);
    }

    #[tokio::test]
    async fn chunk_lengths_sum_to_file_size() {
        const CHUNK: u64 = CHUNK_SIZE as u64;
        for size in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 3 * CHUNK + 7] {
            let channel = Arc::new(MockChannel::default());
            let (sender, _) = sender(Arc::clone(&channel), SenderConfig::default());
            sender
                .send_to_completion(OutgoingFile::from_bytes("f", vec![1u8; size as usize]))
                .await
                .unwrap();

            let msgs = decode_all(&channel.take_sent());
            let announced = match &msgs[0] {
                TransferMessage::Metadata { total_chunks, .. } => *total_chunks,
                other => panic!("expected metadata, got {other:?}"),
            };
            let lengths: Vec<u64> = msgs
                .iter()
                .filter_map(|m| match m {
                    TransferMessage::Chunk { data, .. } => Some(data.len() as u64),
                    _ => None,
                })
                .collect();

            assert_eq!(announced, size.div_ceil(CHUNK), "size {size}");
            assert_eq!(lengths.len() as u64, announced, "size {size}");
            assert_eq!(lengths.iter().sum::<u64>(), size, "size {size}");
            assert!(lengths.iter().all(|&len| len > 0 && len <= CHUNK), "size {size}");
        }
    }

    #[tokio::test]
    async fn empty_file_completes() {
        let channel = Arc::new(MockChannel::default());
        let (sender, registry) = sender(Arc::clone(&channel), small_config());

        let id = sender
            .send_to_completion(OutgoingFile::from_bytes("empty", Vec::new()))
            .await
            .unwrap();

        let msgs = decode_all(&channel.take_sent());
        assert_eq!(msgs.len(), 2);
        assert_eq!(registry.get(&id).unwrap().status, TransferStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn holds_chunks_while_channel_is_saturated() {
        let channel = Arc::new(MockChannel::default());
        channel.set_buffered(101);
        let (sender, registry) = sender(Arc::clone(&channel), small_config());

        let id = sender
            .send(OutgoingFile::from_bytes("a", b"abcdefgh".to_vec()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        // Only the metadata went out.
        assert_eq!(channel.sent_count(), 1);
        assert_eq!(registry.get(&id).unwrap().status, TransferStatus::Transferring);

        channel.set_buffered(0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(channel.sent_count(), 4);
        assert_eq!(registry.get(&id).unwrap().status, TransferStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_fails_transfer() {
        let channel = Arc::new(MockChannel::default());
        channel.set_buffered(1_000);
        let (sender, registry) = sender(Arc::clone(&channel), small_config());

        let id = sender
            .send(OutgoingFile::from_bytes("a", b"abcdefgh".to_vec()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.close();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let t = registry.get(&id).unwrap();
        assert_eq!(t.status, TransferStatus::Failed);
        assert!(t.error.contains("closed"));
    }

    #[tokio::test]
    async fn unreadable_source_is_reported_to_caller() {
        let channel = Arc::new(MockChannel::default());
        let (sender, registry) = sender(Arc::clone(&channel), small_config());

        let result = sender
            .send(OutgoingFile::from_path("/definitely/not/here.bin"))
            .await;
        assert!(matches!(result, Err(TransferError::Io(_))));
        assert!(registry.is_empty());
        assert_eq!(channel.sent_count(), 0);
    }
}
