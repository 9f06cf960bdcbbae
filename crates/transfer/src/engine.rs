use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use beamdrop_protocol::{Direction, StorageMode, TransferMessage};

use crate::TransferError;
use crate::channel::DataChannel;
use crate::receiver::TransferReceiver;
use crate::sender::{SenderConfig, TransferSender};
use crate::sequencer::Completion;
use crate::storage::{FileStore, StorageCapabilities};
use crate::types::{Transfer, TransferEvent, TransferPayload, TransferRegistry};

/// Engine settings.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Directory for streaming-mode backing files. `None` keeps every
    /// transfer in memory.
    pub storage_root: Option<PathBuf>,
    pub sender: SenderConfig,
}

/// Owns the transfer registry and the storage backends, and hands out
/// senders bound to a channel.
pub struct TransferEngine {
    registry: Arc<TransferRegistry>,
    store: Option<Arc<FileStore>>,
    capabilities: StorageCapabilities,
    receiver: TransferReceiver,
    sender_config: SenderConfig,
}

impl TransferEngine {
    /// Builds an engine, probing `storage_root` for streaming support.
    pub async fn new(config: EngineConfig) -> Self {
        let capabilities = match &config.storage_root {
            Some(root) => StorageCapabilities::detect(root).await,
            None => StorageCapabilities::buffered(),
        };
        Self::with_capabilities(config, capabilities)
    }

    /// Builds an engine with already known capabilities.
    pub fn with_capabilities(config: EngineConfig, capabilities: StorageCapabilities) -> Self {
        let store = match (&config.storage_root, capabilities.mode) {
            (Some(root), StorageMode::Streaming) => Some(Arc::new(FileStore::new(root.clone()))),
            _ => None,
        };
        let capabilities = if store.is_none() && capabilities.mode == StorageMode::Streaming {
            StorageCapabilities::buffered()
        } else {
            capabilities
        };

        let registry = Arc::new(TransferRegistry::new());
        let receiver = TransferReceiver::new(
            Arc::clone(&registry),
            store.clone(),
            config.sender.chunk_size,
        );
        info!(
            mode = ?capabilities.mode,
            environment = %capabilities.environment_label,
            root = ?store.as_ref().map(|s| s.root().display().to_string()),
            "transfer engine ready"
        );
        Self {
            registry,
            store,
            capabilities,
            receiver,
            sender_config: config.sender,
        }
    }

    pub fn capabilities(&self) -> &StorageCapabilities {
        &self.capabilities
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.registry.subscribe()
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.registry.list()
    }

    /// A sender that streams over `channel`.
    pub fn sender(&self, channel: Arc<dyn DataChannel>) -> TransferSender {
        TransferSender::new(
            Arc::clone(&self.registry),
            channel,
            self.capabilities.mode,
            self.sender_config.clone(),
        )
    }

    /// Schedules an already decoded message.
    pub fn handle_message(&self, msg: TransferMessage) -> Completion {
        self.receiver.handle(msg)
    }

    /// Decodes and schedules a raw channel payload.
    ///
    /// Malformed payloads are logged and dropped.
    pub fn handle_incoming(&self, bytes: &[u8]) -> Option<Completion> {
        match TransferMessage::decode(bytes) {
            Ok(msg) => {
                trace!(kind = msg.kind(), transfer = %msg.transfer_id(), "incoming message");
                Some(self.receiver.handle(msg))
            }
            Err(e) => {
                warn!(len = bytes.len(), error = %e, "malformed transfer message, dropping");
                None
            }
        }
    }

    /// Reassembled bytes of a received transfer.
    pub async fn read_file(&self, id: &str) -> Result<Vec<u8>, TransferError> {
        match self.registry.payload(id) {
            None => Err(TransferError::UnknownTransfer(id.to_string())),
            Some(TransferPayload::Buffered(buffer)) => Ok(buffer.assemble()),
            Some(TransferPayload::Streaming(file_ref)) => match &self.store {
                Some(store) => store.read_all(&file_ref).await,
                None => Err(TransferError::PayloadUnavailable(id.to_string())),
            },
            Some(TransferPayload::None) => Err(TransferError::PayloadUnavailable(id.to_string())),
        }
    }

    /// Removes a transfer and its backing file. Returns `false` if unknown.
    pub async fn delete_transfer(&self, id: &str) -> bool {
        let Some((_, payload)) = self.registry.remove(id) else {
            return false;
        };
        self.release_payload(id, payload).await;
        debug!(transfer = %id, "transfer deleted");
        true
    }

    /// Removes every transfer. Returns how many were removed.
    pub async fn clear_history(&self) -> usize {
        let removed = self.registry.clear();
        let count = removed.len();
        for (record, payload) in removed {
            self.release_payload(&record.id, payload).await;
        }
        info!(count, "transfer history cleared");
        count
    }

    async fn release_payload(&self, id: &str, payload: TransferPayload) {
        if let (TransferPayload::Streaming(_), Some(store)) = (payload, &self.store) {
            if let Err(e) = store.delete(id).await {
                warn!(transfer = %id, error = %e, "failed to delete backing file");
            }
        }
    }

    /// Flushes and closes every open write handle. Returns how many closed.
    pub async fn close_all_handles(&self) -> usize {
        match &self.store {
            Some(store) => {
                let closed = store.close_all().await;
                if closed > 0 {
                    info!(closed, "write handles closed");
                }
                closed
            }
            None => 0,
        }
    }

    /// Reloads transfer records saved before a restart.
    ///
    /// Streaming-mode incoming records get their backing file back when it
    /// still exists, so they can be read or deleted. In-flight records come
    /// back as `failed`.
    pub fn restore(&self, records: Vec<Transfer>) -> usize {
        let entries = records.into_iter().map(|record| {
            let payload = self.restored_payload(&record);
            (record, payload)
        });
        let restored = self.registry.restore(entries);
        info!(restored, "transfers restored");
        restored
    }

    fn restored_payload(&self, record: &Transfer) -> TransferPayload {
        if record.direction != Direction::Incoming || record.storage_mode != StorageMode::Streaming
        {
            return TransferPayload::None;
        }
        self.store
            .as_ref()
            .and_then(|store| store.file_ref(&record.id).ok())
            .filter(|file_ref| file_ref.path.exists())
            .map_or(TransferPayload::None, TransferPayload::Streaming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::MockChannel;
    use crate::chunked::{OutgoingFile, checksum_bytes};
    use beamdrop_protocol::TransferStatus;
    use tempfile::TempDir;

    fn small_sender() -> SenderConfig {
        SenderConfig {
            chunk_size: 1024,
            ..SenderConfig::default()
        }
    }

    async fn streaming_engine(dir: &TempDir) -> TransferEngine {
        TransferEngine::new(EngineConfig {
            storage_root: Some(dir.path().to_path_buf()),
            sender: small_sender(),
        })
        .await
    }

    async fn buffered_engine() -> TransferEngine {
        TransferEngine::new(EngineConfig {
            storage_root: None,
            sender: small_sender(),
        })
        .await
    }

    fn sample_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Sends `data` from `from` and replays the frames into `to`.
    async fn transfer(from: &TransferEngine, to: &TransferEngine, data: &[u8]) -> String {
        let channel = Arc::new(MockChannel::default());
        let sender = from.sender(channel.clone());
        let id = sender
            .send_to_completion(OutgoingFile::from_bytes("data.bin", data.to_vec()))
            .await
            .unwrap();

        let mut last = None;
        for frame in channel.take_sent() {
            last = to.handle_incoming(&frame);
        }
        last.unwrap().wait().await.unwrap();
        id
    }

    #[tokio::test]
    async fn buffered_round_trip_is_byte_identical() {
        let a = buffered_engine().await;
        let b = buffered_engine().await;
        let data = sample_bytes(10_000);

        let id = transfer(&a, &b, &data).await;

        let received = b.registry().get(&id).unwrap();
        assert_eq!(received.status, TransferStatus::Completed);
        assert_eq!(received.storage_mode, StorageMode::Buffered);
        assert_eq!(checksum_bytes(&b.read_file(&id).await.unwrap()), checksum_bytes(&data));
    }

    #[tokio::test]
    async fn streaming_round_trip_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let a = buffered_engine().await;
        let b = streaming_engine(&dir).await;
        assert_eq!(b.capabilities().mode, StorageMode::Streaming);
        let data = sample_bytes(10_000);

        let id = transfer(&a, &b, &data).await;

        let received = b.registry().get(&id).unwrap();
        assert_eq!(received.status, TransferStatus::Completed);
        assert_eq!(received.storage_mode, StorageMode::Streaming);
        assert_eq!(b.read_file(&id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped() {
        let engine = buffered_engine().await;
        assert!(engine.handle_incoming(b"not json").is_none());
        assert!(engine.handle_incoming(br#"{"type":"bogus"}"#).is_none());
        assert!(engine.transfers().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_backing_file() {
        let dir = TempDir::new().unwrap();
        let a = buffered_engine().await;
        let b = streaming_engine(&dir).await;
        let id = transfer(&a, &b, &sample_bytes(3000)).await;

        let Some(TransferPayload::Streaming(file_ref)) = b.registry().payload(&id) else {
            panic!("expected streaming payload");
        };
        assert!(file_ref.path.exists());

        assert!(b.delete_transfer(&id).await);
        assert!(!file_ref.path.exists());
        assert!(!b.delete_transfer(&id).await);
        assert!(matches!(
            b.read_file(&id).await,
            Err(TransferError::UnknownTransfer(_))
        ));
    }

    #[tokio::test]
    async fn clear_history_removes_everything() {
        let dir = TempDir::new().unwrap();
        let a = buffered_engine().await;
        let b = streaming_engine(&dir).await;
        transfer(&a, &b, &sample_bytes(100)).await;
        transfer(&a, &b, &sample_bytes(200)).await;

        assert_eq!(b.clear_history().await, 2);
        assert!(b.transfers().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn close_all_handles_flushes_in_flight_transfers() {
        let dir = TempDir::new().unwrap();
        let engine = streaming_engine(&dir).await;
        let metadata = TransferMessage::Metadata {
            transfer_id: "t1".into(),
            metadata: beamdrop_protocol::FileMetadata {
                name: "x".into(),
                size: 2048,
                mime: "application/octet-stream".into(),
                timestamp: 0,
            },
            total_chunks: 2,
        };
        engine.handle_message(metadata).wait().await.unwrap();

        assert_eq!(engine.close_all_handles().await, 1);
        assert_eq!(engine.close_all_handles().await, 0);
    }

    #[tokio::test]
    async fn restore_reattaches_backing_files() {
        let dir = TempDir::new().unwrap();
        let a = buffered_engine().await;
        let b = streaming_engine(&dir).await;
        let data = sample_bytes(2500);
        let id = transfer(&a, &b, &data).await;
        let mut records = b.transfers();
        records[0].status = TransferStatus::Transferring;

        let reloaded = streaming_engine(&dir).await;
        assert_eq!(reloaded.restore(records), 1);

        let t = reloaded.registry().get(&id).unwrap();
        assert_eq!(t.status, TransferStatus::Failed);
        assert_eq!(reloaded.read_file(&id).await.unwrap(), data);
    }
}
