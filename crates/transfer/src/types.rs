use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use beamdrop_protocol::{Direction, FileMetadata, StorageMode, TransferStatus};

use crate::storage::{ChunkBuffer, FileRef};

/// Capacity of the transfer event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// One file in flight in one direction.
///
/// This is the serializable record; received bytes live in the
/// [`TransferPayload`] held next to it by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub id: String,
    pub direction: Direction,
    pub metadata: FileMetadata,
    pub total_chunks: u64,
    pub status: TransferStatus,
    /// Percentage in `0.0..=100.0`.
    pub progress: f64,
    pub storage_mode: StorageMode,
    /// Reason for a `failed` status.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Transfer {
    pub fn new(
        id: impl Into<String>,
        direction: Direction,
        metadata: FileMetadata,
        total_chunks: u64,
        storage_mode: StorageMode,
    ) -> Self {
        Self {
            id: id.into(),
            direction,
            metadata,
            total_chunks,
            status: TransferStatus::Transferring,
            progress: 0.0,
            storage_mode,
            error: String::new(),
        }
    }
}

/// Received bytes of a transfer. The two storage forms are exclusive.
#[derive(Debug, Clone, Default)]
pub enum TransferPayload {
    /// Outgoing transfers, and incoming ones whose bytes are gone.
    #[default]
    None,
    Buffered(ChunkBuffer),
    Streaming(FileRef),
}

/// State change notifications published by the [`TransferRegistry`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Created(Transfer),
    Progress { id: String, progress: f64 },
    StatusChanged {
        id: String,
        status: TransferStatus,
        error: Option<String>,
    },
    Removed(String),
    Cleared,
}

struct Entry {
    record: Transfer,
    payload: TransferPayload,
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<String, Entry>,
    /// Insertion order, for stable listing.
    order: Vec<String>,
}

/// Process-wide table of transfers, keyed by id (thread-safe).
///
/// Enforces the record invariants: ids are unique, status only moves
/// forward, and progress never decreases while a transfer is in flight.
pub struct TransferRegistry {
    inner: RwLock<RegistryInner>,
    events: broadcast::Sender<TransferEvent>,
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Subscribes to state change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Registers a new transfer. Returns `false` if the id is already taken.
    pub fn insert(&self, record: Transfer, payload: TransferPayload) -> bool {
        {
            let mut inner = self.write();
            if inner.entries.contains_key(&record.id) {
                return false;
            }
            inner.order.push(record.id.clone());
            inner.entries.insert(
                record.id.clone(),
                Entry {
                    record: record.clone(),
                    payload,
                },
            );
        }
        debug!(transfer = %record.id, direction = ?record.direction, "transfer registered");
        self.emit(TransferEvent::Created(record));
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Transfer> {
        self.read().entries.get(id).map(|e| e.record.clone())
    }

    /// All transfers in creation order.
    pub fn list(&self) -> Vec<Transfer> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Raises the progress of a `transferring` transfer.
    ///
    /// The value is clamped to `0..=100`; lower values than the current one
    /// and updates to transfers in any other state are ignored. Returns
    /// `true` if the stored progress changed.
    pub fn set_progress(&self, id: &str, progress: f64) -> bool {
        let progress = progress.clamp(0.0, 100.0);
        {
            let mut inner = self.write();
            let Some(entry) = inner.entries.get_mut(id) else {
                return false;
            };
            if entry.record.status != TransferStatus::Transferring
                || progress <= entry.record.progress
            {
                return false;
            }
            entry.record.progress = progress;
        }
        self.emit(TransferEvent::Progress {
            id: id.to_string(),
            progress,
        });
        true
    }

    /// Moves a transfer to `status`, if that is a forward transition.
    ///
    /// `completed` also pins progress to 100. `error` is recorded for
    /// `failed`. Returns `true` if the status changed.
    pub fn advance(&self, id: &str, status: TransferStatus, error: Option<String>) -> bool {
        {
            let mut inner = self.write();
            let Some(entry) = inner.entries.get_mut(id) else {
                return false;
            };
            if !entry.record.status.can_advance_to(status) {
                return false;
            }
            entry.record.status = status;
            if status == TransferStatus::Completed {
                entry.record.progress = 100.0;
            }
            if let Some(err) = &error {
                entry.record.error = err.clone();
            }
        }
        debug!(transfer = %id, ?status, "transfer status changed");
        self.emit(TransferEvent::StatusChanged {
            id: id.to_string(),
            status,
            error,
        });
        true
    }

    /// Runs `f` against a transfer's payload under the write lock.
    pub fn with_payload<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut TransferPayload) -> R,
    ) -> Option<R> {
        let mut inner = self.write();
        inner.entries.get_mut(id).map(|e| f(&mut e.payload))
    }

    /// Clone of a transfer's payload.
    pub fn payload(&self, id: &str) -> Option<TransferPayload> {
        self.read().entries.get(id).map(|e| e.payload.clone())
    }

    /// Removes a transfer, returning its record and payload.
    pub fn remove(&self, id: &str) -> Option<(Transfer, TransferPayload)> {
        let removed = {
            let mut inner = self.write();
            let entry = inner.entries.remove(id)?;
            inner.order.retain(|o| o != id);
            (entry.record, entry.payload)
        };
        self.emit(TransferEvent::Removed(id.to_string()));
        Some(removed)
    }

    /// Removes every transfer, returning what was removed.
    pub fn clear(&self) -> Vec<(Transfer, TransferPayload)> {
        let drained: Vec<_> = {
            let mut inner = self.write();
            let order = std::mem::take(&mut inner.order);
            let mut entries = std::mem::take(&mut inner.entries);
            order
                .into_iter()
                .filter_map(|id| entries.remove(&id))
                .map(|e| (e.record, e.payload))
                .collect()
        };
        self.emit(TransferEvent::Cleared);
        drained
    }

    /// Reloads records saved before a restart.
    ///
    /// Anything still `transferring` becomes `failed`: its in-flight bytes
    /// cannot be resumed. Records whose id is already present are skipped.
    /// Returns the number of records restored.
    pub fn restore(
        &self,
        records: impl IntoIterator<Item = (Transfer, TransferPayload)>,
    ) -> usize {
        let mut restored = 0;
        for (mut record, payload) in records {
            if record.status == TransferStatus::Transferring {
                record.status = TransferStatus::Failed;
                if record.error.is_empty() {
                    record.error = "interrupted by restart".into();
                }
            }
            if self.insert(record, payload) {
                restored += 1;
            }
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> Transfer {
        Transfer::new(
            id,
            Direction::Incoming,
            FileMetadata {
                name: "a.bin".into(),
                size: 10,
                mime: "application/octet-stream".into(),
                timestamp: 0,
            },
            1,
            StorageMode::Buffered,
        )
    }

    #[test]
    fn duplicate_id_rejected() {
        let reg = TransferRegistry::new();
        assert!(reg.insert(sample("t1"), TransferPayload::None));
        assert!(!reg.insert(sample("t1"), TransferPayload::None));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let reg = TransferRegistry::new();
        reg.insert(sample("t1"), TransferPayload::None);

        assert!(reg.set_progress("t1", 40.0));
        assert!(!reg.set_progress("t1", 20.0));
        assert_eq!(reg.get("t1").unwrap().progress, 40.0);

        assert!(reg.set_progress("t1", 250.0));
        assert_eq!(reg.get("t1").unwrap().progress, 100.0);
    }

    #[test]
    fn status_never_moves_backward() {
        let reg = TransferRegistry::new();
        reg.insert(sample("t1"), TransferPayload::None);

        assert!(reg.advance("t1", TransferStatus::Completed, None));
        assert_eq!(reg.get("t1").unwrap().progress, 100.0);
        assert!(!reg.advance("t1", TransferStatus::Failed, Some("late".into())));
        assert!(!reg.advance("t1", TransferStatus::Transferring, None));

        let t = reg.get("t1").unwrap();
        assert_eq!(t.status, TransferStatus::Completed);
        assert!(t.error.is_empty());
    }

    #[test]
    fn progress_ignored_once_terminal() {
        let reg = TransferRegistry::new();
        reg.insert(sample("t1"), TransferPayload::None);
        reg.advance("t1", TransferStatus::Failed, Some("boom".into()));

        assert!(!reg.set_progress("t1", 50.0));
        let t = reg.get("t1").unwrap();
        assert_eq!(t.progress, 0.0);
        assert_eq!(t.error, "boom");
    }

    #[test]
    fn list_keeps_creation_order() {
        let reg = TransferRegistry::new();
        for id in ["c", "a", "b"] {
            reg.insert(sample(id), TransferPayload::None);
        }
        reg.remove("a");
        let ids: Vec<String> = reg.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[test]
    fn restore_downgrades_in_flight_records() {
        let reg = TransferRegistry::new();
        let mut done = sample("done");
        done.status = TransferStatus::Completed;
        done.progress = 100.0;
        let mut running = sample("running");
        running.progress = 42.0;

        let n = reg.restore(vec![
            (done, TransferPayload::None),
            (running, TransferPayload::None),
        ]);
        assert_eq!(n, 2);
        assert_eq!(reg.get("done").unwrap().status, TransferStatus::Completed);
        let running = reg.get("running").unwrap();
        assert_eq!(running.status, TransferStatus::Failed);
        assert!(!running.error.is_empty());
    }

    #[tokio::test]
    async fn events_follow_mutations() {
        let reg = TransferRegistry::new();
        let mut rx = reg.subscribe();

        reg.insert(sample("t1"), TransferPayload::None);
        reg.set_progress("t1", 50.0);
        reg.advance("t1", TransferStatus::Completed, None);
        reg.remove("t1");
        reg.clear();

        assert!(matches!(rx.recv().await.unwrap(), TransferEvent::Created(t) if t.id == "t1"));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransferEvent::Progress { progress, .. } if progress == 50.0
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            TransferEvent::StatusChanged { status: TransferStatus::Completed, .. }
        ));
        assert_eq!(rx.recv().await.unwrap(), TransferEvent::Removed("t1".into()));
        assert_eq!(rx.recv().await.unwrap(), TransferEvent::Cleared);
    }

    #[test]
    fn record_serializes_camel_case() {
        let json = serde_json::to_value(sample("t1")).unwrap();
        assert_eq!(json["totalChunks"], 1);
        assert_eq!(json["storageMode"], "buffered");
        assert_eq!(json["direction"], "incoming");
        assert!(json.get("error").is_none());
    }
}
