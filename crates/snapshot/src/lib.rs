//! Durable session snapshots.
//!
//! A [`Snapshot`] is the reduced, serializable view of a session: identity,
//! transfer records without payloads, recent logs, storage capabilities and
//! preferences. [`SnapshotStore`] writes it to a [`KvBackend`], rewrites it
//! after every burst of changes, and drives the session back on start.

pub mod backend;
mod snapshot;
mod store;

pub use backend::{JsonDirBackend, KvBackend, MemoryBackend, config_dir, default_state_dir};
pub use snapshot::{Preferences, SNAPSHOT_VERSION, Snapshot};
pub use store::{SNAPSHOT_KEY, SnapshotStore};

/// Errors from snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid snapshot key: {0}")]
    InvalidKey(String),
}
