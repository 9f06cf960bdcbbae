//! Snapshot persistence, autosave and restore.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamdrop_logbook::Logbook;
use beamdrop_session::{SessionCoordinator, Signaling};

use crate::SnapshotError;
use crate::backend::KvBackend;
use crate::snapshot::{Preferences, SNAPSHOT_VERSION, Snapshot};

/// Backend name the session snapshot is stored under.
pub const SNAPSHOT_KEY: &str = "session";

/// Reads and writes the session snapshot through a [`KvBackend`].
pub struct SnapshotStore {
    backend: Arc<dyn KvBackend>,
    key: String,
    preferences: RwLock<Preferences>,
}

impl SnapshotStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self::with_key(backend, SNAPSHOT_KEY)
    }

    pub fn with_key(backend: Arc<dyn KvBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            preferences: RwLock::new(Preferences::new()),
        }
    }

    /// Normalizes and writes `snapshot`.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        write_snapshot(self.backend.as_ref(), &self.key, snapshot.clone())
    }

    /// Reads the stored snapshot.
    ///
    /// A snapshot that does not parse or carries another version is treated
    /// as absent.
    pub fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let Some(json) = self.backend.get(&self.key)? else {
            return Ok(None);
        };
        let mut snapshot: Snapshot = match serde_json::from_str(&json) {
            Ok(s) => s,
            Err(e) => {
                warn!(key = %self.key, error = %e, "ignoring unreadable snapshot");
                return Ok(None);
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                key = %self.key,
                version = snapshot.version,
                expected = SNAPSHOT_VERSION,
                "ignoring snapshot with unknown version"
            );
            return Ok(None);
        }
        snapshot.normalize();
        Ok(Some(snapshot))
    }

    pub fn clear(&self) -> Result<(), SnapshotError> {
        self.backend.delete(&self.key)
    }

    pub fn set_preference(&self, name: impl Into<String>, value: serde_json::Value) {
        self.preferences
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value);
    }

    pub fn preferences(&self) -> Preferences {
        self.preferences
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Builds a snapshot of the live session.
    pub fn capture<S: Signaling>(
        &self,
        session: &SessionCoordinator<S>,
        logbook: &Logbook,
    ) -> Snapshot {
        let engine = session.engine();
        Snapshot::capture(
            &session.info(),
            engine.transfers(),
            logbook.entries(),
            Some(engine.capabilities().clone()),
            self.preferences(),
        )
    }

    /// Captures the live session and writes it on the blocking pool,
    /// logging failures.
    pub async fn persist<S: Signaling>(&self, session: &SessionCoordinator<S>, logbook: &Logbook) {
        let snapshot = self.capture(session, logbook);
        let (transfers, logs) = (snapshot.transfers.len(), snapshot.logs.len());
        let backend = Arc::clone(&self.backend);
        let key = self.key.clone();

        let written =
            tokio::task::spawn_blocking(move || write_snapshot(backend.as_ref(), &key, snapshot))
                .await;
        match written {
            Ok(Ok(())) => debug!(transfers, logs, "snapshot saved"),
            Ok(Err(e)) => warn!(error = %e, "failed to save snapshot"),
            Err(e) => warn!(error = %e, "snapshot writer task failed"),
        }
    }

    /// Rewrites the snapshot after every burst of session or transfer
    /// events until `cancel` fires, then saves one last time.
    ///
    /// Events arriving within `debounce` of each other are coalesced into a
    /// single write.
    pub fn autosave<S: Signaling>(
        self: Arc<Self>,
        session: SessionCoordinator<S>,
        logbook: Logbook,
        debounce: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut session_events = session.subscribe();
        let mut transfer_events = session.engine().subscribe();

        tokio::spawn(async move {
            loop {
                let open = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    r = session_events.recv() => still_open(r),
                    r = transfer_events.recv() => still_open(r),
                };
                if !open {
                    break;
                }

                let deadline = Instant::now() + debounce;
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(deadline) => break,
                        _ = session_events.recv() => {}
                        _ = transfer_events.recv() => {}
                    }
                }
                self.persist(&session, &logbook).await;
            }

            self.persist(&session, &logbook).await;
            debug!("autosave stopped");
        })
    }

    /// Loads the stored snapshot and drives the session back to it.
    ///
    /// Transfer records and logs are reloaded first. If the snapshot names a
    /// room, the session resumes it; a failed resume is logged and the
    /// session is left disconnected. Returns the snapshot that was applied.
    pub async fn restore<S: Signaling>(
        &self,
        session: &SessionCoordinator<S>,
        logbook: &Logbook,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        let Some(snapshot) = self.load()? else {
            debug!("no snapshot to restore");
            return Ok(None);
        };

        session.engine().restore(snapshot.transfers.clone());
        logbook.restore(snapshot.logs.clone());
        *self
            .preferences
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot.preferences.clone();

        if let Some((role, room)) = snapshot.resume_target() {
            info!(?role, room = %room, "restoring session");
            if let Err(e) = session.resume(role, room).await {
                warn!(room = %room, error = %e, "could not resume session");
            }
        }
        Ok(Some(snapshot))
    }
}

fn write_snapshot(
    backend: &dyn KvBackend,
    key: &str,
    mut snapshot: Snapshot,
) -> Result<(), SnapshotError> {
    snapshot.normalize();
    let json = serde_json::to_string_pretty(&snapshot)?;
    backend.set(key, &json)
}

/// Lagged receivers still signal a change; only a closed channel ends the
/// loop.
fn still_open<T>(result: Result<T, RecvError>) -> bool {
    !matches!(result, Err(RecvError::Closed))
}
