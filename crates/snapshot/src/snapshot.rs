use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use beamdrop_logbook::LogEntry;
use beamdrop_protocol::{Role, TransferStatus};
use beamdrop_session::SessionInfo;
use beamdrop_transfer::{StorageCapabilities, Transfer};

/// Current snapshot format.
pub const SNAPSHOT_VERSION: u32 = 1;

/// UI-adjacent settings carried through restarts, opaque to the core.
pub type Preferences = BTreeMap<String, serde_json::Value>;

/// Reduced, durable view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_code: Option<String>,
    /// Only kept for hosts; a guest always gets a fresh identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default)]
    pub transfers: Vec<Transfer>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<StorageCapabilities>,
    #[serde(default)]
    pub preferences: Preferences,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            room_code: None,
            self_id: None,
            role: None,
            transfers: Vec::new(),
            logs: Vec::new(),
            capabilities: None,
            preferences: Preferences::new(),
        }
    }
}

impl Snapshot {
    /// Builds a normalized snapshot from live state.
    pub fn capture(
        session: &SessionInfo,
        transfers: Vec<Transfer>,
        logs: Vec<LogEntry>,
        capabilities: Option<StorageCapabilities>,
        preferences: Preferences,
    ) -> Self {
        let mut snapshot = Self {
            version: SNAPSHOT_VERSION,
            room_code: session.room_code.clone(),
            self_id: session.self_id.clone(),
            role: session.role,
            transfers,
            logs,
            capabilities,
            preferences,
        };
        snapshot.normalize();
        snapshot
    }

    /// Applies the persistence rules.
    ///
    /// In-flight transfers cannot be resumed after a restart, so
    /// `transferring` becomes `failed`. Guests drop their identity.
    pub fn normalize(&mut self) {
        if self.role != Some(Role::Host) {
            self.self_id = None;
        }
        for transfer in &mut self.transfers {
            if transfer.status == TransferStatus::Transferring {
                transfer.status = TransferStatus::Failed;
                if transfer.error.is_empty() {
                    transfer.error = "interrupted by restart".into();
                }
            }
        }
    }

    /// Returns the role and room to re-open, if the session had one.
    pub fn resume_target(&self) -> Option<(Role, &str)> {
        match (self.role, self.room_code.as_deref()) {
            (Some(role), Some(code)) => Some((role, code)),
            _ => None,
        }
    }
}
