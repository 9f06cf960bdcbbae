use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer.
///
/// Transitions only move forward (`pending` → `transferring` →
/// `completed`/`failed`); the one exception is the restore-time downgrade of
/// `transferring` to `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
}

impl TransferStatus {
    /// Position in the forward-only lifecycle.
    fn rank(self) -> u8 {
        match self {
            TransferStatus::Pending => 0,
            TransferStatus::Transferring => 1,
            TransferStatus::Completed | TransferStatus::Failed => 2,
        }
    }

    /// Returns `true` if moving from `self` to `next` respects the
    /// forward-only lifecycle.
    pub fn can_advance_to(self, next: TransferStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Returns `true` for `completed` and `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

/// Where received bytes for a transfer are accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Chunks are written straight into a backing file as they arrive.
    Streaming,
    /// Chunks are held in memory until the transfer completes.
    Buffered,
}

/// Which way a transfer flows relative to this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Session role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Claimed a room code and waits for the peer.
    Host,
    /// Obtained a generated identity and dials the host's room code.
    Guest,
}

/// Channel connection state exposed to the rest of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Coarse connection quality.
///
/// No round-trip probing backs this value: it is `excellent` as soon as a
/// channel opens and `poor` after any channel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
    Disconnected,
}
