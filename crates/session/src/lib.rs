//! Session coordination for beamdrop.
//!
//! Owns the local identity, opens and accepts the point-to-point channel,
//! feeds channel data into the transfer engine, and restores the signaling
//! connection with exponential backoff when it drops unexpectedly.

mod coordinator;
pub mod loopback;
mod reconnect;
pub mod signaling;
pub mod types;

pub use coordinator::SessionCoordinator;
pub use signaling::{
    ChannelEvent, ChannelLink, IceServer, IceServerProvider, Registration, Signaling,
    SignalingError, SignalingEvent,
};
pub use types::{ReconnectConfig, SessionConfig, SessionEvent, SessionInfo, SessionPhase};

use beamdrop_transfer::TransferError;

/// Errors returned by [`SessionCoordinator`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The requested room code is already claimed by another endpoint.
    #[error("identity already taken: {0}")]
    IdentityTaken(String),

    /// The channel could not be opened, including connect timeouts.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("session has no identity; call open first")]
    NotReady,

    #[error("no active channel")]
    NotConnected,

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}
