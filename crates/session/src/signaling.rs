//! Seams to the transport layer.
//!
//! The coordinator never touches sockets. It drives a [`Signaling`]
//! implementation that registers identities and produces ready-made
//! channels, and consumes each channel's events as a [`ChannelEvent`]
//! stream.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use beamdrop_transfer::DataChannel;

/// Events raised by an established or establishing channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Data(Vec<u8>),
    Close,
    Error(String),
}

/// A channel to a peer plus its event stream.
pub struct ChannelLink {
    pub peer_id: String,
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

impl fmt::Debug for ChannelLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLink")
            .field("peer_id", &self.peer_id)
            .field("open", &self.channel.is_open())
            .finish_non_exhaustive()
    }
}

/// Events raised by the signaling connection itself.
#[derive(Debug)]
pub enum SignalingEvent {
    /// The signaling connection dropped unexpectedly.
    Disconnected,
    Error(String),
    /// A peer opened a channel to us.
    IncomingChannel(ChannelLink),
}

/// A registered identity and the signaling event stream bound to it.
///
/// The stream outlives signaling reconnects and ends when the identity is
/// released.
#[derive(Debug)]
pub struct Registration {
    pub id: String,
    pub events: mpsc::Receiver<SignalingEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    #[error("identity already taken: {0}")]
    IdentityTaken(String),

    #[error("peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("signaling unavailable: {0}")]
    Unavailable(String),

    #[error("not registered")]
    NotRegistered,
}

/// Rendezvous and channel establishment.
pub trait Signaling: Send + Sync + 'static {
    /// Claims `requested` as our identity, or obtains a generated one when
    /// `None`. Fails with [`SignalingError::IdentityTaken`] if the code is
    /// already claimed.
    fn register(
        &self,
        requested: Option<&str>,
    ) -> impl Future<Output = Result<Registration, SignalingError>> + Send;

    /// Re-establishes a dropped signaling connection under the current
    /// identity.
    fn reconnect(&self) -> impl Future<Output = Result<(), SignalingError>> + Send;

    /// Starts opening a channel to `target`. The link reports
    /// [`ChannelEvent::Open`] once usable.
    fn open_channel(
        &self,
        target: &str,
    ) -> impl Future<Output = Result<ChannelLink, SignalingError>> + Send;

    /// Gives up the current identity.
    fn release(&self) -> impl Future<Output = ()> + Send;
}

/// A STUN/TURN server entry handed to the channel-establishment layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Source of relay credentials. Only the transport consumes this.
pub trait IceServerProvider: Send + Sync {
    fn ice_servers(&self) -> impl Future<Output = Result<Vec<IceServer>, SignalingError>> + Send;
}

/// A fixed server list, typically from configuration.
impl IceServerProvider for Vec<IceServer> {
    fn ice_servers(&self) -> impl Future<Output = Result<Vec<IceServer>, SignalingError>> + Send {
        let servers = self.clone();
        async move { Ok(servers) }
    }
}
