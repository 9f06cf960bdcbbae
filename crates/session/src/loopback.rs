//! In-process transport.
//!
//! [`LoopbackNetwork`] is a rendezvous table shared by any number of
//! [`LoopbackSignaling`] endpoints. Channels between them are pairs of
//! [`LoopbackChannel`]s: each side queues outbound frames on its own wire,
//! a pump task delivers them into the peer's bounded event queue, and the
//! buffered-amount counter covers everything queued but not yet delivered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use beamdrop_transfer::{ChannelError, DataChannel};

use crate::signaling::{ChannelEvent, ChannelLink, Registration, Signaling, SignalingError, SignalingEvent};

/// Capacity of each channel's inbound event queue.
const EVENT_CAPACITY: usize = 64;

/// Capacity of each endpoint's signaling event queue.
const SIGNALING_CAPACITY: usize = 32;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

enum Frame {
    Data(Vec<u8>),
    Close,
}

/// One end of an in-memory channel pair.
pub struct LoopbackChannel {
    wire: mpsc::UnboundedSender<Frame>,
    buffered: Arc<AtomicUsize>,
    /// Shared by both ends.
    open: Arc<AtomicBool>,
    local_events: mpsc::Sender<ChannelEvent>,
}

/// One end of a pair with the events it receives.
pub type LoopbackEnd = (Arc<LoopbackChannel>, mpsc::Receiver<ChannelEvent>);

impl LoopbackChannel {
    /// Creates a connected pair. Both event streams start with
    /// [`ChannelEvent::Open`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn pair() -> (LoopbackEnd, LoopbackEnd) {
        let open = Arc::new(AtomicBool::new(true));
        let (a_tx, a_rx) = mpsc::channel(EVENT_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(EVENT_CAPACITY);
        // Fresh queues, cannot be full.
        let _ = a_tx.try_send(ChannelEvent::Open);
        let _ = b_tx.try_send(ChannelEvent::Open);

        let a = Self::half(Arc::clone(&open), a_tx.clone(), b_tx.clone());
        let b = Self::half(open, b_tx, a_tx);
        ((a, a_rx), (b, b_rx))
    }

    fn half(
        open: Arc<AtomicBool>,
        local_events: mpsc::Sender<ChannelEvent>,
        peer_events: mpsc::Sender<ChannelEvent>,
    ) -> Arc<Self> {
        let (wire, frames) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        tokio::spawn(pump(frames, peer_events, Arc::clone(&buffered)));
        Arc::new(Self {
            wire,
            buffered,
            open,
            local_events,
        })
    }

    /// Raises a [`ChannelEvent::Error`] on this end, as a transport fault
    /// would.
    pub fn inject_error(&self, reason: impl Into<String>) {
        let _ = self.local_events.try_send(ChannelEvent::Error(reason.into()));
    }
}

impl DataChannel for LoopbackChannel {
    fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let len = payload.len();
        self.buffered.fetch_add(len, Ordering::SeqCst);
        self.wire.send(Frame::Data(payload)).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            ChannelError::Closed
        })
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Closes both ends. The peer sees [`ChannelEvent::Close`] after any
    /// frames already queued.
    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.wire.send(Frame::Close);
        }
    }
}

async fn pump(
    mut frames: mpsc::UnboundedReceiver<Frame>,
    peer: mpsc::Sender<ChannelEvent>,
    buffered: Arc<AtomicUsize>,
) {
    while let Some(frame) = frames.recv().await {
        match frame {
            Frame::Data(bytes) => {
                let len = bytes.len();
                let delivered = peer.send(ChannelEvent::Data(bytes)).await.is_ok();
                buffered.fetch_sub(len, Ordering::SeqCst);
                if !delivered {
                    break;
                }
            }
            Frame::Close => {
                let _ = peer.send(ChannelEvent::Close).await;
                break;
            }
        }
    }
    trace!("loopback pump stopped");
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// Shared rendezvous table for loopback endpoints.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    peers: Arc<Mutex<HashMap<String, mpsc::Sender<SignalingEvent>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new signaling endpoint attached to this network.
    pub fn endpoint(&self) -> LoopbackSignaling {
        LoopbackSignaling {
            network: self.clone(),
            id: Mutex::new(None),
            own_events: Mutex::new(None),
            last_channel: Mutex::new(None),
            failing_reconnects: AtomicU32::new(0),
            reconnects: AtomicU32::new(0),
        }
    }

    pub fn is_registered(&self, id: &str) -> bool {
        lock(&self.peers).contains_key(id)
    }
}

/// A [`Signaling`] endpoint on a [`LoopbackNetwork`].
pub struct LoopbackSignaling {
    network: LoopbackNetwork,
    id: Mutex<Option<String>>,
    own_events: Mutex<Option<mpsc::Sender<SignalingEvent>>>,
    last_channel: Mutex<Option<Arc<LoopbackChannel>>>,
    failing_reconnects: AtomicU32,
    reconnects: AtomicU32,
}

impl LoopbackSignaling {
    pub fn id(&self) -> Option<String> {
        lock(&self.id).clone()
    }

    /// Reports an unexpected signaling drop to whoever holds the
    /// registration.
    pub fn simulate_drop(&self) {
        if let Some(tx) = lock(&self.own_events).as_ref() {
            let _ = tx.try_send(SignalingEvent::Disconnected);
        }
    }

    /// Makes the next `n` reconnect attempts fail.
    pub fn fail_next_reconnects(&self, n: u32) {
        self.failing_reconnects.store(n, Ordering::SeqCst);
    }

    /// Successful reconnects so far.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Local end of the most recent channel this endpoint opened.
    pub fn last_channel(&self) -> Option<Arc<LoopbackChannel>> {
        lock(&self.last_channel).clone()
    }

    fn generated_id() -> String {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        format!("peer-{}", &raw[..8])
    }
}

impl Signaling for LoopbackSignaling {
    async fn register(&self, requested: Option<&str>) -> Result<Registration, SignalingError> {
        let id = requested.map_or_else(Self::generated_id, str::to_string);
        let (tx, rx) = mpsc::channel(SIGNALING_CAPACITY);
        {
            let mut peers = lock(&self.network.peers);
            if peers.contains_key(&id) {
                return Err(SignalingError::IdentityTaken(id));
            }
            if let Some(old) = lock(&self.id).take() {
                peers.remove(&old);
            }
            peers.insert(id.clone(), tx.clone());
        }
        *lock(&self.id) = Some(id.clone());
        *lock(&self.own_events) = Some(tx);
        debug!(id = %id, "loopback identity registered");
        Ok(Registration { id, events: rx })
    }

    async fn reconnect(&self) -> Result<(), SignalingError> {
        if lock(&self.id).is_none() {
            return Err(SignalingError::NotRegistered);
        }
        let failing = self.failing_reconnects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_reconnects.store(failing - 1, Ordering::SeqCst);
            return Err(SignalingError::Unavailable("simulated outage".into()));
        }
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn open_channel(&self, target: &str) -> Result<ChannelLink, SignalingError> {
        let self_id = self.id().ok_or(SignalingError::NotRegistered)?;
        let peer_tx = lock(&self.network.peers)
            .get(target)
            .cloned()
            .ok_or_else(|| SignalingError::PeerUnavailable(target.to_string()))?;

        let ((local, local_events), (remote, remote_events)) = LoopbackChannel::pair();
        let incoming = ChannelLink {
            peer_id: self_id,
            channel: remote,
            events: remote_events,
        };
        peer_tx
            .send(SignalingEvent::IncomingChannel(incoming))
            .await
            .map_err(|_| SignalingError::PeerUnavailable(target.to_string()))?;

        *lock(&self.last_channel) = Some(Arc::clone(&local));
        Ok(ChannelLink {
            peer_id: target.to_string(),
            channel: local,
            events: local_events,
        })
    }

    async fn release(&self) {
        if let Some(id) = lock(&self.id).take() {
            lock(&self.network.peers).remove(&id);
            debug!(id = %id, "loopback identity released");
        }
        lock(&self.own_events).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_in_order_and_drains_counter() {
        let ((a, mut a_rx), (b, mut b_rx)) = LoopbackChannel::pair();
        assert_eq!(a_rx.recv().await, Some(ChannelEvent::Open));
        assert_eq!(b_rx.recv().await, Some(ChannelEvent::Open));

        a.send(b"one".to_vec()).unwrap();
        a.send(b"two".to_vec()).unwrap();
        assert_eq!(b_rx.recv().await, Some(ChannelEvent::Data(b"one".to_vec())));
        assert_eq!(b_rx.recv().await, Some(ChannelEvent::Data(b"two".to_vec())));

        tokio::task::yield_now().await;
        assert_eq!(a.buffered_amount(), 0);
        assert!(b.is_open());
    }

    #[tokio::test]
    async fn unread_frames_count_as_buffered() {
        let ((a, _a_rx), (_b, _b_rx)) = LoopbackChannel::pair();
        // The peer never reads: its queue fills and the rest stays buffered.
        for _ in 0..(EVENT_CAPACITY + 10) {
            a.send(vec![0u8; 100]).unwrap();
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        // One Open plus delivered frames fill the queue; ten remain.
        assert!(a.buffered_amount() >= 10 * 100);
    }

    #[tokio::test]
    async fn close_reaches_peer_after_pending_data() {
        let ((a, _a_rx), (b, mut b_rx)) = LoopbackChannel::pair();
        b_rx.recv().await;

        a.send(b"last".to_vec()).unwrap();
        a.close();
        a.close();

        assert_eq!(b_rx.recv().await, Some(ChannelEvent::Data(b"last".to_vec())));
        assert_eq!(b_rx.recv().await, Some(ChannelEvent::Close));
        assert!(!b.is_open());
        assert_eq!(b.send(b"x".to_vec()), Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn register_rejects_taken_code() {
        let net = LoopbackNetwork::new();
        let host = net.endpoint();
        let other = net.endpoint();

        host.register(Some("ROOM1")).await.unwrap();
        let err = other.register(Some("ROOM1")).await.unwrap_err();
        assert_eq!(err, SignalingError::IdentityTaken("ROOM1".into()));

        host.release().await;
        assert!(!net.is_registered("ROOM1"));
        other.register(Some("ROOM1")).await.unwrap();
    }

    #[tokio::test]
    async fn open_channel_announces_to_target() {
        let net = LoopbackNetwork::new();
        let host = net.endpoint();
        let guest = net.endpoint();

        let mut host_reg = host.register(Some("ROOM1")).await.unwrap();
        let guest_reg = guest.register(None).await.unwrap();

        let link = guest.open_channel("ROOM1").await.unwrap();
        assert_eq!(link.peer_id, "ROOM1");

        match host_reg.events.recv().await {
            Some(SignalingEvent::IncomingChannel(incoming)) => {
                assert_eq!(incoming.peer_id, guest_reg.id);
            }
            other => panic!("expected incoming channel, got {other:?}"),
        }
        assert!(matches!(
            guest.open_channel("NOPE").await,
            Err(SignalingError::PeerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn scripted_reconnect_failures() {
        let net = LoopbackNetwork::new();
        let ep = net.endpoint();
        assert_eq!(ep.reconnect().await, Err(SignalingError::NotRegistered));

        ep.register(None).await.unwrap();
        ep.fail_next_reconnects(1);
        assert!(ep.reconnect().await.is_err());
        assert!(ep.reconnect().await.is_ok());
        assert_eq!(ep.reconnect_count(), 1);
    }
}
