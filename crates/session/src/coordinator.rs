//! Session coordinator.
//!
//! Tracks identity and the single active channel, dispatches channel events
//! into the transfer engine, and surfaces every change as a
//! [`SessionEvent`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beamdrop_protocol::{ConnectionQuality, Role};
use beamdrop_transfer::{DataChannel, OutgoingFile, TransferEngine};

use crate::SessionError;
use crate::reconnect;
use crate::signaling::{ChannelEvent, ChannelLink, Signaling, SignalingError, SignalingEvent};
use crate::types::{SessionConfig, SessionEvent, SessionInfo, SessionPhase};

/// Capacity of the session event broadcast channel.
const EVENT_CAPACITY: usize = 64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveChannel {
    peer_id: String,
    channel: Arc<dyn DataChannel>,
    /// Stops the dispatch loop.
    cancel: CancellationToken,
}

/// State shared between the coordinator and its background tasks.
pub(crate) struct Shared<S> {
    pub(crate) signaling: Arc<S>,
    pub(crate) engine: Arc<TransferEngine>,
    pub(crate) config: SessionConfig,
    state: RwLock<SessionInfo>,
    active: Mutex<Option<ActiveChannel>>,
    events: broadcast::Sender<SessionEvent>,
    listener_cancel: Mutex<Option<CancellationToken>>,
    pub(crate) reconnect_cancel: Mutex<Option<CancellationToken>>,
}

/// Drives one endpoint's session: identity, channel and reconnects.
pub struct SessionCoordinator<S: Signaling> {
    shared: Arc<Shared<S>>,
}

impl<S: Signaling> Clone for SessionCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Signaling> SessionCoordinator<S> {
    pub fn new(signaling: Arc<S>, engine: Arc<TransferEngine>, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                signaling,
                engine,
                config,
                state: RwLock::new(SessionInfo::default()),
                active: Mutex::new(None),
                events,
                listener_cancel: Mutex::new(None),
                reconnect_cancel: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn info(&self) -> SessionInfo {
        self.shared.info()
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.shared.engine
    }

    pub fn signaling(&self) -> &Arc<S> {
        &self.shared.signaling
    }

    /// Registers an identity.
    ///
    /// With a `room_code` this claims the code and hosts; without one a
    /// generated identity is obtained and the session joins as guest. Any
    /// previous session is torn down first. If the code is already claimed
    /// the local identity state is cleared so a retry starts clean.
    pub async fn open(&self, room_code: Option<&str>) -> Result<String, SessionError> {
        if self.shared.info().self_id.is_some() {
            self.shared.teardown().await;
        }
        reconnect::cancel(&self.shared);

        self.shared.set_phase(SessionPhase::Initializing);
        let registration = match self.shared.signaling.register(room_code).await {
            Ok(r) => r,
            Err(SignalingError::IdentityTaken(code)) => {
                warn!(room = %code, "room code already claimed");
                self.shared.clear_identity();
                return Err(SessionError::IdentityTaken(code));
            }
            Err(e) => {
                warn!(error = %e, "identity registration failed");
                self.shared.clear_identity();
                return Err(e.into());
            }
        };

        let role = if room_code.is_some() {
            Role::Host
        } else {
            Role::Guest
        };
        let id = registration.id.clone();
        self.shared.update(|s| {
            s.self_id = Some(id.clone());
            s.role = Some(role);
            s.room_code = room_code.map(str::to_string);
        });
        self.shared.emit(SessionEvent::IdentityAssigned {
            id: id.clone(),
            role,
        });
        self.shared.set_phase(SessionPhase::Ready);
        info!(id = %id, ?role, "session identity assigned");

        self.start_listener(registration.events);
        Ok(id)
    }

    /// Opens a channel to `target` and waits for it to become usable.
    ///
    /// Fails with [`SessionError::ConnectionFailed`] if the channel errors,
    /// closes, or does not open within the connection timeout. The channel
    /// is closed on failure.
    pub async fn connect(&self, target: &str) -> Result<(), SessionError> {
        if !self.shared.try_begin_connect() {
            return Err(SessionError::NotReady);
        }
        info!(target = %target, "connecting");

        let timeout = self.shared.config.connection_timeout;
        let deadline = Instant::now() + timeout;
        let link = match tokio::time::timeout_at(deadline, self.shared.signaling.open_channel(target)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return self.connect_failed(target, e.to_string()),
            Err(_) => return self.connect_failed(target, format!("no channel within {timeout:?}")),
        };

        let ChannelLink {
            peer_id,
            channel,
            mut events,
        } = link;
        let opened = match tokio::time::timeout_at(deadline, wait_for_open(&mut events)).await {
            Ok(result) => result,
            Err(_) => Err(format!("channel did not open within {timeout:?}")),
        };
        if let Err(reason) = opened {
            channel.close();
            return self.connect_failed(target, reason);
        }
        if self.shared.info().phase != SessionPhase::Connecting {
            // Disconnected while the channel was opening.
            channel.close();
            return Err(SessionError::ConnectionFailed("session closed".into()));
        }

        self.shared.update(|s| {
            if s.role == Some(Role::Guest) {
                s.room_code = Some(target.to_string());
            }
        });
        self.shared.attach(peer_id, channel, events);
        Ok(())
    }

    fn connect_failed(&self, target: &str, reason: String) -> Result<(), SessionError> {
        warn!(target = %target, reason = %reason, "connection failed");
        self.shared.settle_phase();
        Err(SessionError::ConnectionFailed(reason))
    }

    /// Closes the channel, flushes open write handles and releases the
    /// identity. Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        self.shared.teardown().await;
    }

    /// Starts sending `file` over the active channel. Returns the transfer
    /// id; progress is observed through the engine.
    pub async fn send_file(&self, file: OutgoingFile) -> Result<String, SessionError> {
        let channel = lock(&self.shared.active)
            .as_ref()
            .map(|a| Arc::clone(&a.channel))
            .ok_or(SessionError::NotConnected)?;
        let id = self.shared.engine.sender(channel).send(file).await?;
        Ok(id)
    }

    /// Re-opens a session saved before a restart.
    ///
    /// A host reclaims its room code. A guest obtains a fresh identity, waits
    /// for the settle delay, then dials the stored room again.
    pub async fn resume(&self, role: Role, room_code: &str) -> Result<(), SessionError> {
        info!(?role, room = %room_code, "resuming session");
        match role {
            Role::Host => {
                self.open(Some(room_code)).await?;
            }
            Role::Guest => {
                self.open(None).await?;
                tokio::time::sleep(self.shared.config.restore_settle_delay).await;
                self.connect(room_code).await?;
            }
        }
        Ok(())
    }

    fn start_listener(&self, events: mpsc::Receiver<SignalingEvent>) {
        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.shared.listener_cancel).replace(cancel.clone()) {
            previous.cancel();
        }
        tokio::spawn(listen(Arc::clone(&self.shared), events, cancel));
    }
}

impl<S: Signaling> Shared<S> {
    pub(crate) fn info(&self) -> SessionInfo {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut SessionInfo)) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_reconnecting(&self, attempt: u32, delay: std::time::Duration) {
        self.emit(SessionEvent::Reconnecting { attempt, delay });
    }

    fn set_phase(&self, phase: SessionPhase) {
        let changed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let changed = state.phase != phase;
            state.phase = phase;
            changed
        };
        if changed {
            debug!(?phase, "session phase changed");
            self.emit(SessionEvent::PhaseChanged {
                phase,
                state: phase.connection_state(),
            });
        }
    }

    fn set_quality(&self, quality: ConnectionQuality) {
        let changed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let changed = state.quality != quality;
            state.quality = quality;
            changed
        };
        if changed {
            self.emit(SessionEvent::QualityChanged(quality));
        }
    }

    /// `Ready` while an identity is held, `Disconnected` otherwise.
    fn settle_phase(&self) {
        let phase = if self.info().self_id.is_some() {
            SessionPhase::Ready
        } else {
            SessionPhase::Disconnected
        };
        self.set_phase(phase);
    }

    /// Moves `Ready` to `Connecting`. Returns `false` from any other phase.
    fn try_begin_connect(&self) -> bool {
        let began = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let ready = state.phase == SessionPhase::Ready;
            if ready {
                state.phase = SessionPhase::Connecting;
            }
            ready
        };
        if began {
            self.emit(SessionEvent::PhaseChanged {
                phase: SessionPhase::Connecting,
                state: SessionPhase::Connecting.connection_state(),
            });
        }
        began
    }

    fn clear_identity(&self) {
        self.update(|s| {
            s.self_id = None;
            s.role = None;
            s.room_code = None;
        });
        self.set_phase(SessionPhase::Disconnected);
    }

    /// Makes `channel` the active channel and starts dispatching its events.
    fn attach(
        self: &Arc<Self>,
        peer_id: String,
        channel: Arc<dyn DataChannel>,
        events: mpsc::Receiver<ChannelEvent>,
    ) {
        let cancel = CancellationToken::new();
        let previous = lock(&self.active).replace(ActiveChannel {
            peer_id: peer_id.clone(),
            channel,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
            previous.channel.close();
        }

        self.update(|s| s.peer_id = Some(peer_id.clone()));
        self.set_phase(SessionPhase::Connected);
        // Not measured: a fresh channel is assumed excellent.
        self.set_quality(ConnectionQuality::Excellent);
        self.emit(SessionEvent::PeerConnected(peer_id.clone()));
        info!(peer = %peer_id, "channel open");

        tokio::spawn(dispatch(Arc::clone(self), peer_id, events, cancel));
    }

    /// The active channel closed on its own. Not retried.
    fn on_channel_closed(&self, peer_id: &str) {
        let removed = {
            let mut active = lock(&self.active);
            if active.as_ref().is_some_and(|a| a.peer_id == peer_id) {
                active.take()
            } else {
                None
            }
        };
        if removed.is_none() {
            return;
        }

        info!(peer = %peer_id, "channel closed");
        self.update(|s| s.peer_id = None);
        self.set_quality(ConnectionQuality::Disconnected);
        self.settle_phase();
        self.emit(SessionEvent::PeerDisconnected(peer_id.to_string()));
    }

    /// Accepts a channel a peer opened to us, if we host and are idle.
    async fn accept(self: Arc<Self>, link: ChannelLink) {
        let ChannelLink {
            peer_id,
            channel,
            mut events,
        } = link;

        if self.info().role != Some(Role::Host) || !self.try_begin_connect() {
            warn!(peer = %peer_id, "rejecting incoming channel");
            channel.close();
            return;
        }

        let timeout = self.config.connection_timeout;
        let opened = match tokio::time::timeout(timeout, wait_for_open(&mut events)).await {
            Ok(result) => result,
            Err(_) => Err(format!("channel did not open within {timeout:?}")),
        };
        match opened {
            Ok(()) if self.info().phase == SessionPhase::Connecting => {
                self.attach(peer_id, channel, events)
            }
            Ok(()) => channel.close(),
            Err(reason) => {
                warn!(peer = %peer_id, reason = %reason, "incoming channel failed");
                channel.close();
                self.settle_phase();
            }
        }
    }

    /// Full teardown back to `Disconnected`.
    pub(crate) async fn teardown(&self) {
        reconnect::cancel(self);
        if let Some(token) = lock(&self.listener_cancel).take() {
            token.cancel();
        }

        let active = lock(&self.active).take();
        if let Some(active) = &active {
            active.cancel.cancel();
            active.channel.close();
        }

        self.engine.close_all_handles().await;

        let before = self.info();
        if before.self_id.is_some() {
            self.signaling.release().await;
        }
        if before == SessionInfo::default() && active.is_none() {
            debug!("already disconnected");
            return;
        }

        self.update(|s| *s = SessionInfo::default());
        if let Some(peer) = before.peer_id {
            self.emit(SessionEvent::PeerDisconnected(peer));
        }
        if before.quality != ConnectionQuality::Disconnected {
            self.emit(SessionEvent::QualityChanged(ConnectionQuality::Disconnected));
        }
        if before.phase != SessionPhase::Disconnected {
            self.emit(SessionEvent::PhaseChanged {
                phase: SessionPhase::Disconnected,
                state: SessionPhase::Disconnected.connection_state(),
            });
        }
        info!("session disconnected");
    }
}

async fn wait_for_open(events: &mut mpsc::Receiver<ChannelEvent>) -> Result<(), String> {
    loop {
        match events.recv().await {
            Some(ChannelEvent::Open) => return Ok(()),
            Some(ChannelEvent::Error(reason)) => return Err(reason),
            Some(ChannelEvent::Close) | None => return Err("channel closed before opening".into()),
            Some(ChannelEvent::Data(_)) => {}
        }
    }
}

/// Feeds one channel's events into the engine until it closes.
async fn dispatch<S: Signaling>(
    shared: Arc<Shared<S>>,
    peer_id: String,
    mut events: mpsc::Receiver<ChannelEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Some(ChannelEvent::Data(bytes)) => {
                let _ = shared.engine.handle_incoming(&bytes);
            }
            Some(ChannelEvent::Open) => {}
            Some(ChannelEvent::Error(reason)) => {
                warn!(peer = %peer_id, error = %reason, "channel error");
                shared.set_quality(ConnectionQuality::Poor);
            }
            Some(ChannelEvent::Close) | None => {
                shared.on_channel_closed(&peer_id);
                return;
            }
        }
    }
}

/// Handles signaling events for the lifetime of one registration.
async fn listen<S: Signaling>(
    shared: Arc<Shared<S>>,
    mut events: mpsc::Receiver<SignalingEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Some(SignalingEvent::IncomingChannel(link)) => {
                debug!(peer = %link.peer_id, "incoming channel");
                tokio::spawn(Arc::clone(&shared).accept(link));
            }
            Some(SignalingEvent::Error(reason)) => {
                warn!(error = %reason, "signaling error");
            }
            Some(SignalingEvent::Disconnected) => {
                warn!("signaling connection lost");
                reconnect::start(&shared);
            }
            None => {
                debug!("signaling event stream ended");
                return;
            }
        }
    }
}
