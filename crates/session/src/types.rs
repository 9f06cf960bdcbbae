//! Public types for the session coordinator.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use beamdrop_protocol::constants::{CONNECTION_TIMEOUT, RESTORE_SETTLE_DELAY};
use beamdrop_protocol::{ConnectionQuality, ConnectionState, Role};

/// Coordinator lifecycle.
///
/// `Disconnected → Initializing → Ready → Connecting → Connected`. Losing
/// the channel drops back to `Ready` while the identity is still held;
/// [`disconnect`](crate::SessionCoordinator::disconnect) returns to
/// `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Disconnected,
    /// Registering an identity with the signaling layer.
    Initializing,
    /// Identity held, no channel.
    Ready,
    Connecting,
    Connected,
}

impl SessionPhase {
    /// Channel connection state as seen by the rest of the system.
    pub fn connection_state(self) -> ConnectionState {
        match self {
            SessionPhase::Disconnected | SessionPhase::Initializing | SessionPhase::Ready => {
                ConnectionState::Disconnected
            }
            SessionPhase::Connecting => ConnectionState::Connecting,
            SessionPhase::Connected => ConnectionState::Connected,
        }
    }
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub phase: SessionPhase,
    pub self_id: Option<String>,
    /// Claimed code when hosting, the dialed code when joined as guest.
    pub room_code: Option<String>,
    pub role: Option<Role>,
    pub peer_id: Option<String>,
    pub quality: ConnectionQuality,
}

impl SessionInfo {
    pub fn connection_state(&self) -> ConnectionState {
        self.phase.connection_state()
    }
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            self_id: None,
            room_code: None,
            role: None,
            peer_id: None,
            quality: ConnectionQuality::Disconnected,
        }
    }
}

/// Events emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged {
        phase: SessionPhase,
        state: ConnectionState,
    },
    QualityChanged(ConnectionQuality),
    IdentityAssigned { id: String, role: Role },
    PeerConnected(String),
    PeerDisconnected(String),
    /// A signaling reconnect attempt is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
}

/// Configuration for automatic signaling reconnection with exponential
/// backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second attempt; the first runs immediately.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Attempts before giving up. 0 retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Delay before attempt number `attempt` (1-based).
    ///
    /// The first attempt is immediate. Later ones back off exponentially
    /// from `initial_delay`, capped at `max_delay`, with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.jittered_delay(attempt, rand::thread_rng().gen_range(-1.0..=1.0))
    }

    /// `offset` in `[-1.0, 1.0]` scales the ±25% jitter band.
    fn jittered_delay(&self, attempt: u32, offset: f64) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(2).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25 * offset.clamp(-1.0, 1.0);
        Duration::from_secs_f64((capped + jitter).max(0.05))
    }

    /// Returns `true` once `attempt` exceeds the configured limit.
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt > self.max_attempts
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long `connect` waits for the channel to open.
    pub connection_timeout: Duration,
    /// Pause between re-acquiring a guest identity and dialing the stored
    /// room on resume.
    pub restore_settle_delay: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: CONNECTION_TIMEOUT,
            restore_settle_delay: RESTORE_SETTLE_DELAY,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_maps_to_connection_state() {
        assert_eq!(
            SessionPhase::Ready.connection_state(),
            ConnectionState::Disconnected
        );
        assert_eq!(
            SessionPhase::Initializing.connection_state(),
            ConnectionState::Disconnected
        );
        assert_eq!(
            SessionPhase::Connecting.connection_state(),
            ConnectionState::Connecting
        );
        assert_eq!(
            SessionPhase::Connected.connection_state(),
            ConnectionState::Connected
        );
    }

    #[test]
    fn first_reconnect_attempt_is_immediate() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn reconnect_delay_backoff() {
        let config = ReconnectConfig::default();
        // Base delays from attempt 2: 250ms, 500ms, 1s, 2s, 4s, 8s, 15s (capped).
        let expected_base = [0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 15.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let attempt = (i + 2) as u32;
            let secs = config.delay_for_attempt(attempt).as_secs_f64();
            let lo = base * 0.74;
            let hi = base * 1.26;
            assert!(
                secs >= lo && secs <= hi,
                "attempt {attempt}: {secs:.3}s not in [{lo:.3}, {hi:.3}]"
            );
        }
    }

    #[test]
    fn jitter_band_is_symmetric() {
        let config = ReconnectConfig::default();
        assert_eq!(config.jittered_delay(4, -1.0), Duration::from_millis(750));
        assert_eq!(config.jittered_delay(4, 0.0), Duration::from_secs(1));
        assert_eq!(config.jittered_delay(4, 1.0), Duration::from_millis(1250));
        assert_eq!(config.jittered_delay(4, 3.0), Duration::from_millis(1250));
    }

    #[test]
    fn jitter_lands_on_both_sides_of_base() {
        let config = ReconnectConfig::default();
        let base = Duration::from_secs(1);
        let samples: Vec<Duration> = (0..2_000).map(|_| config.delay_for_attempt(4)).collect();
        assert!(samples.iter().any(|d| *d > base), "jitter never positive");
        assert!(samples.iter().any(|d| *d < base), "jitter never negative");
        assert!(
            samples
                .iter()
                .all(|d| *d >= Duration::from_millis(750) && *d <= Duration::from_millis(1250))
        );
    }

    #[test]
    fn attempt_limit() {
        let config = ReconnectConfig {
            max_attempts: 3,
            ..ReconnectConfig::default()
        };
        assert!(!config.exhausted(3));
        assert!(config.exhausted(4));

        let forever = ReconnectConfig {
            max_attempts: 0,
            ..ReconnectConfig::default()
        };
        assert!(!forever.exhausted(u32::MAX));
    }

    #[test]
    fn session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(20));
        assert_eq!(config.restore_settle_delay, Duration::from_secs(1));
    }
}
