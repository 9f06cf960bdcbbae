//! Application configuration.
//!
//! Reads JSON at `~/.config/beamdrop/config.json`. Every field is optional;
//! a file that fails to parse is replaced by defaults and reported.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use beamdrop_protocol::constants::{
    BACKPRESSURE_POLL_INTERVAL, CHUNK_SIZE, CONNECTION_TIMEOUT, MAX_BUFFERED_AMOUNT,
    RESTORE_SETTLE_DELAY, YIELD_EVERY_CHUNKS,
};
use beamdrop_session::{IceServer, ReconnectConfig, SessionConfig};
use beamdrop_snapshot::{config_dir, default_state_dir};
use beamdrop_transfer::{EngineConfig, SenderConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub room_code: String,
    pub storage_root: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub chunk_size: usize,
    pub max_buffered_amount: usize,
    pub poll_interval_ms: u64,
    pub yield_every: usize,
    pub connection_timeout_ms: u64,
    pub restore_settle_delay_ms: u64,
    pub autosave_debounce_ms: u64,
    pub reconnect: ReconnectSettings,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ice_servers: Vec<IceServer>,
    pub log_filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let defaults = ReconnectConfig::default();
        Self {
            initial_delay_ms: defaults.initial_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
            max_attempts: defaults.max_attempts,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            room_code: "BEAMDROP".into(),
            storage_root: None,
            state_dir: None,
            chunk_size: CHUNK_SIZE,
            max_buffered_amount: MAX_BUFFERED_AMOUNT,
            poll_interval_ms: BACKPRESSURE_POLL_INTERVAL.as_millis() as u64,
            yield_every: YIELD_EVERY_CHUNKS,
            connection_timeout_ms: CONNECTION_TIMEOUT.as_millis() as u64,
            restore_settle_delay_ms: RESTORE_SETTLE_DELAY.as_millis() as u64,
            autosave_debounce_ms: 250,
            reconnect: ReconnectSettings::default(),
            ice_servers: Vec::new(),
            log_filter: "info,beamdrop=debug".into(),
        }
    }
}

impl AppConfig {
    /// Loads `path`, or the default location when `None`.
    ///
    /// A missing file yields defaults. A file that fails to parse also
    /// yields defaults, together with a [`ParseFallback`] the caller logs
    /// once tracing is up.
    pub fn load(path: Option<&Path>) -> anyhow::Result<(Self, Option<ParseFallback>)> {
        let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
            return Ok((Self::default(), None));
        };
        if !path.exists() {
            return Ok((Self::default(), None));
        }

        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(config) => Ok((config, None)),
            Err(error) => Ok((Self::default(), Some(ParseFallback { path, error }))),
        }
    }

    /// Directory the guest snapshot lives in, falling back to the
    /// platform state directory.
    pub fn state_dir(&self) -> Option<PathBuf> {
        self.state_dir.clone().or_else(default_state_dir)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            storage_root: self.storage_root.clone(),
            sender: SenderConfig {
                chunk_size: self.chunk_size.max(1),
                max_buffered_amount: self.max_buffered_amount,
                poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
                yield_every: self.yield_every,
            },
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            restore_settle_delay: Duration::from_millis(self.restore_settle_delay_ms),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                backoff_factor: self.reconnect.backoff_factor,
                max_attempts: self.reconnect.max_attempts,
            },
        }
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }
}

/// A config file that was present but unparseable.
#[derive(Debug)]
pub struct ParseFallback {
    pub path: PathBuf,
    pub error: serde_json::Error,
}

impl ParseFallback {
    pub fn log(&self) {
        tracing::warn!(
            path = %self.path.display(),
            error = %self.error,
            "failed to parse config, using defaults"
        );
    }
}

fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("beamdrop").join("config.json"))
}
