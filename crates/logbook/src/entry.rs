use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use beamdrop_protocol::constants::MAX_LOGS;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

/// A single diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Shared, bounded, append-only log.
///
/// Clones share the same underlying buffer. Once [`capacity`](Self::capacity)
/// entries are held, each new entry evicts the oldest.
#[derive(Debug, Clone)]
pub struct Logbook {
    inner: Arc<Mutex<BookInner>>,
}

#[derive(Debug)]
struct BookInner {
    /// Oldest first; never longer than `capacity`.
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_id: u64,
}

impl BookInner {
    fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

impl Default for Logbook {
    fn default() -> Self {
        Self::new(MAX_LOGS)
    }
}

impl Logbook {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(BookInner {
                entries: VecDeque::with_capacity(capacity.min(MAX_LOGS)),
                capacity,
                next_id: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BookInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an entry stamped with the current time and returns its id.
    pub fn record(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        detail: Option<String>,
    ) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.push(LogEntry {
            id,
            timestamp: Utc::now(),
            level,
            message: message.into(),
            detail,
        });
        id
    }

    /// Snapshot of the current entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Replaces the contents with previously persisted entries.
    ///
    /// Only the newest `capacity` entries are kept. New ids continue after
    /// the highest restored id.
    pub fn restore(&self, entries: Vec<LogEntry>) {
        let mut inner = self.lock();
        let max_id = entries.iter().map(|e| e.id).max().unwrap_or(0);
        inner.entries.clear();
        for entry in entries {
            inner.push(entry);
        }
        inner.next_id = inner.next_id.max(max_id + 1);
    }
}
