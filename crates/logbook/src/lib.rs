//! Diagnostic log stream.
//!
//! Keeps the most recent [`MAX_LOGS`](beamdrop_protocol::constants::MAX_LOGS)
//! log entries in memory so they can be shown to the user and persisted in
//! the session snapshot. Entries are normally produced by [`LogbookLayer`],
//! which mirrors `tracing` events into the book.

pub mod entry;
pub mod layer;

pub use entry::{LogEntry, LogLevel, Logbook};
pub use layer::{LogbookLayer, init_tracing};
