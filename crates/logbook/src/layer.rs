//! `tracing` integration.

use std::fmt::Write as _;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

use crate::entry::Logbook;

/// A tracing layer that mirrors events into a [`Logbook`].
///
/// The `message` field becomes the entry message; every other field is
/// rendered as `key=value` pairs into the entry detail.
pub struct LogbookLayer {
    book: Logbook,
    min_level: Level,
}

impl LogbookLayer {
    /// Captures events at `min_level` or more severe.
    pub fn new(book: Logbook, min_level: Level) -> Self {
        Self { book, min_level }
    }
}

#[derive(Default)]
struct EntryVisitor {
    message: String,
    detail: String,
}

impl EntryVisitor {
    fn push_field(&mut self, name: &str, value: std::fmt::Arguments<'_>) {
        if !self.detail.is_empty() {
            self.detail.push_str(", ");
        }
        let _ = write!(self.detail, "{name}={value}");
    }
}

impl Visit for EntryVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for LogbookLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // tracing orders levels by verbosity: ERROR < WARN < INFO.
        if *meta.level() > self.min_level {
            return;
        }

        let mut visitor = EntryVisitor::default();
        event.record(&mut visitor);

        let message = if visitor.message.is_empty() {
            meta.target().to_string()
        } else {
            visitor.message
        };
        let detail = (!visitor.detail.is_empty()).then_some(visitor.detail);

        self.book.record((*meta.level()).into(), message, detail);
    }
}

/// Installs the global subscriber: formatted stderr output filtered by
/// `RUST_LOG` (or `default_filter`), plus a [`LogbookLayer`] at `info`.
pub fn init_tracing(book: Logbook, default_filter: &str) -> Result<(), TryInitError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(LogbookLayer::new(book, Level::INFO))
        .try_init()
}
