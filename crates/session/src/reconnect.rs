//! Signaling reconnection with exponential backoff.
//!
//! Only the signaling connection is retried. A closed channel is final and
//! the user must connect again.

use std::sync::{Arc, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::Shared;
use crate::signaling::Signaling;

/// Cancels the active reconnect loop, if any.
pub(crate) fn cancel<S>(shared: &Shared<S>) {
    let token = shared
        .reconnect_cancel
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(token) = token {
        token.cancel();
    }
}

/// Starts a reconnect loop, replacing any loop already running.
pub(crate) fn start<S: Signaling>(shared: &Arc<Shared<S>>) {
    let token = CancellationToken::new();
    let previous = shared
        .reconnect_cancel
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(token.clone());
    if let Some(previous) = previous {
        previous.cancel();
    }
    tokio::spawn(reconnect_loop(Arc::clone(shared), token));
}

async fn reconnect_loop<S: Signaling>(shared: Arc<Shared<S>>, cancel: CancellationToken) {
    let config = shared.config.reconnect.clone();
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        if config.exhausted(attempt) {
            warn!(attempts = attempt - 1, "signaling reconnect failed, giving up");
            shared.teardown().await;
            return;
        }

        let delay = config.delay_for_attempt(attempt);
        let delay_secs = delay.as_secs_f64();
        shared.emit_reconnecting(attempt, delay);
        info!(
            attempt,
            delay_secs = format_args!("{delay_secs:.1}"),
            "reconnecting signaling"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("reconnect cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match shared.signaling.reconnect().await {
            Ok(()) => {
                info!(attempt, "signaling reconnected");
                return;
            }
            Err(e) => warn!(attempt, error = %e, "signaling reconnect attempt failed"),
        }
    }
}
