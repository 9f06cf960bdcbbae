/// Errors reported by a [`DataChannel`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound half of an established point-to-point channel.
///
/// `send` enqueues a whole message onto the transport's send queue and
/// returns without waiting for delivery; `buffered_amount` reports how many
/// bytes are still queued. The sender uses the two together for
/// backpressure.
pub trait DataChannel: Send + Sync {
    fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Bytes accepted by `send` but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    /// Closes the channel. Closing an already closed channel does nothing.
    fn close(&self);
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::{ChannelError, DataChannel};

    /// Records every payload; the buffered amount is set by the test.
    #[derive(Default)]
    pub(crate) struct MockChannel {
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub buffered: AtomicUsize,
        pub closed: AtomicBool,
    }

    impl MockChannel {
        pub fn set_buffered(&self, amount: usize) {
            self.buffered.store(amount, Ordering::SeqCst);
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub fn take_sent(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl DataChannel for MockChannel {
        fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }

        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
