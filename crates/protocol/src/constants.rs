use std::time::Duration;

/// Payload size of a single `chunk` message (64 KiB).
///
/// Every chunk except the last of a file carries exactly this many bytes.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Backpressure ceiling for the channel's send queue (1 MiB).
///
/// The sender stops enqueuing chunks while the channel reports more than
/// this many buffered bytes.
pub const MAX_BUFFERED_AMOUNT: usize = 1024 * 1024;

/// How long the sender waits before re-checking a saturated channel.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Number of chunks sent between cooperative yields to the scheduler.
pub const YIELD_EVERY_CHUNKS: usize = 10;

/// Time allowed for an outbound channel to open.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(20);

/// Capacity of the diagnostic log ring buffer.
pub const MAX_LOGS: usize = 200;

/// Delay between re-acquiring a guest identity and reconnecting to the
/// stored room on restore.
pub const RESTORE_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Number of chunks needed to carry `size` bytes.
///
/// A zero-byte file has zero chunks. A `chunk_size` of 0 falls back to
/// [`CHUNK_SIZE`].
pub fn total_chunks(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(effective_chunk_size(chunk_size))
}

/// Byte offset of chunk `index` within its file, or `None` if it does not
/// fit in a `u64`.
pub fn chunk_offset(index: u64, chunk_size: usize) -> Option<u64> {
    index.checked_mul(effective_chunk_size(chunk_size))
}

fn effective_chunk_size(chunk_size: usize) -> u64 {
    if chunk_size == 0 {
        CHUNK_SIZE as u64
    } else {
        chunk_size as u64
    }
}
