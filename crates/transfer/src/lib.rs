//! Chunked file transfer over a message-oriented channel.
//!
//! The sender splits a file into [`CHUNK_SIZE`] messages and paces them
//! against the channel's buffered-amount counter. The receiver applies
//! messages through a per-transfer [`Sequencer`] and persists bytes either
//! in memory or straight to a backing file, depending on the detected
//! [`StorageCapabilities`].

mod channel;
mod chunked;
mod engine;
mod receiver;
mod sender;
mod sequencer;
mod storage;
mod types;
mod validation;

pub use beamdrop_protocol::constants::CHUNK_SIZE;
pub use channel::{ChannelError, DataChannel};
pub use chunked::{
    ChunkReader, FileSource, OutgoingFile, calculate_file_checksum, checksum_bytes,
};
pub use engine::{EngineConfig, TransferEngine};
pub use receiver::TransferReceiver;
pub use sender::{SenderConfig, TransferSender};
pub use sequencer::{Completion, Sequencer};
pub use storage::{ChunkBuffer, FileRef, FileStore, StorageCapabilities, WriteReport};
pub use types::{Transfer, TransferEvent, TransferPayload, TransferRegistry};
pub use validation::validate_storage_key;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("chunk {chunk_index} out of range for transfer {transfer_id} ({total_chunks} chunks)")]
    InvalidChunk {
        transfer_id: String,
        chunk_index: u64,
        total_chunks: u64,
    },

    #[error("transfer {transfer_id} announces {announced} chunks, expected {expected}")]
    ChunkCountMismatch {
        transfer_id: String,
        announced: u64,
        expected: u64,
    },

    #[error("payload unavailable for transfer {0}")]
    PayloadUnavailable(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("sequenced task aborted: {0}")]
    TaskAborted(String),
}
