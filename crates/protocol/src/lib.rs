pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::{chunk_offset, total_chunks};
pub use messages::{FileMetadata, TransferMessage};
pub use types::{
    ConnectionQuality, ConnectionState, Direction, Role, StorageMode, TransferStatus,
};
