use serde::{Deserialize, Serialize};

/// Immutable description of a file, sent once at the start of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    #[serde(default = "default_mime")]
    pub mime: String,
    /// Creation time, Unix milliseconds.
    pub timestamp: i64,
}

fn default_mime() -> String {
    "application/octet-stream".into()
}

/// A single message on the transfer channel.
///
/// Every variant carries the `transferId` it belongs to. The channel is
/// assumed reliable and ordered, so there are no acknowledgement or
/// retransmission variants.
///
/// ```text
/// { "type": "metadata", "transferId", "metadata": {..}, "totalChunks" }
/// { "type": "chunk",    "transferId", "chunkIndex", "data": "<base64>" }
/// { "type": "complete", "transferId" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum TransferMessage {
    Metadata {
        transfer_id: String,
        metadata: FileMetadata,
        total_chunks: u64,
    },
    Chunk {
        transfer_id: String,
        chunk_index: u64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Complete {
        transfer_id: String,
    },
}

impl TransferMessage {
    /// The transfer this message belongs to.
    pub fn transfer_id(&self) -> &str {
        match self {
            TransferMessage::Metadata { transfer_id, .. }
            | TransferMessage::Chunk { transfer_id, .. }
            | TransferMessage::Complete { transfer_id } => transfer_id,
        }
    }

    /// Short variant name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferMessage::Metadata { .. } => "metadata",
            TransferMessage::Chunk { .. } => "chunk",
            TransferMessage::Complete { .. } => "complete",
        }
    }

    /// Serializes the message for the channel.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a message received from the channel.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Binary payloads travel as base64 strings inside the JSON frame.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
