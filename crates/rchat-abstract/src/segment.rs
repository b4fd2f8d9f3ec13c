use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discriminator carried in the `type` field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    #[default]
    Text,
    FileChunk,
}

/// One indexed fragment of a file. `data` is base64 text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_name: String,
    pub index: u32,
    pub total: u32,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    FileChunk(FileChunk),
}

impl Payload {
    pub fn kind(&self) -> SegmentKind {
        match self {
            Payload::Text(_) => SegmentKind::Text,
            Payload::FileChunk(_) => SegmentKind::FileChunk,
        }
    }

    /// Size of the carried text or base64 data.
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::FileChunk(chunk) => chunk.data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An outbound unit owned by the send window until acknowledged or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u64,
    /// Receiver the segment was addressed to when first sent.
    pub to: String,
    pub payload: Payload,
    pub created_at: u64,
    pub retry_count: u32,
}

/// A segment pulled from the relay by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSegment {
    pub sender: String,
    pub seq: u64,
    pub payload: Payload,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("file chunk seq {seq} from {sender} is missing `{field}`")]
    MissingChunkField {
        sender: String,
        seq: u64,
        field: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub sender: String,
    pub receiver: String,
    pub seq: u64,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: SegmentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    pub user: String,
    pub last_ack: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<i64>,
}

/// Message shape returned by the relay's poll endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub sender: String,
    pub seq: u64,
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: SegmentKind,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
}

impl WireMessage {
    pub fn into_inbound(self) -> Result<InboundSegment, WireError> {
        let payload = match self.kind {
            SegmentKind::Text => Payload::Text(self.message),
            SegmentKind::FileChunk => {
                let missing = |field| WireError::MissingChunkField {
                    sender: self.sender.clone(),
                    seq: self.seq,
                    field,
                };
                Payload::FileChunk(FileChunk {
                    file_name: self.file_name.clone().ok_or_else(|| missing("fileName"))?,
                    index: self.chunk_index.ok_or_else(|| missing("chunkIndex"))?,
                    total: self.total_chunks.ok_or_else(|| missing("totalChunks"))?,
                    data: self.message,
                })
            }
        };
        Ok(InboundSegment {
            sender: self.sender,
            seq: self.seq,
            payload,
            timestamp: self.timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkRequest {
    pub sender: String,
    pub receiver: String,
    pub file_name: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunk_data: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChunkResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub file_name: String,
    pub receiver: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub chunks: Vec<String>,
}
