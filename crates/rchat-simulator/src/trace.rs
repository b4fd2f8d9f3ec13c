use rchat_core::{ArqConfig, InboundSegment, LinkConfig, Payload, SegmentKind, WindowStatus};
use serde::Serialize;

use crate::engine::{ClientStats, LinkEventSummary};
use crate::relay::RelayStats;

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub arq: ArqConfig,
    pub link: LinkConfig,
    pub duration_ms: u64,
    pub clients: Vec<ClientReport>,
    pub relay: RelayStats,
    pub link_events: Vec<LinkEventSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientReport {
    pub user: String,
    pub connected: bool,
    pub status: WindowStatus,
    pub stats: ClientStats,
    pub received: Vec<ReceivedMessage>,
    pub files_ready: Vec<String>,
    pub failed_seqs: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceivedMessage {
    pub sender: String,
    pub seq: u64,
    pub kind: SegmentKind,
    /// Message text, or `file#index` for chunks.
    pub summary: String,
}

impl ReceivedMessage {
    pub fn from_segment(segment: &InboundSegment) -> Self {
        let summary = match &segment.payload {
            Payload::Text(text) => text.clone(),
            Payload::FileChunk(chunk) => format!("{}#{}", chunk.file_name, chunk.index),
        };
        Self {
            sender: segment.sender.clone(),
            seq: segment.seq,
            kind: segment.payload.kind(),
            summary,
        }
    }
}
