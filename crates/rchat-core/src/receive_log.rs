use rchat_abstract::{InboundSegment, Payload};
use tracing::warn;

use crate::error::ReassemblyError;
use crate::reassembly::{ChunkProgress, ChunkReassembler, CompletedFile};

/// Outcome of one [`ReceiveLog::ingest`] call.
#[derive(Debug, Default)]
pub struct Ingested {
    pub appended: usize,
    pub completed: Vec<CompletedFile>,
    pub rejected: Vec<ReassemblyError>,
}

/// Inbound segments in arrival order plus the highest seq seen.
///
/// The high-water mark is shared by every sender; it is what the next poll
/// reports as `lastAck`.
#[derive(Debug)]
pub struct ReceiveLog {
    high_water: i64,
    history: Vec<InboundSegment>,
}

impl Default for ReceiveLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveLog {
    pub fn new() -> Self {
        Self {
            high_water: -1,
            history: Vec::new(),
        }
    }

    pub fn high_water(&self) -> i64 {
        self.high_water
    }

    pub fn history(&self) -> &[InboundSegment] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Append `segments` as delivered and forward file chunks to `reassembler`.
    pub fn ingest(
        &mut self,
        segments: Vec<InboundSegment>,
        reassembler: &mut ChunkReassembler,
    ) -> Ingested {
        let mut outcome = Ingested::default();
        for segment in segments {
            self.high_water = self.high_water.max(segment.seq as i64);
            if let Payload::FileChunk(chunk) = &segment.payload {
                match reassembler.on_chunk(
                    &chunk.file_name,
                    &segment.sender,
                    chunk.index,
                    chunk.total,
                    &chunk.data,
                ) {
                    Ok(ChunkProgress::Completed) => outcome.completed.push(CompletedFile {
                        file_name: chunk.file_name.clone(),
                        sender: segment.sender.clone(),
                        total_chunks: chunk.total,
                    }),
                    Ok(_) => {}
                    Err(err) => {
                        warn!("Dropping chunk from {}: {}", segment.sender, err);
                        outcome.rejected.push(err);
                    }
                }
            }
            self.history.push(segment);
            outcome.appended += 1;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rchat_abstract::FileChunk;

    fn text(seq: u64, body: &str) -> InboundSegment {
        InboundSegment {
            sender: "bob".into(),
            seq,
            payload: Payload::Text(body.into()),
            timestamp: 0,
        }
    }

    fn chunk(seq: u64, index: u32, total: u32) -> InboundSegment {
        InboundSegment {
            sender: "bob".into(),
            seq,
            payload: Payload::FileChunk(FileChunk {
                file_name: "a.bin".into(),
                index,
                total,
                data: "AA==".into(),
            }),
            timestamp: 0,
        }
    }

    #[test]
    fn keeps_arrival_order_and_tracks_high_water() {
        let mut log = ReceiveLog::new();
        let mut r = ChunkReassembler::new();
        assert_eq!(log.high_water(), -1);

        let out = log.ingest(vec![text(4, "d"), text(2, "b"), text(3, "c")], &mut r);
        assert_eq!(out.appended, 3);
        assert_eq!(log.high_water(), 4);
        let seqs: Vec<u64> = log.history().iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![4, 2, 3]);

        log.ingest(vec![text(1, "a")], &mut r);
        assert_eq!(log.high_water(), 4);
    }

    #[test]
    fn duplicates_are_logged_again() {
        let mut log = ReceiveLog::new();
        let mut r = ChunkReassembler::new();
        log.ingest(vec![text(0, "hi")], &mut r);
        log.ingest(vec![text(0, "hi")], &mut r);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn forwards_file_chunks() {
        let mut log = ReceiveLog::new();
        let mut r = ChunkReassembler::new();
        let out = log.ingest(vec![chunk(0, 1, 2), text(1, "x"), chunk(2, 0, 2)], &mut r);
        assert_eq!(out.completed.len(), 1);
        assert_eq!(out.completed[0].file_name, "a.bin");
        assert_eq!(out.completed[0].total_chunks, 2);
        assert!(r.get("a.bin", "bob").unwrap().is_completed());
    }

    #[test]
    fn bad_chunk_is_logged_but_rejected() {
        let mut log = ReceiveLog::new();
        let mut r = ChunkReassembler::new();
        let out = log.ingest(vec![chunk(0, 5, 2)], &mut r);
        assert_eq!(out.appended, 1);
        assert_eq!(out.rejected.len(), 1);
        assert!(r.get("a.bin", "bob").is_none());
    }
}
