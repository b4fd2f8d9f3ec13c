//! Out-of-order file reassembly.
//!
//! Chunks are keyed by `(file name, sender)` and may arrive in any order.
//! A set completes exactly once, when every slot is filled; later duplicates
//! are absorbed without re-announcing the file.

use std::collections::{BTreeMap, HashMap};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use tracing::{debug, info};

use crate::error::ReassemblyError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub file_name: String,
    pub sender: String,
}

#[derive(Debug, Clone)]
pub struct ChunkSet {
    /// Only arrived chunks are stored; `total` comes off the wire.
    slots: BTreeMap<u32, String>,
    total: u32,
    received: u32,
    completed: bool,
}

impl ChunkSet {
    fn new(total: u32) -> Self {
        Self {
            slots: BTreeMap::new(),
            total,
            received: 0,
            completed: false,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn has_chunk(&self, index: u32) -> bool {
        self.slots.contains_key(&index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProgress {
    Pending { received: u32, total: u32 },
    /// This chunk filled the last empty slot.
    Completed,
    /// The slot was already filled; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub file_name: String,
    pub sender: String,
    pub total_chunks: u32,
}

#[derive(Debug, Default)]
pub struct ChunkReassembler {
    sets: HashMap<ChunkKey, ChunkSet>,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_chunk(
        &mut self,
        file_name: &str,
        sender: &str,
        index: u32,
        total: u32,
        payload: &str,
    ) -> Result<ChunkProgress, ReassemblyError> {
        if total == 0 {
            return Err(ReassemblyError::EmptyChunkSet {
                file_name: file_name.to_string(),
            });
        }
        if index >= total {
            return Err(ReassemblyError::IndexOutOfRange {
                file_name: file_name.to_string(),
                index,
                total,
            });
        }

        let key = ChunkKey {
            file_name: file_name.to_string(),
            sender: sender.to_string(),
        };
        let set = self.sets.entry(key).or_insert_with(|| ChunkSet::new(total));
        if set.total != total {
            return Err(ReassemblyError::TotalMismatch {
                file_name: file_name.to_string(),
                expected: set.total,
                got: total,
            });
        }

        if set.has_chunk(index) {
            debug!(
                "Duplicate chunk {}/{} of {} from {}",
                index, total, file_name, sender
            );
            return Ok(ChunkProgress::Duplicate);
        }
        set.slots.insert(index, payload.to_string());
        set.received = set.slots.len() as u32;

        if set.received == set.total && !set.completed {
            set.completed = true;
            info!("File {} from {} complete ({} chunks)", file_name, sender, total);
            return Ok(ChunkProgress::Completed);
        }
        Ok(ChunkProgress::Pending {
            received: set.received,
            total: set.total,
        })
    }

    pub fn get(&self, file_name: &str, sender: &str) -> Option<&ChunkSet> {
        self.sets.get(&ChunkKey {
            file_name: file_name.to_string(),
            sender: sender.to_string(),
        })
    }

    pub fn completed_files(&self) -> impl Iterator<Item = &ChunkKey> {
        self.sets
            .iter()
            .filter(|(_, set)| set.completed)
            .map(|(key, _)| key)
    }

    /// Decode and concatenate every chunk of a completed file, in index order.
    pub fn assemble(&self, file_name: &str, sender: &str) -> Result<Bytes, ReassemblyError> {
        let set = self
            .get(file_name, sender)
            .ok_or_else(|| ReassemblyError::UnknownFile {
                file_name: file_name.to_string(),
                sender: sender.to_string(),
            })?;
        if !set.completed {
            return Err(ReassemblyError::IncompleteFile {
                file_name: file_name.to_string(),
                sender: sender.to_string(),
                received: set.received,
                total: set.total,
            });
        }

        let mut out = BytesMut::new();
        for (&index, encoded) in &set.slots {
            let decoded = STANDARD
                .decode(encoded)
                .map_err(|source| ReassemblyError::Decode {
                    file_name: file_name.to_string(),
                    index: index as usize,
                    source,
                })?;
            out.extend_from_slice(&decoded);
        }
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    #[test]
    fn out_of_order_chunks_complete_once() {
        let mut r = ChunkReassembler::new();
        assert_eq!(
            r.on_chunk("a.txt", "bob", 2, 3, &b64("!")).unwrap(),
            ChunkProgress::Pending {
                received: 1,
                total: 3
            }
        );
        assert!(matches!(
            r.on_chunk("a.txt", "bob", 0, 3, &b64("hel")).unwrap(),
            ChunkProgress::Pending { received: 2, .. }
        ));
        assert_eq!(
            r.on_chunk("a.txt", "bob", 1, 3, &b64("lo")).unwrap(),
            ChunkProgress::Completed
        );
        assert!(r.get("a.txt", "bob").unwrap().is_completed());
        assert_eq!(&r.assemble("a.txt", "bob").unwrap()[..], b"hello!");
    }

    #[test]
    fn duplicate_after_completion_does_not_refire() {
        let mut r = ChunkReassembler::new();
        r.on_chunk("a.txt", "bob", 0, 1, &b64("x")).unwrap();
        assert_eq!(
            r.on_chunk("a.txt", "bob", 0, 1, &b64("y")).unwrap(),
            ChunkProgress::Duplicate
        );
        // The first write wins.
        assert_eq!(&r.assemble("a.txt", "bob").unwrap()[..], b"x");
    }

    #[test]
    fn duplicate_before_completion_keeps_count() {
        let mut r = ChunkReassembler::new();
        r.on_chunk("a.txt", "bob", 1, 2, &b64("b")).unwrap();
        r.on_chunk("a.txt", "bob", 1, 2, &b64("b")).unwrap();
        let set = r.get("a.txt", "bob").unwrap();
        assert_eq!(set.received(), 1);
        assert!(!set.is_completed());
    }

    #[test]
    fn assemble_before_completion_is_incomplete() {
        let mut r = ChunkReassembler::new();
        r.on_chunk("a.txt", "bob", 0, 2, &b64("a")).unwrap();
        assert_eq!(
            r.assemble("a.txt", "bob").unwrap_err(),
            ReassemblyError::IncompleteFile {
                file_name: "a.txt".into(),
                sender: "bob".into(),
                received: 1,
                total: 2,
            }
        );
        assert!(matches!(
            r.assemble("b.txt", "bob"),
            Err(ReassemblyError::UnknownFile { .. })
        ));
    }

    #[test]
    fn same_name_from_different_senders_is_separate() {
        let mut r = ChunkReassembler::new();
        r.on_chunk("a.txt", "bob", 0, 1, &b64("bob")).unwrap();
        r.on_chunk("a.txt", "carol", 0, 2, &b64("car")).unwrap();
        assert!(r.get("a.txt", "bob").unwrap().is_completed());
        assert!(!r.get("a.txt", "carol").unwrap().is_completed());
        assert_eq!(r.completed_files().count(), 1);
    }

    #[test]
    fn malformed_chunks_are_rejected() {
        let mut r = ChunkReassembler::new();
        assert!(matches!(
            r.on_chunk("a.txt", "bob", 3, 3, "x"),
            Err(ReassemblyError::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            r.on_chunk("a.txt", "bob", 0, 0, "x"),
            Err(ReassemblyError::EmptyChunkSet { .. })
        ));
        r.on_chunk("a.txt", "bob", 0, 3, "x").unwrap();
        assert!(matches!(
            r.on_chunk("a.txt", "bob", 1, 4, "x"),
            Err(ReassemblyError::TotalMismatch {
                expected: 3,
                got: 4,
                ..
            })
        ));
    }

    #[test]
    fn huge_announced_total_is_stored_sparsely() {
        let mut r = ChunkReassembler::new();
        assert_eq!(
            r.on_chunk("big.bin", "mallory", 0, u32::MAX, "AA==").unwrap(),
            ChunkProgress::Pending {
                received: 1,
                total: u32::MAX
            }
        );
        let set = r.get("big.bin", "mallory").unwrap();
        assert!(set.has_chunk(0));
        assert!(!set.has_chunk(u32::MAX - 1));
        assert!(matches!(
            r.assemble("big.bin", "mallory"),
            Err(ReassemblyError::IncompleteFile { received: 1, .. })
        ));
    }

    #[test]
    fn placeholder_text_fails_to_decode() {
        let mut r = ChunkReassembler::new();
        r.on_chunk("a.txt", "bob", 0, 1, "File chunk: a.txt").unwrap();
        assert!(matches!(
            r.assemble("a.txt", "bob"),
            Err(ReassemblyError::Decode { index: 0, .. })
        ));
    }
}
