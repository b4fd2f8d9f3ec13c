//! In-process relay server.
//!
//! Mirrors the behaviour of the HTTP relay the live client talks to: each
//! sender's segments are accepted strictly in order and answered with a
//! cumulative ack, accepted segments wait in the receiver's mailbox until a
//! poll reports them delivered, and file chunks are additionally kept in a
//! per-file store for later download.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use rchat_core::{
    DownloadRequest, DownloadResponse, PollRequest, PollResponse, SegmentKind, SendRequest,
    SendResponse, UploadChunkRequest, UploadChunkResponse, WireMessage,
};
use serde::Serialize;
use tracing::debug;

/// Outcome of offering one segment to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Accepted,
    Duplicate,
    OutOfOrder,
    /// The receiver's mailbox is at capacity.
    MailboxFull,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    pub accepted: u32,
    pub duplicates: u32,
    pub out_of_order: u32,
    pub mailbox_full: u32,
    pub polls: u32,
    pub delivered: u32,
    pub chunks_stored: u32,
}

pub struct Relay {
    receive_window: usize,
    /// Next seq expected from each sender.
    expected: HashMap<String, u64>,
    mailboxes: HashMap<String, VecDeque<WireMessage>>,
    /// (file name, receiver) -> chunk index -> base64 data.
    files: HashMap<(String, String), BTreeMap<u32, String>>,
    users: BTreeSet<String>,
    pub stats: RelayStats,
}

impl Relay {
    pub fn new(receive_window: usize) -> Self {
        Self {
            receive_window,
            expected: HashMap::new(),
            mailboxes: HashMap::new(),
            files: HashMap::new(),
            users: BTreeSet::new(),
            stats: RelayStats::default(),
        }
    }

    pub fn register(&mut self, user: &str) {
        self.users.insert(user.to_string());
    }

    pub fn users(&self) -> Vec<String> {
        self.users.iter().cloned().collect()
    }

    /// Highest seq accepted from `sender`, or -1.
    pub fn cumulative_ack(&self, sender: &str) -> i64 {
        self.expected.get(sender).copied().unwrap_or(0) as i64 - 1
    }

    /// Undelivered messages waiting for `user`.
    pub fn mailbox_len(&self, user: &str) -> usize {
        self.mailboxes.get(user).map_or(0, VecDeque::len)
    }

    pub fn handle_send(&mut self, request: SendRequest, now: u64) -> SendResponse {
        self.register(&request.sender);
        let message = WireMessage {
            sender: request.sender.clone(),
            seq: request.seq,
            message: request.message,
            kind: request.kind,
            timestamp: now,
            file_name: request.file_name,
            chunk_index: request.chunk_index,
            total_chunks: request.total_chunks,
        };
        let (_, ack) = self.offer(&request.receiver, message);
        SendResponse { ack: Some(ack) }
    }

    pub fn handle_upload(&mut self, request: UploadChunkRequest, now: u64) -> UploadChunkResponse {
        self.register(&request.sender);
        let message = WireMessage {
            sender: request.sender.clone(),
            seq: request.seq,
            message: request.chunk_data.clone(),
            kind: SegmentKind::FileChunk,
            timestamp: now,
            file_name: Some(request.file_name.clone()),
            chunk_index: Some(request.chunk_index),
            total_chunks: Some(request.total_chunks),
        };
        let (acceptance, ack) = self.offer(&request.receiver, message);
        let status = if acceptance == Acceptance::Accepted {
            self.files
                .entry((request.file_name, request.receiver))
                .or_default()
                .insert(request.chunk_index, request.chunk_data);
            self.stats.chunks_stored += 1;
            "chunk_received"
        } else {
            "chunk_rejected"
        };
        UploadChunkResponse {
            ack: Some(ack),
            status: Some(status.to_string()),
        }
    }

    /// Return everything above `last_ack` and forget what the poller has
    /// already seen. The ack covers the poller's own outbound segments.
    pub fn handle_poll(&mut self, request: &PollRequest) -> PollResponse {
        self.register(&request.user);
        self.stats.polls += 1;
        let ack = self.cumulative_ack(&request.user);
        let Some(mailbox) = self.mailboxes.get_mut(&request.user) else {
            return PollResponse {
                messages: Vec::new(),
                ack: Some(ack),
            };
        };

        let before = mailbox.len();
        mailbox.retain(|m| m.seq as i64 > request.last_ack);
        self.stats.delivered += (before - mailbox.len()) as u32;

        PollResponse {
            messages: mailbox.iter().cloned().collect(),
            ack: Some(ack),
        }
    }

    pub fn handle_download(&self, request: &DownloadRequest) -> DownloadResponse {
        match self
            .files
            .get(&(request.file_name.clone(), request.receiver.clone()))
        {
            Some(chunks) => DownloadResponse {
                file_name: Some(request.file_name.clone()),
                chunks: chunks.values().cloned().collect(),
            },
            None => DownloadResponse::default(),
        }
    }

    fn offer(&mut self, receiver: &str, message: WireMessage) -> (Acceptance, i64) {
        let sender = message.sender.clone();
        let seq = message.seq;
        let expected = self.expected.get(&sender).copied().unwrap_or(0);

        let acceptance = if seq < expected {
            self.stats.duplicates += 1;
            Acceptance::Duplicate
        } else if seq > expected {
            self.stats.out_of_order += 1;
            Acceptance::OutOfOrder
        } else if self.mailbox_len(receiver) >= self.receive_window {
            self.stats.mailbox_full += 1;
            Acceptance::MailboxFull
        } else {
            self.mailboxes
                .entry(receiver.to_string())
                .or_default()
                .push_back(message);
            self.expected.insert(sender.clone(), expected + 1);
            self.stats.accepted += 1;
            Acceptance::Accepted
        };

        let ack = self.cumulative_ack(&sender);
        debug!(
            "Relay {:?} seq {} from {} to {} (ack {})",
            acceptance, seq, sender, receiver, ack
        );
        (acceptance, ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(sender: &str, receiver: &str, seq: u64) -> SendRequest {
        SendRequest {
            sender: sender.into(),
            receiver: receiver.into(),
            seq,
            message: format!("m{seq}"),
            kind: SegmentKind::Text,
            file_name: None,
            chunk_index: None,
            total_chunks: None,
        }
    }

    fn poll(user: &str, last_ack: i64) -> PollRequest {
        PollRequest {
            user: user.into(),
            last_ack,
        }
    }

    #[test]
    fn accepts_in_order_and_acks_cumulatively() {
        let mut relay = Relay::new(8);
        assert_eq!(relay.handle_send(text("alice", "bob", 0), 0).ack, Some(0));
        // Gap: seq 2 before seq 1.
        assert_eq!(relay.handle_send(text("alice", "bob", 2), 0).ack, Some(0));
        assert_eq!(relay.handle_send(text("alice", "bob", 1), 0).ack, Some(1));
        // Retransmitted duplicate.
        assert_eq!(relay.handle_send(text("alice", "bob", 0), 0).ack, Some(1));

        assert_eq!(relay.stats.accepted, 2);
        assert_eq!(relay.stats.out_of_order, 1);
        assert_eq!(relay.stats.duplicates, 1);
        assert_eq!(relay.mailbox_len("bob"), 2);
    }

    #[test]
    fn sequence_spaces_are_per_sender() {
        let mut relay = Relay::new(8);
        relay.handle_send(text("alice", "carol", 0), 0);
        assert_eq!(relay.handle_send(text("bob", "carol", 0), 0).ack, Some(0));
        assert_eq!(relay.cumulative_ack("alice"), 0);
        assert_eq!(relay.cumulative_ack("dave"), -1);
    }

    #[test]
    fn poll_drains_what_the_receiver_has_seen() {
        let mut relay = Relay::new(8);
        for seq in 0..3 {
            relay.handle_send(text("alice", "bob", seq), 0);
        }
        let first = relay.handle_poll(&poll("bob", -1));
        assert_eq!(first.messages.len(), 3);
        assert_eq!(first.ack, Some(-1));

        let second = relay.handle_poll(&poll("bob", 1));
        assert_eq!(second.messages.len(), 1);
        assert_eq!(second.messages[0].seq, 2);
        assert_eq!(relay.stats.delivered, 2);

        // Alice learns her ack from her own poll.
        assert_eq!(relay.handle_poll(&poll("alice", -1)).ack, Some(2));
    }

    #[test]
    fn full_mailbox_refuses_new_segments() {
        let mut relay = Relay::new(2);
        relay.handle_send(text("alice", "bob", 0), 0);
        relay.handle_send(text("alice", "bob", 1), 0);
        assert_eq!(relay.handle_send(text("alice", "bob", 2), 0).ack, Some(1));
        assert_eq!(relay.stats.mailbox_full, 1);

        relay.handle_poll(&poll("bob", 1));
        assert_eq!(relay.handle_send(text("alice", "bob", 2), 0).ack, Some(2));
    }

    #[test]
    fn uploads_share_sequence_space_and_feed_downloads() {
        let mut relay = Relay::new(8);
        relay.handle_send(text("alice", "bob", 0), 0);
        for (index, seq) in [(0u32, 1u64), (1, 2)] {
            let response = relay.handle_upload(
                UploadChunkRequest {
                    sender: "alice".into(),
                    receiver: "bob".into(),
                    file_name: "f.bin".into(),
                    chunk_index: index,
                    total_chunks: 2,
                    chunk_data: format!("c{index}"),
                    seq,
                },
                0,
            );
            assert_eq!(response.ack, Some(seq as i64));
            assert_eq!(response.status.as_deref(), Some("chunk_received"));
        }

        let polled = relay.handle_poll(&poll("bob", 0));
        assert_eq!(polled.messages[0].kind, SegmentKind::FileChunk);
        assert_eq!(polled.messages[0].message, "c0");

        let download = relay.handle_download(&DownloadRequest {
            file_name: "f.bin".into(),
            receiver: "bob".into(),
        });
        assert_eq!(download.chunks, vec!["c0".to_string(), "c1".to_string()]);
        assert!(
            relay
                .handle_download(&DownloadRequest {
                    file_name: "f.bin".into(),
                    receiver: "carol".into(),
                })
                .chunks
                .is_empty()
        );
    }
}
