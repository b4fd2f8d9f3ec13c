//! Sliding-window sender with per-segment retransmission timers.
//!
//! ```text
//!   base                next          base + capacity
//!    │                   │                  │
//! ───┼───────────────────┼──────────────────┼──▶ seq space
//!    │ <── in flight ──▶ │ <── sendable ──▶ │
//! ```
//!
//! Acknowledgments are cumulative: `ack = k` releases every buffered seq
//! `<= k`. A segment that times out `max_retries` times is dropped and
//! reported once; by default `base` stays put, so the window stalls behind it.

use std::collections::{BTreeMap, HashMap};

use rchat_abstract::{
    ArqConfig, FailurePolicy, Payload, Segment, SegmentKind, SendRequest, SessionContext,
    TimerHandle, TimerService, TimerToken, Transport, UploadChunkRequest,
};
use tracing::{debug, trace, warn};

use crate::error::SessionError;
use crate::sequence::SequenceAllocator;

/// A segment that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFailure {
    pub seq: u64,
    pub retries: u32,
    pub segment: Segment,
}

#[derive(Debug)]
pub struct SendWindow {
    sender: String,
    base: u64,
    next: u64,
    capacity: usize,
    timeout_ms: u64,
    max_retries: u32,
    policy: FailurePolicy,
    allocator: SequenceAllocator,
    buffer: BTreeMap<u64, Segment>,
    active_timers: HashMap<u64, TimerHandle>,
}

impl SendWindow {
    pub fn new(sender: impl Into<String>, config: &ArqConfig) -> Self {
        Self {
            sender: sender.into(),
            base: 0,
            next: 0,
            capacity: config.window_size,
            timeout_ms: config.retransmit_timeout_ms,
            max_retries: config.max_retries,
            policy: config.failure_policy,
            allocator: SequenceAllocator::new(),
            buffer: BTreeMap::new(),
            active_timers: HashMap::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn next(&self) -> u64 {
        self.next
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `next - base`: slots taken, including those of permanently failed seqs.
    pub fn in_flight(&self) -> u64 {
        self.next - self.base
    }

    pub fn is_full(&self) -> bool {
        self.in_flight() >= self.capacity as u64
    }

    /// Segments still awaiting acknowledgment.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn segment(&self, seq: u64) -> Option<&Segment> {
        self.buffer.get(&seq)
    }

    pub fn has_timer(&self, seq: u64) -> bool {
        self.active_timers.contains_key(&seq)
    }

    pub fn active_timers(&self) -> usize {
        self.active_timers.len()
    }

    /// Buffer and transmit a new segment, arming its retransmission timer.
    ///
    /// Fails with [`SessionError::WindowFull`] without allocating a seq when
    /// `capacity` segments are already outstanding.
    pub fn try_send<C>(&mut self, ctx: &mut C, to: &str, payload: Payload) -> Result<u64, SessionError>
    where
        C: SessionContext + ?Sized,
    {
        if self.is_full() {
            return Err(SessionError::WindowFull {
                in_flight: self.in_flight(),
                capacity: self.capacity,
            });
        }

        let seq = self.allocator.allocate();
        let segment = Segment {
            seq,
            to: to.to_string(),
            payload,
            created_at: ctx.now(),
            retry_count: 0,
        };
        debug!(
            "Sending seq {} to {} ({:?}, {} bytes)",
            seq,
            to,
            segment.payload.kind(),
            segment.payload.len()
        );
        self.transmit(ctx, &segment);
        self.buffer.insert(seq, segment);
        self.next = seq + 1;
        self.arm(ctx, seq);
        Ok(seq)
    }

    /// Apply a cumulative acknowledgment. Returns how many segments it released.
    ///
    /// Values below `base - 1` are stale and ignored, so re-applying an ack is
    /// a no-op. Values past `next - 1` are clamped.
    pub fn on_ack<C>(&mut self, timers: &mut C, ack: i64) -> usize
    where
        C: TimerService + ?Sized,
    {
        let floor = self.base as i64 - 1;
        if ack <= floor {
            trace!("Ignoring stale ack {} (base {})", ack, self.base);
            return 0;
        }

        let ceiling = self.next as i64 - 1;
        let ack = if ack > ceiling {
            warn!(
                "Ack {} is beyond the last sent seq {}, clamping",
                ack, ceiling
            );
            ceiling
        } else {
            ack
        };
        if ack <= floor {
            return 0;
        }

        let through = ack as u64;
        let released: Vec<u64> = self
            .buffer
            .range(self.base..=through)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &released {
            self.buffer.remove(seq);
            if let Some(handle) = self.active_timers.remove(seq) {
                timers.cancel(handle);
            }
        }
        self.base = through + 1;
        if self.policy == FailurePolicy::Advance {
            self.skip_failed_head();
        }
        debug!(
            "Ack {} released {} segment(s), base now {}",
            through,
            released.len(),
            self.base
        );
        released.len()
    }

    /// Handle the retransmission deadline of `seq`.
    pub fn on_timeout<C>(&mut self, ctx: &mut C, seq: u64) -> Option<SendFailure>
    where
        C: SessionContext + ?Sized,
    {
        // The ack may have been processed just before this timer fired.
        let Some(segment) = self.buffer.get_mut(&seq) else {
            debug!("Timer for seq {} fired after it was released", seq);
            return None;
        };

        if segment.retry_count >= self.max_retries {
            let retries = segment.retry_count;
            let segment = self.buffer.remove(&seq)?;
            if let Some(handle) = self.active_timers.remove(&seq) {
                ctx.cancel(handle);
            }
            warn!("Seq {} failed after {} retries", seq, retries);
            if self.policy == FailurePolicy::Advance {
                self.skip_failed_head();
            }
            return Some(SendFailure {
                seq,
                retries,
                segment,
            });
        }

        segment.retry_count += 1;
        let segment = segment.clone();
        debug!(
            "Timeout, retransmitting seq {} (retry {}/{})",
            seq, segment.retry_count, self.max_retries
        );
        self.transmit(ctx, &segment);
        self.arm(ctx, seq);
        None
    }

    /// Cancel every retransmission timer. Buffered segments are kept.
    pub fn cancel_all<C>(&mut self, timers: &mut C) -> usize
    where
        C: TimerService + ?Sized,
    {
        let count = self.active_timers.len();
        for (_, handle) in self.active_timers.drain() {
            timers.cancel(handle);
        }
        count
    }

    fn arm<C>(&mut self, timers: &mut C, seq: u64)
    where
        C: TimerService + ?Sized,
    {
        if let Some(previous) = self.active_timers.remove(&seq) {
            timers.cancel(previous);
        }
        let handle = timers.schedule(self.timeout_ms, TimerToken::Retransmit(seq));
        self.active_timers.insert(seq, handle);
    }

    fn transmit<C>(&self, ctx: &mut C, segment: &Segment)
    where
        C: Transport + ?Sized,
    {
        match &segment.payload {
            Payload::Text(text) => ctx.send(SendRequest {
                sender: self.sender.clone(),
                receiver: segment.to.clone(),
                seq: segment.seq,
                message: text.clone(),
                kind: SegmentKind::Text,
                file_name: None,
                chunk_index: None,
                total_chunks: None,
            }),
            Payload::FileChunk(chunk) => ctx.upload_chunk(UploadChunkRequest {
                sender: self.sender.clone(),
                receiver: segment.to.clone(),
                file_name: chunk.file_name.clone(),
                chunk_index: chunk.index,
                total_chunks: chunk.total,
                chunk_data: chunk.data.clone(),
                seq: segment.seq,
            }),
        }
    }

    fn skip_failed_head(&mut self) {
        while self.base < self.next && !self.buffer.contains_key(&self.base) {
            self.base += 1;
        }
    }
}
