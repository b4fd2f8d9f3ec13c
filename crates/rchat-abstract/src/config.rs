use serde::{Deserialize, Serialize};

/// Fixed file chunk boundary used by uploads.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// What the send window does with the slot of a segment that exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Leave `base` where it is. The window stalls behind the failed seq.
    #[default]
    Stall,
    /// Slide `base` past failed seqs once nothing older is outstanding.
    Advance,
}

/// Tunables of the sliding-window sender and the poll cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArqConfig {
    pub window_size: usize,
    pub retransmit_timeout_ms: u64,
    pub max_retries: u32,
    pub poll_interval_ms: u64,
    pub chunk_size: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            retransmit_timeout_ms: 3000,
            max_retries: 3,
            poll_interval_ms: 2000,
            chunk_size: DEFAULT_CHUNK_SIZE,
            failure_policy: FailurePolicy::Stall,
        }
    }
}

/// Channel behaviour of the simulated relay link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Probability that a request is swallowed by the relay (answered without an ack).
    pub loss_rate: f64,
    /// Probability that a request fails outright with a transport error.
    pub error_rate: f64,
    pub min_latency: u64,
    pub max_latency: u64,
    pub seed: u64,
    /// Undelivered messages a receiver's mailbox holds before the relay rejects new ones.
    pub receive_window: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            error_rate: 0.0,
            min_latency: 10,
            max_latency: 100,
            seed: 0,
            receive_window: 64,
        }
    }
}
