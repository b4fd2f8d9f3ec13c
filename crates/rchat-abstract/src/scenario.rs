use crate::config::{ArqConfig, FailurePolicy, LinkConfig};
use serde::Deserialize;

fn default_clients() -> Vec<String> {
    vec!["alice".to_string(), "bob".to_string()]
}

fn default_duration() -> u64 {
    30_000
}

#[derive(Deserialize, Debug, Clone)]
pub struct TestScenario {
    pub name: String,
    pub description: String,
    /// Users connected to the relay at time zero.
    #[serde(default = "default_clients")]
    pub clients: Vec<String>,
    /// Simulated time after which every client disconnects.
    #[serde(default = "default_duration")]
    pub duration_ms: u64,
    #[serde(default)]
    pub config: ConfigOverride,
    #[serde(default)]
    pub actions: Vec<TestAction>,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ConfigOverride {
    pub loss_rate: Option<f64>,
    pub error_rate: Option<f64>,
    pub min_latency: Option<u64>,
    pub max_latency: Option<u64>,
    pub seed: Option<u64>,
    pub receive_window: Option<usize>,
    pub window_size: Option<usize>,
    pub retransmit_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub chunk_size: Option<usize>,
    pub failure_policy: Option<FailurePolicy>,
}

impl ConfigOverride {
    pub fn apply_to(&self, arq: &mut ArqConfig, link: &mut LinkConfig) {
        if let Some(v) = self.loss_rate {
            link.loss_rate = v;
        }
        if let Some(v) = self.error_rate {
            link.error_rate = v;
        }
        if let Some(v) = self.min_latency {
            link.min_latency = v;
        }
        if let Some(v) = self.max_latency {
            link.max_latency = v;
        }
        if let Some(v) = self.seed {
            link.seed = v;
        }
        if let Some(v) = self.receive_window {
            link.receive_window = v;
        }
        if let Some(v) = self.window_size {
            arq.window_size = v;
        }
        if let Some(v) = self.retransmit_timeout_ms {
            arq.retransmit_timeout_ms = v;
        }
        if let Some(v) = self.max_retries {
            arq.max_retries = v;
        }
        if let Some(v) = self.poll_interval_ms {
            arq.poll_interval_ms = v;
        }
        if let Some(v) = self.chunk_size {
            arq.chunk_size = v;
        }
        if let Some(v) = self.failure_policy {
            arq.failure_policy = v;
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAction {
    /// `from` sends a text message to `to` at a specific time
    SendText {
        time: u64,
        from: String,
        to: String,
        text: String,
    },
    /// `from` uploads a generated file of `size` bytes to `to`
    SendFile {
        time: u64,
        from: String,
        to: String,
        file_name: String,
        size: usize,
    },
    /// `client` fetches a file addressed to it from the relay's chunk store
    Download {
        time: u64,
        client: String,
        file_name: String,
    },
    Disconnect { time: u64, client: String },
    /// Deterministically lose the first request from `client` carrying `seq`
    DropNextRequestSeq { client: String, seq: u64 },
    /// Every request from `client` fails with a transport error in `[from, until)`
    Blackhole {
        client: String,
        from: u64,
        until: u64,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAssertion {
    /// Assert that `to` received a text message with this content
    TextDelivered { to: String, text: String },
    /// Assert that `to` saw the file-ready notification for `file_name`
    FileReady { to: String, file_name: String },
    /// Assert that the file `to` reassembled from `from` equals the generated content
    FileIntact {
        to: String,
        from: String,
        file_name: String,
        size: usize,
    },
    /// Assert the number of permanent send failures reported to `client`
    PermanentFailures {
        client: String,
        min: u32,
        max: Option<u32>,
    },
    /// Assert that nothing was left in `client`'s send window at teardown
    WindowDrained { client: String },
    /// Assert the number of send/upload requests issued by `client`
    RequestCount {
        client: String,
        min: u32,
        max: Option<u32>,
    },
}
