use serde::Serialize;
use thiserror::Error;

use crate::segment::{
    DownloadRequest, InboundSegment, PollRequest, SendRequest, UploadChunkRequest,
};

/// What a scheduled timer stands for when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TimerToken {
    /// Retransmission deadline of one buffered segment.
    Retransmit(u64),
    /// Next tick of the repeating poll cycle.
    Poll,
}

/// Opaque identity of one scheduled timer. Never reused within a timer service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimerHandle(pub u64);

/// Relay operations, used to label transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    Send,
    UploadChunk,
    Poll,
    DownloadFile,
    ListUsers,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("relay unreachable: {0}")]
    Unreachable(String),
    #[error("relay answered with status {0}")]
    Status(u16),
    #[error("malformed relay response: {0}")]
    Decode(String),
}

/// Events the session reports to whoever drives it.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Connected {
        user: String,
    },
    /// A send or poll failed transiently. Retransmission is left to the timers.
    TransportError {
        operation: Operation,
        seq: Option<u64>,
        reason: String,
    },
    /// A segment exhausted its retries and was dropped from the window.
    PermanentSendFailure {
        seq: u64,
        retries: u32,
    },
    MessageReceived(InboundSegment),
    FileReady {
        file_name: String,
        sender: String,
        total_chunks: u32,
    },
    FileDownloaded {
        file_name: String,
        bytes: Vec<u8>,
    },
    UsersUpdated(Vec<String>),
    Disconnected,
}

/// The request half of the relay contract.
///
/// Each call starts one operation; its outcome is handed back to the session
/// later as a response event on the same queue.
pub trait Transport {
    fn send(&mut self, request: SendRequest);

    fn upload_chunk(&mut self, request: UploadChunkRequest);

    fn poll(&mut self, request: PollRequest);

    fn download_file(&mut self, request: DownloadRequest);

    fn list_users(&mut self);
}

/// Single-shot delayed callbacks, delivered as `TimerToken` events.
pub trait TimerService {
    fn schedule(&mut self, delay_ms: u64, token: TimerToken) -> TimerHandle;

    /// Cancel a timer. After this returns the timer must never fire.
    /// Cancelling an already fired or unknown handle is a no-op.
    fn cancel(&mut self, handle: TimerHandle);
}

/// Everything a session needs from its driver.
pub trait SessionContext: Transport + TimerService {
    fn notify(&mut self, notice: Notice);

    /// Current time in ms on the driver's clock.
    fn now(&self) -> u64;
}
