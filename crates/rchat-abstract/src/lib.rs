pub mod config;
pub mod interface;
pub mod scenario;
pub mod segment;

pub use interface::{
    Notice, Operation, SessionContext, TimerHandle, TimerService, TimerToken, Transport,
    TransportError,
};
pub use segment::{
    DownloadRequest, DownloadResponse, FileChunk, InboundSegment, Payload, PollRequest,
    PollResponse, Segment, SegmentKind, SendRequest, SendResponse, UploadChunkRequest,
    UploadChunkResponse, WireError, WireMessage,
};

pub use config::{ArqConfig, DEFAULT_CHUNK_SIZE, FailurePolicy, LinkConfig};
pub use scenario::{ConfigOverride, TestAction, TestAssertion, TestScenario};
