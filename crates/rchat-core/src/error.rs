use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Soft failure: the caller retries once acknowledgments free a slot.
    #[error("send window full ({in_flight}/{capacity} segments awaiting ack)")]
    WindowFull { in_flight: u64, capacity: usize },

    #[error("username must not be empty")]
    InvalidUser,

    #[error("no peer selected")]
    NoPeer,

    #[error("refusing to send an empty message")]
    EmptyMessage,

    #[error("file `{0}` is empty")]
    EmptyFile(String),

    #[error("session is closed")]
    Closed,

    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("`{file_name}` from {sender} is incomplete ({received}/{total} chunks)")]
    IncompleteFile {
        file_name: String,
        sender: String,
        received: u32,
        total: u32,
    },

    #[error("no chunks of `{file_name}` from {sender} have arrived")]
    UnknownFile { file_name: String, sender: String },

    #[error("chunk {index} of `{file_name}` is outside 0..{total}")]
    IndexOutOfRange {
        file_name: String,
        index: u32,
        total: u32,
    },

    #[error("`{file_name}` announced {got} chunks, earlier chunks said {expected}")]
    TotalMismatch {
        file_name: String,
        expected: u32,
        got: u32,
    },

    #[error("`{file_name}` announced zero chunks")]
    EmptyChunkSet { file_name: String },

    #[error("chunk {index} of `{file_name}` is not valid base64")]
    Decode {
        file_name: String,
        index: usize,
        #[source]
        source: base64::DecodeError,
    },
}
