pub mod ack;
pub mod cancel;
pub mod chunking;
pub mod error;
pub mod reassembly;
pub mod receive_log;
pub mod sequence;
pub mod session;
pub mod testing;
pub mod timer;
pub mod window;

pub use ack::{AckProcessor, AckSource};
pub use cancel::CancelToken;
pub use error::{ReassemblyError, SessionError};
pub use reassembly::{ChunkProgress, ChunkReassembler, ChunkSet, CompletedFile};
pub use receive_log::{Ingested, ReceiveLog};
pub use sequence::SequenceAllocator;
pub use session::{Session, SessionState, WindowStatus};
pub use timer::TimerQueue;
pub use window::{SendFailure, SendWindow};

pub use rchat_abstract::*;
