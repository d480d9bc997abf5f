//! Multiplexing layer - logical streams over one physical connection
//!
//! Provides:
//! - Fixed 12-byte frame header encoding/decoding
//! - Per-stream connection lifecycle driven by header flags

mod frame;
mod stream;

pub use frame::{Flags, FrameType, MuxHeader, HEADER_SIZE, PROTO_VERSION};
pub use stream::{FlagAction, MuxStream, StreamState};

use thiserror::Error;

/// Multiplexing layer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("unknown frame type: {0}")]
    UnknownType(u8),

    #[error("header too short: {0} bytes")]
    ShortHeader(usize),

    #[error("unexpected FIN in state {0:?}")]
    UnexpectedFin(StreamState),
}

/// Stream id of the always-present control stream
pub const CONTROL_STREAM_ID: u32 = 1;
