//! Control session - the protocol engine
//!
//! Owns the one physical broker connection and drives:
//! - The login handshake and cipher bring-up
//! - Proxy registration and work-connection spin-up
//! - The read/dispatch path for inbound frames
//! - The heartbeat and its watchdog

mod control;
mod heartbeat;
mod identity;

pub use control::{Session, SessionConfig};
pub use heartbeat::{Heartbeat, PING_INTERVAL_TICKS, PONG_TIMEOUT_SECS, TICK_MILLIS};
pub use identity::{device_run_id, LoginIdentity, PROTOCOL_VERSION};

use crate::msg::MsgError;
use crate::mux::{FrameType, MuxError, MuxHeader, HEADER_SIZE};
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest payload a frame may declare. The receive path rejects
/// anything larger as a framing fault instead of buffering it.
pub const MAX_FRAME_SIZE: usize = 2048;

/// Session errors. Everything here ends the connection; only
/// [`SessionError::LoginRejected`] is a policy decision rather than a
/// corrupted-state condition, so the host may retry it without treating
/// the process as wedged.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("framing fault: {0}")]
    Framing(String),

    #[error("send fault: {0}")]
    Send(#[source] std::io::Error),

    #[error("login rejected: {0}")]
    LoginRejected(String),

    #[error("heartbeat timeout: no pong for {0}s")]
    HeartbeatTimeout(i64),

    #[error("protocol invariant violated: {0}")]
    Invariant(#[from] MuxError),

    #[error("malformed control message: {0}")]
    Msg(#[from] MsgError),

    #[error("broker is going away")]
    GoAway,

    #[error("protocol state error: {0}")]
    State(String),

    #[error("hardware identity unavailable: {0}")]
    Identity(String),
}

impl SessionError {
    /// Whether the host should treat the failure as a full restart
    /// (the embedded recovery policy: a corrupted protocol or cipher
    /// state is repaired by reconnecting from scratch).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::LoginRejected(_))
    }
}

/// What the broker should expose for us. Immutable once built from
/// configuration.
#[derive(Debug, Clone)]
pub struct ProxyServiceSpec {
    pub proxy_name: String,
    pub proxy_type: String,
    pub local_address: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub use_encryption: bool,
    pub use_compression: bool,
}

impl From<&crate::config::ProxyConfig> for ProxyServiceSpec {
    fn from(cfg: &crate::config::ProxyConfig) -> Self {
        Self {
            proxy_name: cfg.proxy_name.clone(),
            proxy_type: cfg.proxy_type.clone(),
            local_address: cfg.local_address.clone(),
            local_port: cfg.local_port,
            remote_port: cfg.remote_port,
            use_encryption: cfg.use_encryption,
            use_compression: cfg.use_compression,
        }
    }
}

/// Read exactly one frame: the 12-byte header, then the declared payload
/// for data frames. Any short read is a framing fault - the protocol has
/// no resynchronization marker, so partial frames are unrecoverable.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(MuxHeader, Bytes), SessionError> {
    let mut hdr_buf = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut hdr_buf)
        .await
        .map_err(|e| SessionError::Framing(format!("short header read: {e}")))?;

    let hdr = MuxHeader::decode(&hdr_buf).map_err(|e| SessionError::Framing(e.to_string()))?;

    // only data frames carry payload; elsewhere `length` is a delta or id
    if hdr.frame_type != FrameType::Data {
        return Ok((hdr, Bytes::new()));
    }

    let len = hdr.length as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SessionError::Framing(format!(
            "declared length {len} exceeds {MAX_FRAME_SIZE}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| SessionError::Framing(format!("short payload read: {e}")))?;

    Ok((hdr, Bytes::from(payload)))
}
