//! Typed control messages carried as stream payload
//!
//! Envelope format:
//! ```text
//! +--------+----------------+----------------+
//! |  Type  |  Length (8B)   |  Data (Length) |
//! +--------+----------------+----------------+
//! ```
//!
//! `Type` is a single ASCII byte, `Length` is big endian. `Data` is a
//! UTF-8 JSON document for control messages and opaque bytes for relayed
//! application data.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope header size in bytes (type byte + 8-byte length)
pub const ENVELOPE_HEADER_SIZE: usize = 9;

/// Message errors
#[derive(Debug, Error)]
pub enum MsgError {
    #[error("envelope too short: {0} bytes")]
    Truncated(usize),

    #[error("envelope declares {declared} bytes but only {available} are present")]
    LengthMismatch { declared: u64, available: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Control message types. The wire value is the ASCII byte.
///
/// The NAT-hole-punching variants are recognized so inbound frames
/// carrying them decode cleanly; this client never acts on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Login,
    LoginResp,
    NewProxy,
    NewProxyResp,
    CloseProxy,
    NewWorkConn,
    ReqWorkConn,
    StartWorkConn,
    NewVisitorConn,
    NewVisitorConnResp,
    Ping,
    Pong,
    UdpPacket,
    NatHoleVisitor,
    NatHoleClient,
    NatHoleResp,
    NatHoleClientDetectOk,
    NatHoleSid,
    Unknown(u8),
}

impl MsgType {
    pub fn from_byte(b: u8) -> MsgType {
        match b {
            b'o' => MsgType::Login,
            b'1' => MsgType::LoginResp,
            b'p' => MsgType::NewProxy,
            b'2' => MsgType::NewProxyResp,
            b'c' => MsgType::CloseProxy,
            b'w' => MsgType::NewWorkConn,
            b'r' => MsgType::ReqWorkConn,
            b's' => MsgType::StartWorkConn,
            b'v' => MsgType::NewVisitorConn,
            b'3' => MsgType::NewVisitorConnResp,
            b'h' => MsgType::Ping,
            b'4' => MsgType::Pong,
            b'u' => MsgType::UdpPacket,
            b'i' => MsgType::NatHoleVisitor,
            b'n' => MsgType::NatHoleClient,
            b'm' => MsgType::NatHoleResp,
            b'd' => MsgType::NatHoleClientDetectOk,
            b'5' => MsgType::NatHoleSid,
            other => MsgType::Unknown(other),
        }
    }

    pub fn byte(&self) -> u8 {
        match self {
            MsgType::Login => b'o',
            MsgType::LoginResp => b'1',
            MsgType::NewProxy => b'p',
            MsgType::NewProxyResp => b'2',
            MsgType::CloseProxy => b'c',
            MsgType::NewWorkConn => b'w',
            MsgType::ReqWorkConn => b'r',
            MsgType::StartWorkConn => b's',
            MsgType::NewVisitorConn => b'v',
            MsgType::NewVisitorConnResp => b'3',
            MsgType::Ping => b'h',
            MsgType::Pong => b'4',
            MsgType::UdpPacket => b'u',
            MsgType::NatHoleVisitor => b'i',
            MsgType::NatHoleClient => b'n',
            MsgType::NatHoleResp => b'm',
            MsgType::NatHoleClientDetectOk => b'd',
            MsgType::NatHoleSid => b'5',
            MsgType::Unknown(b) => *b,
        }
    }
}

/// A typed, length-prefixed message
#[derive(Debug, Clone)]
pub struct Envelope {
    pub msg_type: MsgType,
    pub data: Bytes,
}

impl Envelope {
    pub fn new(msg_type: MsgType, data: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            data: data.into(),
        }
    }

    /// Build an envelope around a JSON-serializable payload
    pub fn json<T: Serialize>(msg_type: MsgType, payload: &T) -> Result<Self, MsgError> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self::new(msg_type, body))
    }

    /// Encode to wire form
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + self.data.len());
        buf.put_u8(self.msg_type.byte());
        buf.put_u64(self.data.len() as u64);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode from wire form
    pub fn decode(buf: &[u8]) -> Result<Self, MsgError> {
        if buf.len() < ENVELOPE_HEADER_SIZE {
            return Err(MsgError::Truncated(buf.len()));
        }

        let msg_type = MsgType::from_byte(buf[0]);
        let declared = u64::from_be_bytes([
            buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8],
        ]);

        let available = buf.len() - ENVELOPE_HEADER_SIZE;
        if declared as usize > available {
            return Err(MsgError::LengthMismatch {
                declared,
                available,
            });
        }

        let data = Bytes::copy_from_slice(
            &buf[ENVELOPE_HEADER_SIZE..ENVELOPE_HEADER_SIZE + declared as usize],
        );

        Ok(Self { msg_type, data })
    }
}

/// Login request payload. `hostname` and `user` serialize as empty
/// strings when unset; `metas` is always JSON null.
#[derive(Debug, Clone, Serialize)]
pub struct Login {
    pub version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub user: String,
    pub privilege_key: String,
    pub timestamp: i64,
    pub run_id: String,
    pub pool_count: u32,
    pub metas: Option<serde_json::Value>,
}

/// Login response payload. A missing or empty `run_id` denotes an
/// authentication failure.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResp {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Proxy registration payload
#[derive(Debug, Clone, Serialize)]
pub struct NewProxy {
    pub proxy_name: String,
    pub proxy_type: String,
    pub use_encryption: bool,
    pub use_compression: bool,
    pub remote_port: u16,
}

/// Work-connection binding payload
#[derive(Debug, Clone, Serialize)]
pub struct NewWorkConn {
    pub run_id: String,
}

/// Heartbeat payload (empty object on the wire)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {}
