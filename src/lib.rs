//! # Burrow
//!
//! An embedded-style client for a reverse-tunnel protocol. One TCP
//! connection to a tunnel broker carries multiple logical byte streams;
//! the client authenticates, registers a local service so the broker can
//! expose it remotely, and relays application data between the broker and
//! a local peer.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Control Session                     │
//! │  (login, proxy registration, work conns, heartbeat)  │
//! ├─────────────────────────────────────────────────────┤
//! │                 Message Envelope                     │
//! │       (typed, length-prefixed control messages)      │
//! ├──────────────────────────┬──────────────────────────┤
//! │      Cipher Engine       │      Local Relay         │
//! │  (AES-128-CFB streaming) │  (local peer byte sink)  │
//! ├──────────────────────────┴──────────────────────────┤
//! │                 Multiplexing Layer                   │
//! │      (12-byte frame headers, stream lifecycle)       │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod crypto;
pub mod msg;
pub mod mux;
pub mod relay;
pub mod session;
pub mod status;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mux error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Message error: {0}")]
    Msg(#[from] msg::MsgError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Relay error: {0}")]
    Relay(#[from] relay::RelayError),

    #[error("Configuration error: {0}")]
    Config(String),
}
