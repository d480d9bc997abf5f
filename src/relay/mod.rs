//! Local-peer byte relay
//!
//! Once a work connection is linked, application payload received from
//! the broker is handed to a local peer, and whatever the peer answers
//! flows back over the same stream. The peer is an external collaborator
//! behind a small async trait.

mod echo;
mod tcp;

pub use echo::EchoPeer;
pub use tcp::TcpPeer;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("local peer unreachable: {0}")]
    Unreachable(String),
}

/// A local peer that consumes relayed bytes and may answer
#[async_trait]
pub trait PeerRelay: Send {
    /// Hand `data` to the peer; an `Ok(Some(..))` response is written
    /// back to the broker on the work-connection stream.
    async fn relay(&mut self, data: &[u8]) -> Result<Option<Bytes>, RelayError>;
}
