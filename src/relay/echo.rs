//! Byte-count acknowledging peer

use super::{PeerRelay, RelayError};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

/// Peer that acknowledges every chunk with its byte count. Useful for
/// smoke-testing a tunnel without a local service behind it.
pub struct EchoPeer;

#[async_trait]
impl PeerRelay for EchoPeer {
    async fn relay(&mut self, data: &[u8]) -> Result<Option<Bytes>, RelayError> {
        debug!(len = data.len(), "echo peer consumed chunk");
        Ok(Some(Bytes::from(format!("{} bytes received\n", data.len()))))
    }
}
