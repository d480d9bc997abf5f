//! TCP-backed local peer

use super::{PeerRelay, RelayError};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// How long to wait for a response chunk before handing control back.
/// The relay is not request/response; this only harvests bytes the
/// service already had ready.
const RESPONSE_POLL: Duration = Duration::from_millis(50);

/// Peer forwarding relayed bytes to a local TCP service
pub struct TcpPeer {
    target: String,
    conn: Option<TcpStream>,
}

impl TcpPeer {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            target: format!("{address}:{port}"),
            conn: None,
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), RelayError> {
        if self.conn.is_none() {
            let stream = TcpStream::connect(&self.target)
                .await
                .map_err(|e| RelayError::Unreachable(format!("{}: {e}", self.target)))?;
            stream.set_nodelay(true).ok();
            debug!(target = %self.target, "connected to local service");
            self.conn = Some(stream);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerRelay for TcpPeer {
    async fn relay(&mut self, data: &[u8]) -> Result<Option<Bytes>, RelayError> {
        self.ensure_connected().await?;
        let Some(stream) = self.conn.as_mut() else {
            return Ok(None);
        };

        if let Err(e) = stream.write_all(data).await {
            // drop the connection so the next chunk reconnects
            warn!(target = %self.target, "local write failed: {e}");
            self.conn = None;
            return Err(RelayError::Io(e));
        }

        let mut buf = vec![0u8; 2048];
        match tokio::time::timeout(RESPONSE_POLL, stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                debug!(target = %self.target, "local service closed");
                self.conn = None;
                Ok(None)
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
            Ok(Err(e)) => {
                self.conn = None;
                Err(RelayError::Io(e))
            }
            Err(_) => Ok(None), // nothing ready yet
        }
    }
}
