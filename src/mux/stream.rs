//! Per-stream connection lifecycle
//!
//! Stream state only ever changes through inbound header flags
//! ([`MuxStream::apply_flags`]) or through the outbound dual
//! ([`MuxStream::send_flags`]).

use super::{Flags, MuxError};
use tracing::debug;

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, nothing sent or received yet
    Init,
    /// First write went out carrying SYN
    SynSend,
    /// Remote opened the stream towards us
    SynReceived,
    /// Both sides have handshaked
    Established,
    /// Local side has closed
    LocalClose,
    /// Remote side has closed
    RemoteClose,
    /// Fully closed, stream is freed
    Closed,
    /// Terminal reset
    Reset,
}

/// What an inbound flag set did to the stream
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagAction {
    /// A FIN was observed (remote closed, or close handshake completed)
    pub fin: bool,
    /// The stream reached `Closed` and is freed
    pub freed: bool,
    /// The stream was reset
    pub reset: bool,
}

/// One logical multiplexed channel
#[derive(Debug, Clone)]
pub struct MuxStream {
    id: u32,
    state: StreamState,
}

impl MuxStream {
    /// Create a new stream in `Init`
    pub fn new(id: u32) -> Self {
        Self {
            id,
            state: StreamState::Init,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Whether a write may be attempted at all. Writes in closing or
    /// terminal states are dropped, never errors.
    pub fn can_write(&self) -> bool {
        !matches!(
            self.state,
            StreamState::LocalClose | StreamState::Closed | StreamState::Reset
        )
    }

    /// Flags to attach to the next outbound frame, advancing the
    /// handshake: the first write from `Init` carries SYN, a write from
    /// `SynReceived` carries ACK.
    pub fn send_flags(&mut self) -> Flags {
        match self.state {
            StreamState::Init => {
                self.state = StreamState::SynSend;
                Flags::SYN
            }
            StreamState::SynReceived => {
                self.state = StreamState::Established;
                Flags::ACK
            }
            _ => Flags::NONE,
        }
    }

    /// Apply inbound header flags, in RST > FIN > ACK precedence.
    ///
    /// A FIN in a state with no transition defined is a protocol
    /// invariant violation, not a recoverable condition.
    pub fn apply_flags(&mut self, flags: Flags) -> Result<FlagAction, MuxError> {
        let mut action = FlagAction::default();

        if flags.contains(Flags::RST) {
            if matches!(self.state, StreamState::Closed | StreamState::Reset) {
                debug!(stream = self.id, "RST on terminal stream ignored");
                return Ok(action);
            }
            self.state = StreamState::Reset;
            action.reset = true;
            debug!(stream = self.id, "stream reset");
            return Ok(action);
        }

        if flags.contains(Flags::FIN) {
            action.fin = true;
            match self.state {
                StreamState::SynSend | StreamState::SynReceived | StreamState::Established => {
                    self.state = StreamState::RemoteClose;
                }
                StreamState::LocalClose => {
                    self.state = StreamState::Closed;
                    action.freed = true;
                    debug!(stream = self.id, "stream freed");
                }
                state => return Err(MuxError::UnexpectedFin(state)),
            }
            return Ok(action);
        }

        if flags.contains(Flags::ACK) {
            if matches!(self.state, StreamState::SynSend | StreamState::SynReceived) {
                self.state = StreamState::Established;
            }
        }

        Ok(action)
    }
}
