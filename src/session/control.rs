//! The control session engine
//!
//! One [`Session`] owns one physical broker connection: the control
//! stream (id 1), at most one proxy client stream, the cipher pair, and
//! the heartbeat. The dispatch loop feeds it inbound frames via
//! [`Session::handle_frame`] and the periodic scheduler calls
//! [`Session::tick`]; both run on the same task, so the session needs no
//! interior locking.

use super::{Heartbeat, LoginIdentity, ProxyServiceSpec, SessionError};
use crate::clock::Clock;
use crate::crypto::{CipherPair, IV_SIZE};
use crate::msg::{Envelope, LoginResp, MsgType, NewProxy, NewWorkConn, Ping};
use crate::mux::{
    FlagAction, Flags, FrameType, MuxHeader, MuxStream, CONTROL_STREAM_ID, HEADER_SIZE,
};
use crate::relay::PeerRelay;
use crate::status::{ConnectivityState, StatusSink};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

/// Session-level settings, extracted from configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub token: String,
    pub service: ProxyServiceSpec,
    pub heartbeat_interval_ticks: u32,
    pub heartbeat_timeout_secs: i64,
}

/// The active work connection: one stream relaying application bytes to
/// the local peer once the broker marks it linked.
struct ProxyClient {
    stream: MuxStream,
    linked: bool,
}

/// Which of the session's two streams an operation targets
#[derive(Debug, Clone, Copy)]
enum StreamSel {
    Control,
    Client,
}

/// The protocol engine for one broker connection
pub struct Session<W> {
    writer: W,
    token: String,
    service: ProxyServiceSpec,
    identity: LoginIdentity,
    control: MuxStream,
    client: Option<ProxyClient>,
    ciphers: Option<CipherPair>,
    next_stream_id: u32,
    proxy_registered: bool,
    proxy_active: bool,
    heartbeat: Heartbeat,
    clock: Box<dyn Clock>,
    status: Box<dyn StatusSink>,
    peer: Box<dyn PeerRelay>,
}

impl<W: AsyncWrite + Unpin> Session<W> {
    pub fn new(
        writer: W,
        config: SessionConfig,
        identity: LoginIdentity,
        clock: Box<dyn Clock>,
        status: Box<dyn StatusSink>,
        peer: Box<dyn PeerRelay>,
    ) -> Self {
        Self {
            writer,
            token: config.token,
            service: config.service,
            identity,
            control: MuxStream::new(CONTROL_STREAM_ID),
            client: None,
            ciphers: None,
            next_stream_id: CONTROL_STREAM_ID,
            proxy_registered: false,
            proxy_active: false,
            heartbeat: Heartbeat::new(
                config.heartbeat_interval_ticks,
                config.heartbeat_timeout_secs,
            ),
            clock,
            status,
            peer,
        }
    }

    pub fn logged(&self) -> bool {
        self.identity.logged
    }

    pub fn run_id(&self) -> &str {
        &self.identity.run_id
    }

    pub fn cipher_ready(&self) -> bool {
        self.ciphers.is_some()
    }

    pub fn proxy_registered(&self) -> bool {
        self.proxy_registered
    }

    pub fn proxy_active(&self) -> bool {
        self.proxy_active
    }

    pub fn client_stream_id(&self) -> Option<u32> {
        self.client.as_ref().map(|c| c.stream.id())
    }

    /// Kick off the session on a fresh connection: the control-stream
    /// window update (which carries the SYN handshake flag), then the
    /// plaintext login request.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        self.send_window_update(StreamSel::Control, 0).await?;
        self.send_login().await
    }

    /// Process one inbound frame. Flags apply to the addressed stream
    /// for every frame type; payload handling is type-specific.
    pub async fn handle_frame(
        &mut self,
        hdr: MuxHeader,
        payload: Bytes,
    ) -> Result<(), SessionError> {
        trace!(
            frame_type = ?hdr.frame_type,
            stream = hdr.stream_id,
            flags = %hdr.flags,
            length = hdr.length,
            "inbound frame"
        );

        let action = match self.stream_for_id(hdr.stream_id) {
            Some(stream) => stream.apply_flags(hdr.flags)?,
            None => {
                trace!(stream = hdr.stream_id, "frame for unknown stream");
                FlagAction::default()
            }
        };
        if action.fin {
            // the broker tore the relay down: leave proxy mode and show
            // the link as lost until the next work connection
            self.proxy_active = false;
            if let Some(client) = self.client.as_mut() {
                client.linked = false;
            }
            self.status.set_state(ConnectivityState::Lost);
        }

        match hdr.frame_type {
            FrameType::Data => self.handle_data(hdr.stream_id, payload).await,
            FrameType::Ping => self.handle_mux_ping(&hdr).await,
            FrameType::WindowUpdate => Ok(()), // liveness signal only
            FrameType::GoAway => Err(SessionError::GoAway),
        }
    }

    /// One 100 ms scheduler tick: drive the status indicator, and every
    /// ping interval check the watchdog and send a heartbeat.
    pub async fn tick(&mut self) -> Result<(), SessionError> {
        self.status.on_tick();

        if !self.heartbeat.on_tick() {
            return Ok(());
        }

        let now = self.clock.unix_now();
        if self.heartbeat.expired(now) {
            let silence = now - self.heartbeat.last_pong().unwrap_or(now);
            return Err(SessionError::HeartbeatTimeout(silence));
        }

        if self.ciphers.is_some() {
            debug!("ping broker");
            let env = Envelope::json(MsgType::Ping, &Ping {})?;
            self.send_envelope_enc(env).await?;
        }
        Ok(())
    }

    async fn handle_data(&mut self, stream_id: u32, payload: Bytes) -> Result<(), SessionError> {
        let consumed = payload.len() as u32;

        // control-stream traffic is enciphered once the pair is up
        let plain = if stream_id == CONTROL_STREAM_ID && self.ciphers.is_some() {
            let mut buf = payload.to_vec();
            if let Some(pair) = self.ciphers.as_mut() {
                pair.recv.decrypt(&mut buf);
            }
            Bytes::from(buf)
        } else {
            payload
        };

        if !self.proxy_active {
            self.handle_control_setup(plain).await
        } else {
            self.handle_proxy_data(stream_id, plain).await?;
            // acknowledge consumed bytes for the broker's window
            // bookkeeping, whichever stream produced the data
            self.send_window_update(StreamSel::Client, consumed).await
        }
    }

    /// Pre-proxy control traffic: login response, then the raw IV, then
    /// encrypted control messages.
    async fn handle_control_setup(&mut self, payload: Bytes) -> Result<(), SessionError> {
        if !self.identity.logged {
            let env = Envelope::decode(&payload)?;
            if env.msg_type == MsgType::LoginResp {
                self.handle_login_resp(&env.data)?;
            } else {
                debug!(msg_type = ?env.msg_type, "ignoring message before login");
            }
            return Ok(());
        }

        if self.ciphers.is_none() {
            // the first frame after login is the broker's IV, raw
            if payload.len() != IV_SIZE {
                info!(length = payload.len(), "not a 16-byte IV, keep waiting");
                return Ok(());
            }
            let mut iv = [0u8; IV_SIZE];
            iv.copy_from_slice(&payload);
            self.ciphers = Some(CipherPair::new(&self.token, &iv));
            debug!("cipher contexts initialized for both directions");
            return Ok(());
        }

        let env = Envelope::decode(&payload)?;
        match env.msg_type {
            MsgType::ReqWorkConn => self.handle_req_work_conn().await,
            MsgType::NewProxyResp => {
                info!(proxy = %self.service.proxy_name, "broker accepted proxy");
                Ok(())
            }
            MsgType::Pong => {
                self.record_pong();
                Ok(())
            }
            other => {
                debug!(msg_type = ?other, "ignoring control message");
                Ok(())
            }
        }
    }

    fn record_pong(&mut self) {
        let now = self.clock.unix_now();
        self.heartbeat.record_pong(now);
        trace!(at = now, "pong");
    }

    fn handle_login_resp(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let resp: LoginResp = serde_json::from_slice(data)
            .map_err(|e| SessionError::LoginRejected(format!("malformed response: {e}")))?;

        if resp.run_id.is_empty() {
            let why = resp
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "missing run_id".to_string());
            return Err(SessionError::LoginRejected(why));
        }

        info!(run_id = %resp.run_id, broker_version = %resp.version, "login accepted");
        self.identity.run_id = resp.run_id;
        self.identity.logged = true;
        self.status.set_state(ConnectivityState::Connected);
        Ok(())
    }

    /// The broker wants a relay connection. The first request also
    /// carries the one-time setup: our send-direction IV is echoed back
    /// plaintext so the broker can decipher our traffic (protocol
    /// requirement), and the proxy service is registered.
    async fn handle_req_work_conn(&mut self) -> Result<(), SessionError> {
        if self.client.is_none() {
            if let Some(iv) = self.ciphers.as_ref().map(|c| *c.send.iv()) {
                self.write_stream(StreamSel::Control, &iv).await?;
            }
            self.send_new_proxy().await?;
            self.proxy_registered = true;
        }

        let id = self.next_stream_id + 2;
        self.next_stream_id = id;
        self.client = Some(ProxyClient {
            stream: MuxStream::new(id),
            linked: false,
        });
        info!(stream = id, "new work connection");

        self.send_window_update(StreamSel::Client, 0).await?;
        self.send_new_work_conn().await?;
        self.proxy_active = true;
        Ok(())
    }

    /// Data while a proxy is live: relay traffic on the client stream,
    /// control plane on stream 1.
    async fn handle_proxy_data(
        &mut self,
        stream_id: u32,
        payload: Bytes,
    ) -> Result<(), SessionError> {
        if Some(stream_id) == self.client_stream_id() {
            let linked = self.client.as_ref().map(|c| c.linked).unwrap_or(false);
            if linked {
                match self.peer.relay(&payload).await {
                    Ok(Some(reply)) => {
                        self.write_stream(StreamSel::Client, &reply).await?;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("local peer relay failed: {e}"),
                }
            } else if let Ok(env) = Envelope::decode(&payload) {
                if env.msg_type == MsgType::StartWorkConn {
                    if let Some(client) = self.client.as_mut() {
                        client.linked = true;
                    }
                    info!(stream = stream_id, "work connection linked");
                }
            }
        } else if stream_id == CONTROL_STREAM_ID {
            let env = Envelope::decode(&payload)?;
            if env.msg_type == MsgType::Pong {
                self.record_pong();
            } else {
                debug!(msg_type = ?env.msg_type, "control message while proxying");
            }
        }
        Ok(())
    }

    /// Answer a mux-level ping carrying SYN with an ACK echoing the
    /// opaque ping id. No payload flows in either direction.
    async fn handle_mux_ping(&mut self, hdr: &MuxHeader) -> Result<(), SessionError> {
        if hdr.flags.contains(Flags::SYN) {
            debug!(ping_id = hdr.length, "mux ping");
            let reply = MuxHeader::ping_reply(hdr.length);
            write_frame(&mut self.writer, &reply, &[]).await?;
        }
        Ok(())
    }

    async fn send_login(&mut self) -> Result<(), SessionError> {
        let now = self.clock.unix_now();
        let payload = self.identity.login_payload(&self.token, now);
        info!(run_id = %payload.run_id, timestamp = now, "login");
        let env = Envelope::json(MsgType::Login, &payload)?;
        self.send_envelope(env).await
    }

    async fn send_new_proxy(&mut self) -> Result<(), SessionError> {
        let payload = NewProxy {
            proxy_name: self.service.proxy_name.clone(),
            proxy_type: self.service.proxy_type.clone(),
            use_encryption: self.service.use_encryption,
            use_compression: self.service.use_compression,
            remote_port: self.service.remote_port,
        };
        info!(proxy = %self.service.proxy_name, remote_port = self.service.remote_port, "registering proxy");
        let env = Envelope::json(MsgType::NewProxy, &payload)?;
        self.send_envelope_enc(env).await
    }

    async fn send_new_work_conn(&mut self) -> Result<(), SessionError> {
        let payload = NewWorkConn {
            run_id: self.identity.run_id.clone(),
        };
        let env = Envelope::json(MsgType::NewWorkConn, &payload)?;
        self.send_envelope(env).await
    }

    /// Write an envelope plaintext on the control stream
    async fn send_envelope(&mut self, env: Envelope) -> Result<(), SessionError> {
        let buf = env.encode();
        self.write_stream(StreamSel::Control, &buf).await?;
        Ok(())
    }

    /// Pass an envelope through the send cipher and write it on the
    /// control stream
    async fn send_envelope_enc(&mut self, env: Envelope) -> Result<(), SessionError> {
        let mut buf = env.encode().to_vec();
        match self.ciphers.as_mut() {
            Some(pair) => pair.send.encrypt(&mut buf),
            None => {
                return Err(SessionError::State(
                    "encrypted send before cipher init".to_string(),
                ))
            }
        }
        self.write_stream(StreamSel::Control, &buf).await?;
        Ok(())
    }

    /// Write a data frame on the selected stream. Writes to a closed or
    /// reset stream are dropped (logged, `Ok(false)`), never errors.
    async fn write_stream(&mut self, sel: StreamSel, data: &[u8]) -> Result<bool, SessionError> {
        let (id, flags) = match self.stream_mut(sel) {
            Some(stream) => {
                if !stream.can_write() {
                    info!(
                        stream = stream.id(),
                        dropped = data.len(),
                        "stream closed, write discarded"
                    );
                    return Ok(false);
                }
                (stream.id(), stream.send_flags())
            }
            None => {
                debug!("no client stream, write discarded");
                return Ok(false);
            }
        };

        let hdr = MuxHeader::data(flags, id, data.len() as u32);
        write_frame(&mut self.writer, &hdr, data).await?;
        Ok(true)
    }

    async fn send_window_update(&mut self, sel: StreamSel, delta: u32) -> Result<(), SessionError> {
        let (id, flags) = match self.stream_mut(sel) {
            Some(stream) => (stream.id(), stream.send_flags()),
            None => return Ok(()),
        };
        trace!(stream = id, delta, "window update");
        let hdr = MuxHeader::window_update(flags, id, delta);
        write_frame(&mut self.writer, &hdr, &[]).await
    }

    fn stream_mut(&mut self, sel: StreamSel) -> Option<&mut MuxStream> {
        match sel {
            StreamSel::Control => Some(&mut self.control),
            StreamSel::Client => self.client.as_mut().map(|c| &mut c.stream),
        }
    }

    /// Inbound frames address the control stream by id 1 and whatever
    /// client stream is live by any other id.
    fn stream_for_id(&mut self, id: u32) -> Option<&mut MuxStream> {
        if id == CONTROL_STREAM_ID {
            Some(&mut self.control)
        } else {
            self.client.as_mut().map(|c| &mut c.stream)
        }
    }
}

/// Write one frame: header and payload coalesced into a single write.
async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    hdr: &MuxHeader,
    payload: &[u8],
) -> Result<(), SessionError> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&hdr.encode());
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await.map_err(SessionError::Send)?;
    writer.flush().await.map_err(SessionError::Send)?;
    Ok(())
}
