//! End-to-end tests for the control session
//!
//! A session writes into one end of an in-memory duplex pipe; the tests
//! play the broker on the other end, feeding frames through
//! `handle_frame` and reading the session's writes back with the same
//! frame reader the client binary uses.

use burrow::clock::Clock;
use burrow::crypto::{CipherPair, IV_SIZE};
use burrow::msg::{Envelope, MsgType};
use burrow::mux::{Flags, FrameType, MuxHeader, StreamState, MuxStream};
use burrow::relay::EchoPeer;
use burrow::session::{
    read_frame, LoginIdentity, ProxyServiceSpec, Session, SessionConfig, SessionError,
};
use burrow::status::{ConnectivityState, StatusSink};
use bytes::Bytes;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;

const TOKEN: &str = "52010";
const DEVICE_RUN_ID: &str = "AABBCCDDEEFF";
const BROKER_RUN_ID: &str = "broker-assigned-id";

const IV: [u8; IV_SIZE] = [
    0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e,
    0x1f,
];

#[derive(Clone)]
struct TestClock(Arc<AtomicI64>);

impl TestClock {
    fn new(start: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start)))
    }

    fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn unix_now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct RecordingStatus(Arc<Mutex<Vec<ConnectivityState>>>);

impl StatusSink for RecordingStatus {
    fn set_state(&mut self, state: ConnectivityState) {
        self.0.lock().unwrap().push(state);
    }

    fn on_tick(&mut self) {}
}

struct Harness {
    session: Session<DuplexStream>,
    broker_io: DuplexStream,
    clock: TestClock,
    states: Arc<Mutex<Vec<ConnectivityState>>>,
}

fn harness() -> Harness {
    let (ours, broker_io) = tokio::io::duplex(64 * 1024);
    let clock = TestClock::new(1_700_000_000);
    let states = Arc::new(Mutex::new(Vec::new()));

    let config = SessionConfig {
        token: TOKEN.to_string(),
        service: ProxyServiceSpec {
            proxy_name: "device".to_string(),
            proxy_type: "tcp".to_string(),
            local_address: "127.0.0.1".to_string(),
            local_port: 80,
            remote_port: 8080,
            use_encryption: false,
            use_compression: false,
        },
        heartbeat_interval_ticks: 300,
        heartbeat_timeout_secs: 40,
    };

    let session = Session::new(
        ours,
        config,
        LoginIdentity::new(DEVICE_RUN_ID.to_string()),
        Box::new(clock.clone()),
        Box::new(RecordingStatus(states.clone())),
        Box::new(EchoPeer),
    );

    Harness {
        session,
        broker_io,
        clock,
        states,
    }
}

impl Harness {
    async fn next_write(&mut self) -> (MuxHeader, Bytes) {
        tokio::time::timeout(Duration::from_secs(1), read_frame(&mut self.broker_io))
            .await
            .expect("session wrote nothing")
            .expect("frame parse")
    }

    async fn assert_no_write(&mut self) {
        let result =
            tokio::time::timeout(Duration::from_millis(20), read_frame(&mut self.broker_io)).await;
        assert!(result.is_err(), "unexpected frame written");
    }

    fn envelope_frame(&self, stream_id: u32, flags: Flags, env: Envelope) -> (MuxHeader, Bytes) {
        let body = Bytes::from(env.encode().to_vec());
        (
            MuxHeader::data(flags, stream_id, body.len() as u32),
            body,
        )
    }

    async fn feed(&mut self, frame: (MuxHeader, Bytes)) -> Result<(), SessionError> {
        self.session.handle_frame(frame.0, frame.1).await
    }

    /// Drive the session through a successful login handshake, draining
    /// its outbound writes.
    async fn login(&mut self) {
        self.session.start().await.unwrap();

        let (hdr, _) = self.next_write().await;
        assert_eq!(hdr.frame_type, FrameType::WindowUpdate);
        let (hdr, _) = self.next_write().await;
        assert_eq!(hdr.frame_type, FrameType::Data);

        let resp = Envelope::new(
            MsgType::LoginResp,
            format!("{{\"version\":\"0.45.0\",\"run_id\":\"{BROKER_RUN_ID}\"}}").into_bytes(),
        );
        let frame = self.envelope_frame(1, Flags::ACK, resp);
        self.feed(frame).await.unwrap();
        assert!(self.session.logged());
    }

    /// Login, then bring the cipher pair up. Returns the broker-side
    /// cipher contexts, keystream-aligned with the session's.
    async fn login_and_encrypt(&mut self) -> CipherPair {
        self.login().await;
        let iv_frame = (
            MuxHeader::data(Flags::NONE, 1, IV_SIZE as u32),
            Bytes::copy_from_slice(&IV),
        );
        self.feed(iv_frame).await.unwrap();
        assert!(self.session.cipher_ready());
        CipherPair::new(TOKEN, &IV)
    }

    fn encrypted_envelope_frame(
        &self,
        broker: &mut CipherPair,
        env: Envelope,
    ) -> (MuxHeader, Bytes) {
        let mut body = env.encode().to_vec();
        broker.send.encrypt(&mut body);
        (
            MuxHeader::data(Flags::NONE, 1, body.len() as u32),
            Bytes::from(body),
        )
    }

    async fn next_encrypted_envelope(&mut self, broker: &mut CipherPair) -> (MuxHeader, Envelope) {
        let (hdr, payload) = self.next_write().await;
        let mut buf = payload.to_vec();
        broker.recv.decrypt(&mut buf);
        (hdr, Envelope::decode(&buf).expect("envelope"))
    }
}

/// Scenario A: the login envelope carries every required key and an
/// exact length field.
#[tokio::test]
async fn test_login_envelope_serialization() {
    let mut h = harness();
    h.session.start().await.unwrap();

    // connect handshake: window update with SYN for the control stream
    let (hdr, payload) = h.next_write().await;
    assert_eq!(hdr.frame_type, FrameType::WindowUpdate);
    assert_eq!(hdr.stream_id, 1);
    assert_eq!(hdr.length, 0);
    assert!(hdr.flags.contains(Flags::SYN));
    assert!(payload.is_empty());

    // then the plaintext login
    let (hdr, payload) = h.next_write().await;
    assert_eq!(hdr.frame_type, FrameType::Data);
    assert_eq!(hdr.stream_id, 1);
    assert_eq!(hdr.flags, Flags::NONE);

    assert_eq!(payload[0], b'o');
    let declared = u64::from_be_bytes(payload[1..9].try_into().unwrap());
    let body = &payload[9..];
    assert_eq!(declared as usize, body.len());

    let json: serde_json::Value = serde_json::from_slice(body).unwrap();
    for key in [
        "version",
        "hostname",
        "os",
        "arch",
        "user",
        "privilege_key",
        "timestamp",
        "run_id",
        "pool_count",
        "metas",
    ] {
        assert!(json.get(key).is_some(), "missing key {key}");
    }
    assert_eq!(json["run_id"], DEVICE_RUN_ID);
    assert_eq!(json["pool_count"], 1);
    assert_eq!(json["timestamp"], 1_700_000_000i64);
    assert_eq!(json["privilege_key"].as_str().unwrap().len(), 32);
}

/// Scenario B: decoded header flags drive the documented transitions.
#[tokio::test]
async fn test_header_decode_and_handshake_transitions() {
    let wire = MuxHeader::data(Flags::SYN, 1, 16).encode();
    let hdr = MuxHeader::decode(&wire).unwrap();
    assert_eq!(hdr.version, 0);
    assert_eq!(hdr.frame_type, FrameType::Data);
    assert!(hdr.flags.contains(Flags::SYN));
    assert_eq!(hdr.stream_id, 1);
    assert_eq!(hdr.length, 16);

    // a fresh stream sends: SYN goes out, state advances
    let mut stream = MuxStream::new(1);
    assert_eq!(stream.send_flags(), Flags::SYN);
    assert_eq!(stream.state(), StreamState::SynSend);

    // an ACK comes back: established
    stream.apply_flags(Flags::ACK).unwrap();
    assert_eq!(stream.state(), StreamState::Established);
}

#[tokio::test]
async fn test_login_success_adopts_broker_run_id() {
    let mut h = harness();
    h.login().await;
    assert_eq!(h.session.run_id(), BROKER_RUN_ID);
    assert_eq!(
        h.states.lock().unwrap().as_slice(),
        &[ConnectivityState::Connected]
    );
}

#[tokio::test]
async fn test_login_rejected_on_empty_run_id() {
    let mut h = harness();
    h.session.start().await.unwrap();
    h.next_write().await;
    h.next_write().await;

    let resp = Envelope::new(
        MsgType::LoginResp,
        &b"{\"version\":\"0.45.0\",\"run_id\":\"\",\"error\":\"invalid token\"}"[..],
    );
    let frame = h.envelope_frame(1, Flags::ACK, resp);
    let err = h.feed(frame).await.unwrap_err();
    assert!(matches!(err, SessionError::LoginRejected(_)));
    assert!(!err.is_fatal());

    // prior identity untouched
    assert!(!h.session.logged());
    assert_eq!(h.session.run_id(), DEVICE_RUN_ID);
}

#[tokio::test]
async fn test_login_rejected_on_missing_run_id() {
    let mut h = harness();
    h.session.start().await.unwrap();
    h.next_write().await;
    h.next_write().await;

    let resp = Envelope::new(MsgType::LoginResp, &b"{\"version\":\"0.45.0\"}"[..]);
    let frame = h.envelope_frame(1, Flags::NONE, resp);
    assert!(h.feed(frame).await.is_err());
    assert!(!h.session.logged());
}

#[tokio::test]
async fn test_wrong_sized_iv_is_ignored() {
    let mut h = harness();
    h.login().await;

    let short = (
        MuxHeader::data(Flags::NONE, 1, 10),
        Bytes::from_static(&[0u8; 10]),
    );
    h.feed(short).await.unwrap();
    assert!(!h.session.cipher_ready());

    // the engine keeps waiting; a correct IV still works afterwards
    let good = (
        MuxHeader::data(Flags::NONE, 1, IV_SIZE as u32),
        Bytes::copy_from_slice(&IV),
    );
    h.feed(good).await.unwrap();
    assert!(h.session.cipher_ready());
}

/// Scenario D: the first work-connection request produces exactly the
/// documented side effects, in order.
#[tokio::test]
async fn test_req_work_conn_side_effect_order() {
    let mut h = harness();
    let mut broker = h.login_and_encrypt().await;

    let req = Envelope::new(MsgType::ReqWorkConn, Bytes::new());
    let frame = h.encrypted_envelope_frame(&mut broker, req);
    h.feed(frame).await.unwrap();

    // 1. the send-direction IV echoed back, plaintext
    let (hdr, payload) = h.next_write().await;
    assert_eq!(hdr.frame_type, FrameType::Data);
    assert_eq!(hdr.stream_id, 1);
    assert_eq!(&payload[..], &IV);

    // 2. the encrypted proxy registration
    let (hdr, env) = h.next_encrypted_envelope(&mut broker).await;
    assert_eq!(hdr.stream_id, 1);
    assert_eq!(env.msg_type, MsgType::NewProxy);
    let json: serde_json::Value = serde_json::from_slice(&env.data).unwrap();
    assert_eq!(json["proxy_name"], "device");
    assert_eq!(json["remote_port"], 8080);

    // 3+4. a new client stream (prior id + 2) announced by its window update
    let (hdr, _) = h.next_write().await;
    assert_eq!(hdr.frame_type, FrameType::WindowUpdate);
    assert_eq!(hdr.stream_id, 3);
    assert!(hdr.flags.contains(Flags::SYN));
    assert_eq!(h.session.client_stream_id(), Some(3));

    // 5. the plaintext work-connection binding with the adopted run id
    let (hdr, payload) = h.next_write().await;
    assert_eq!(hdr.frame_type, FrameType::Data);
    assert_eq!(hdr.stream_id, 1);
    let env = Envelope::decode(&payload).unwrap();
    assert_eq!(env.msg_type, MsgType::NewWorkConn);
    let json: serde_json::Value = serde_json::from_slice(&env.data).unwrap();
    assert_eq!(json["run_id"], BROKER_RUN_ID);

    assert!(h.session.proxy_registered());
    assert!(h.session.proxy_active());
    h.assert_no_write().await;
}

#[tokio::test]
async fn test_second_work_conn_skips_registration() {
    let mut h = harness();
    let mut broker = h.login_and_encrypt().await;

    let req = Envelope::new(MsgType::ReqWorkConn, Bytes::new());
    let frame = h.encrypted_envelope_frame(&mut broker, req);
    h.feed(frame).await.unwrap();
    for _ in 0..4 {
        h.next_write().await;
    }

    // second request: no IV echo, no NewProxy - straight to the next stream.
    // A FIN first knocks the session out of proxy mode so the control
    // path sees the request.
    let fin = (MuxHeader::window_update(Flags::FIN, 3, 0), Bytes::new());
    h.feed(fin).await.unwrap();
    assert!(!h.session.proxy_active());

    let req = Envelope::new(MsgType::ReqWorkConn, Bytes::new());
    let frame = h.encrypted_envelope_frame(&mut broker, req);
    h.feed(frame).await.unwrap();

    let (hdr, _) = h.next_write().await;
    assert_eq!(hdr.frame_type, FrameType::WindowUpdate);
    assert_eq!(hdr.stream_id, 5);
    assert_eq!(h.session.client_stream_id(), Some(5));

    let (hdr, payload) = h.next_write().await;
    assert_eq!(hdr.frame_type, FrameType::Data);
    let env = Envelope::decode(&payload).unwrap();
    assert_eq!(env.msg_type, MsgType::NewWorkConn);
    h.assert_no_write().await;
}

#[tokio::test]
async fn test_linked_relay_and_window_acknowledgment() {
    let mut h = harness();
    let mut broker = h.login_and_encrypt().await;

    let req = Envelope::new(MsgType::ReqWorkConn, Bytes::new());
    let frame = h.encrypted_envelope_frame(&mut broker, req);
    h.feed(frame).await.unwrap();
    for _ in 0..4 {
        h.next_write().await;
    }

    // the broker marks the relay linked
    let start = Envelope::new(MsgType::StartWorkConn, Bytes::new());
    let start_len = start.encode().len() as u32;
    let frame = (
        MuxHeader::data(Flags::NONE, 3, start_len),
        Bytes::from(start.encode().to_vec()),
    );
    h.feed(frame).await.unwrap();

    // the StartWorkConn bytes themselves are acknowledged
    let (hdr, _) = h.next_write().await;
    assert_eq!(hdr.frame_type, FrameType::WindowUpdate);
    assert_eq!(hdr.length, start_len);

    // application data flows to the peer; the echo reply comes back on
    // the client stream, then the window acknowledgment
    let data = (
        MuxHeader::data(Flags::NONE, 3, 5),
        Bytes::from_static(b"hello"),
    );
    h.feed(data).await.unwrap();

    let (hdr, payload) = h.next_write().await;
    assert_eq!(hdr.frame_type, FrameType::Data);
    assert_eq!(hdr.stream_id, 3);
    assert_eq!(&payload[..], b"5 bytes received\n");

    let (hdr, _) = h.next_write().await;
    assert_eq!(hdr.frame_type, FrameType::WindowUpdate);
    assert_eq!(hdr.length, 5);
}

#[tokio::test]
async fn test_fin_tears_down_proxy_mode() {
    let mut h = harness();
    let mut broker = h.login_and_encrypt().await;

    let req = Envelope::new(MsgType::ReqWorkConn, Bytes::new());
    let frame = h.encrypted_envelope_frame(&mut broker, req);
    h.feed(frame).await.unwrap();
    for _ in 0..4 {
        h.next_write().await;
    }
    assert!(h.session.proxy_active());

    let fin = (MuxHeader::window_update(Flags::FIN, 3, 0), Bytes::new());
    h.feed(fin).await.unwrap();

    assert!(!h.session.proxy_active());
    assert_eq!(
        h.states.lock().unwrap().last(),
        Some(&ConnectivityState::Lost)
    );
}

#[tokio::test]
async fn test_unexpected_fin_is_fatal() {
    let mut h = harness();
    // control stream still in Init: FIN has no defined transition
    let fin = (MuxHeader::data(Flags::FIN, 1, 0), Bytes::new());
    let err = h.feed(fin).await.unwrap_err();
    assert!(matches!(err, SessionError::Invariant(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_go_away_is_fatal() {
    let mut h = harness();
    h.login().await;
    let frame = (
        MuxHeader::new(FrameType::GoAway, Flags::NONE, 0, 0),
        Bytes::new(),
    );
    let err = h.feed(frame).await.unwrap_err();
    assert!(matches!(err, SessionError::GoAway));
}

#[tokio::test]
async fn test_mux_ping_answered_with_ack_echo() {
    let mut h = harness();
    h.login().await;

    let ping = (
        MuxHeader::new(FrameType::Ping, Flags::SYN, 0, 0xdead),
        Bytes::new(),
    );
    h.feed(ping).await.unwrap();

    let (hdr, payload) = h.next_write().await;
    assert_eq!(hdr.frame_type, FrameType::Ping);
    assert!(hdr.flags.contains(Flags::ACK));
    assert_eq!(hdr.stream_id, 0);
    assert_eq!(hdr.length, 0xdead);
    assert!(payload.is_empty());

    // a ping without SYN is a reply, not a request: no answer
    let pong = (
        MuxHeader::new(FrameType::Ping, Flags::ACK, 0, 0xdead),
        Bytes::new(),
    );
    h.feed(pong).await.unwrap();
    h.assert_no_write().await;
}

#[tokio::test]
async fn test_nat_hole_messages_are_ignored() {
    let mut h = harness();
    let mut broker = h.login_and_encrypt().await;

    for msg_type in [
        MsgType::NatHoleVisitor,
        MsgType::NatHoleClient,
        MsgType::NatHoleResp,
        MsgType::NatHoleSid,
    ] {
        let env = Envelope::new(msg_type, Bytes::new());
        let frame = h.encrypted_envelope_frame(&mut broker, env);
        h.feed(frame).await.unwrap();
    }
    h.assert_no_write().await;
}

/// Scenario C: ping cadence and watchdog arming.
#[tokio::test]
async fn test_heartbeat_ping_and_watchdog() {
    let mut h = harness();
    let mut broker = h.login_and_encrypt().await;

    // 299 ticks: silence
    for _ in 0..299 {
        h.session.tick().await.unwrap();
    }
    h.assert_no_write().await;

    // tick 300: a ping goes out; no pong was ever seen, so the watchdog
    // stays unarmed
    h.session.tick().await.unwrap();
    let (hdr, env) = h.next_encrypted_envelope(&mut broker).await;
    assert_eq!(hdr.stream_id, 1);
    assert_eq!(env.msg_type, MsgType::Ping);
    assert_eq!(&env.data[..], b"{}");

    // the broker answers
    let pong = Envelope::new(MsgType::Pong, &b"{}"[..]);
    let frame = h.encrypted_envelope_frame(&mut broker, pong);
    h.feed(frame).await.unwrap();

    // 41 seconds of silence later, the watchdog fires at the next ping
    // boundary
    h.clock.set(1_700_000_000 + 41);
    let mut failure = None;
    for _ in 0..410 {
        match h.session.tick().await {
            Ok(()) => {}
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    let err = failure.expect("watchdog never fired");
    assert!(matches!(err, SessionError::HeartbeatTimeout(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_watchdog_quiet_while_pongs_flow() {
    let mut h = harness();
    let mut broker = h.login_and_encrypt().await;

    // a pong at T, checked again at T+30: inside the window
    let pong = Envelope::new(MsgType::Pong, &b"{}"[..]);
    let frame = h.encrypted_envelope_frame(&mut broker, pong);
    h.feed(frame).await.unwrap();

    h.clock.set(1_700_000_000 + 30);
    for _ in 0..300 {
        h.session.tick().await.unwrap();
    }
    // the interval ping went out
    let (_, env) = h.next_encrypted_envelope(&mut broker).await;
    assert_eq!(env.msg_type, MsgType::Ping);
}

#[tokio::test]
async fn test_no_ping_before_cipher_is_up() {
    let mut h = harness();
    h.login().await;

    // logged in but the IV has not arrived: ticks stay silent
    for _ in 0..300 {
        h.session.tick().await.unwrap();
    }
    h.assert_no_write().await;
}
