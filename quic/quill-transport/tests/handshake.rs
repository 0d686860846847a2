// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Two-endpoint simulations over an in-memory loopback with the
//! deterministic crypto/TLS testing providers and a manually driven
//! clock.

use quill_codec::{Encoder, EncoderBuffer};
use quill_core::{
    crypto::testing as crypto_testing,
    endpoint,
    packet::{self, Header},
    stream::StreamId,
    time::{testing::MockClock, Clock, Timestamp},
    version,
};
use quill_transport::{
    connection::{ApplicationHandler, CloseReason, State, StreamEvent},
    endpoint::{Config, ConnectionHandle, Quic},
};
use std::{
    cell::RefCell,
    collections::HashMap,
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

#[derive(Default)]
struct Recorder {
    data: HashMap<u64, Vec<u8>>,
    fins: Vec<u64>,
    resets: Vec<(u64, u16)>,
    stops: Vec<(u64, u16)>,
    closes: Vec<CloseReason>,
}

impl ApplicationHandler for Recorder {
    fn on_stream_data(&mut self, stream_id: StreamId, event: StreamEvent) {
        let id = stream_id.as_u64();
        match event {
            StreamEvent::Data(bytes) => {
                self.data.entry(id).or_default().extend_from_slice(bytes);
            }
            StreamEvent::Fin(bytes) => {
                self.data.entry(id).or_default().extend_from_slice(bytes);
                self.fins.push(id);
            }
            StreamEvent::ResetReceived(code) => self.resets.push((id, code)),
            StreamEvent::StopSendingReceived(code) => self.stops.push((id, code)),
        }
    }

    fn on_close(&mut self, reason: CloseReason) {
        self.closes.push(reason);
    }
}

struct Sim {
    clock: MockClock,
    client: Quic,
    server: Quic,
    client_addr: SocketAddr,
    server_addr: SocketAddr,
    client_events: Rc<RefCell<Recorder>>,
    server_events: Rc<RefCell<Recorder>>,
    /// First header byte of every datagram that crossed the link
    wire_log: Vec<u8>,
}

fn endpoint_pair(configure_server: impl FnOnce(&mut Config)) -> Sim {
    let client_events = Rc::new(RefCell::new(Recorder::default()));
    let server_events = Rc::new(RefCell::new(Recorder::default()));

    let client = Quic::new(
        Config::new(endpoint::Type::Client),
        Rc::new(crypto_testing::Provider::new()),
        Rc::new(crypto_testing::Context::new()),
        client_events.clone(),
    );

    let mut server_config = Config::new(endpoint::Type::Server);
    configure_server(&mut server_config);
    let server = Quic::new(
        server_config,
        Rc::new(crypto_testing::Provider::new()),
        Rc::new(crypto_testing::Context::new()),
        server_events.clone(),
    );

    Sim {
        clock: MockClock::new(),
        client,
        server,
        client_addr: "192.0.2.1:1024".parse().unwrap(),
        server_addr: "192.0.2.2:4433".parse().unwrap(),
        client_events,
        server_events,
        wire_log: Vec::new(),
    }
}

impl Sim {
    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Exchanges due datagrams in both directions; when the link is
    /// quiet, advances the clock to the earliest wake time
    fn pump(&mut self, rounds: usize) {
        for _ in 0..rounds {
            let now = self.now();
            let mut progressed = false;

            while let Some((bytes, _)) = self.client.prepare_next(now) {
                self.wire_log.push(bytes[0]);
                self.server.incoming(&bytes, self.client_addr, now);
                progressed = true;
            }
            while let Some((bytes, _)) = self.server.prepare_next(now) {
                self.wire_log.push(bytes[0]);
                self.client.incoming(&bytes, self.server_addr, now);
                progressed = true;
            }

            if !progressed {
                let next = [
                    self.client.next_wake_time(),
                    self.server.next_wake_time(),
                ]
                .into_iter()
                .flatten()
                .min();
                match next {
                    Some(next) if next > now => self.clock.set(next),
                    _ => self.clock.advance(Duration::from_millis(1)),
                }
            }
        }
    }

    fn connect(&mut self, sni: &str) -> ConnectionHandle {
        let handle = self
            .client
            .create_client_connection(
                self.server_addr,
                sni,
                "hq-08",
                version::DRAFT_08,
                self.now(),
            )
            .unwrap();
        self.pump(20);
        handle
    }

    fn client_state(&self, handle: ConnectionHandle) -> State {
        self.client.connection(handle).unwrap().state()
    }

    fn server_state(&self) -> Option<State> {
        let handle = *self.server.handles().first()?;
        Some(self.server.connection(handle).unwrap().state())
    }
}

#[test]
fn one_rtt_handshake_and_transfer_test() {
    let mut sim = endpoint_pair(|_| {});
    let handle = sim.connect("test.example.com");

    assert!(matches!(
        sim.client_state(handle),
        State::ClientAlmostReady | State::ClientReady
    ));
    assert!(matches!(
        sim.server_state(),
        Some(State::ServerAlmostReady | State::ServerReady)
    ));

    // 16 KiB on stream 4, client to server
    let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
    sim.client
        .add_to_stream(handle, StreamId::new(4), &payload, true, sim.now())
        .unwrap();
    sim.pump(200);

    assert_eq!(sim.client_state(handle), State::ClientReady);
    assert_eq!(sim.server_state(), Some(State::ServerReady));

    let events = sim.server_events.borrow();
    assert_eq!(events.data.get(&4).map(Vec::len), Some(payload.len()));
    assert_eq!(events.data.get(&4), Some(&payload));
    assert_eq!(events.fins, vec![4]);
}

#[test]
fn bidirectional_transfer_test() {
    let mut sim = endpoint_pair(|_| {});
    let handle = sim.connect("echo.example.com");

    sim.client
        .add_to_stream(handle, StreamId::new(4), b"request", true, sim.now())
        .unwrap();
    sim.pump(50);

    // server answers on the same stream
    let server_handle = *sim.server.handles().first().unwrap();
    sim.server
        .add_to_stream(server_handle, StreamId::new(4), b"response", true, sim.now())
        .unwrap();
    sim.pump(50);

    // a ping probe round-trips without disturbing anything
    let now = sim.now();
    sim.client
        .connection_mut(handle)
        .unwrap()
        .ping(b"probe", now);
    sim.pump(20);
    assert!(sim.client.connection(handle).is_some());

    assert_eq!(
        sim.server_events.borrow().data.get(&4).map(Vec::as_slice),
        Some(&b"request"[..])
    );
    assert_eq!(
        sim.client_events.borrow().data.get(&4).map(Vec::as_slice),
        Some(&b"response"[..])
    );
}

#[test]
fn server_cnx_id_callback_test() {
    let mut sim = endpoint_pair(|_| {});
    sim.server
        .set_cnx_id_callback(|_| quill_core::connection_id::ConnectionId::new(0x4242));

    let handle = sim.connect("cb.example.com");
    assert_eq!(
        sim.client.connection(handle).unwrap().server_cnx_id(),
        quill_core::connection_id::ConnectionId::new(0x4242)
    );
}

#[test]
fn stateless_reset_kills_connection_test() {
    let mut sim = endpoint_pair(|_| {});
    let handle = sim.connect("reset-token.example.com");
    sim.pump(10);

    // the server announces an alternate id with its reset token
    let token = quill_core::connection_id::ResetToken::new([0xab; 16]);
    let server_handle = *sim.server.handles().first().unwrap();
    sim.server
        .connection_mut(server_handle)
        .unwrap()
        .queue_new_connection_id(1, quill_core::connection_id::ConnectionId::new(0x9999), token);
    sim.pump(10);

    // later, a garbage short-header packet carrying that token arrives
    let mut bogus = vec![0x43u8];
    bogus.extend_from_slice(&0x9999u64.to_be_bytes());
    bogus.extend_from_slice(&[0u8; 24]);
    bogus.extend_from_slice(token.as_ref());
    let now = sim.now();
    sim.client.incoming(&bogus, sim.server_addr, now);

    assert!(sim
        .client_events
        .borrow()
        .closes
        .contains(&CloseReason::StatelessReset));
    assert!(sim.client.connection(handle).is_none());
}

#[test]
fn version_negotiation_restart_test() {
    let mut sim = endpoint_pair(|_| {});

    // propose the internal test version; the first flight stays on our
    // side of the link
    let handle = sim
        .client
        .create_client_connection(
            sim.server_addr,
            "vn.example.com",
            "hq-08",
            version::INTERNAL_TEST,
            sim.now(),
        )
        .unwrap();

    let now = sim.now();
    let (initial, _) = sim.client.prepare_next(now).unwrap();
    let header = Header::parse(&initial, initial.len(), endpoint::Type::Server).unwrap();
    assert_eq!(sim.client_state(handle), State::ClientInitSent);

    // a negotiation reply listing only the draft versions
    let mut vn = vec![0u8; 64];
    let mut encoder = EncoderBuffer::new(&mut vn);
    packet::encode_version_negotiation(
        header.cnx_id,
        header.pn_truncated as u32,
        header.version,
        &[version::DRAFT_08, version::DRAFT_07],
        &mut encoder,
    );
    let len = encoder.len();
    vn.truncate(len);
    sim.client.incoming(&vn, sim.server_addr, now);

    // the client restarts under draft-08 and completes normally
    sim.pump(30);
    let connection = sim.client.connection(handle).unwrap();
    assert_eq!(connection.negotiated_version(), version::DRAFT_08);
    assert!(matches!(
        connection.state(),
        State::ClientAlmostReady | State::ClientReady
    ));
}

#[test]
fn server_emits_version_negotiation_test() {
    let mut sim = endpoint_pair(|_| {});

    // a client initial with an alien version, long form, padded to 1200
    let mut datagram = vec![0u8; 1_200];
    let mut encoder = EncoderBuffer::new(&mut datagram);
    packet::encode_long(
        packet::PacketType::ClientInitial,
        quill_core::connection_id::ConnectionId::new(0xabcd),
        0,
        0x1a2a_3a4a,
        &mut encoder,
    );
    let now = sim.now();
    sim.server.incoming(&datagram, sim.client_addr, now);

    let (reply, _) = sim.server.prepare_next(now).expect("negotiation queued");
    let header = Header::parse(&reply, reply.len(), endpoint::Type::Client).unwrap();
    assert_eq!(header.ptype, packet::PacketType::VersionNegotiation);
    assert_eq!(
        header.cnx_id,
        quill_core::connection_id::ConnectionId::new(0xabcd)
    );

    // the offered list is the full supported table
    let mut offered = Vec::new();
    let mut rest = &reply[header.offset..];
    while rest.len() >= 4 {
        offered.push(u32::from_be_bytes(rest[..4].try_into().unwrap()));
        rest = &rest[4..];
    }
    assert!(offered.contains(&version::DRAFT_08));
    assert_eq!(sim.server.connection_count(), 0);
}

#[test]
fn stateless_retry_test() {
    let mut sim = endpoint_pair(|config| {
        config.check_cookie = true;
    });
    let handle = sim.connect("retry.example.com");

    // the retry round does not leave server state behind prematurely,
    // and the handshake still completes
    assert!(matches!(
        sim.client_state(handle),
        State::ClientAlmostReady | State::ClientReady
    ));
    assert!(sim.server_state().is_some());

    // a stateless retry crossed the wire: long form, type 0x03
    assert!(sim.wire_log.contains(&0x83));

    // data still flows
    sim.client
        .add_to_stream(handle, StreamId::new(4), b"after retry", true, sim.now())
        .unwrap();
    sim.pump(50);
    assert_eq!(
        sim.server_events.borrow().data.get(&4).map(Vec::as_slice),
        Some(&b"after retry"[..])
    );
}

#[test]
fn idle_timeout_test() {
    let mut sim = endpoint_pair(|config| {
        config.local_parameters.idle_timeout = 2;
    });
    // the client advertises the same 2 second limit
    sim.client = {
        let mut config = Config::new(endpoint::Type::Client);
        config.local_parameters.idle_timeout = 2;
        Quic::new(
            config,
            Rc::new(crypto_testing::Provider::new()),
            Rc::new(crypto_testing::Context::new()),
            sim.client_events.clone(),
        )
    };

    let handle = sim.connect("idle.example.com");
    sim.client
        .add_to_stream(handle, StreamId::new(4), b"ping", true, sim.now())
        .unwrap();
    sim.pump(50);

    let quiesced_at = sim.now();
    let packets_before = sim.wire_log.len();

    // run well past the idle limit
    while sim.now() < quiesced_at + Duration::from_secs(3) {
        sim.pump(1);
    }

    // both sides dropped the connection without a close exchange
    assert_eq!(sim.wire_log.len(), packets_before);
    assert_eq!(sim.client.connection_count(), 0);
    assert_eq!(sim.server.connection_count(), 0);
    assert!(sim
        .client_events
        .borrow()
        .closes
        .contains(&CloseReason::IdleTimeout));
    assert!(sim
        .server_events
        .borrow()
        .closes
        .contains(&CloseReason::IdleTimeout));

    // the timeout fired near the configured two seconds
    let elapsed = sim.now().saturating_duration_since(quiesced_at);
    assert!(elapsed >= Duration::from_secs(2));
}

#[test]
fn zero_rtt_resumption_test() {
    let mut sim = endpoint_pair(|_| {});

    // first connection, to obtain a ticket
    let first = sim.connect("0rtt.example.com");
    let first_now = sim.now();
    sim.client
        .connection_mut(first)
        .unwrap()
        .close(None, first_now);
    sim.pump(30);
    assert!(!sim.client.tickets.is_empty());

    // resume: queue 0-RTT data before any server flight arrives
    let now = sim.now();
    let handle = sim
        .client
        .create_client_connection(
            sim.server_addr,
            "0rtt.example.com",
            "hq-08",
            version::DRAFT_08,
            now,
        )
        .unwrap();
    sim.client
        .add_to_stream(handle, StreamId::new(4), b"early data", true, now)
        .unwrap();

    // the initial and the 0-RTT packet leave before any response
    let (initial, _) = sim.client.prepare_next(now).expect("initial");
    let (early, _) = sim.client.prepare_next(now).expect("0-RTT packet");
    let early_header = Header::parse(&early, early.len(), endpoint::Type::Client).unwrap();
    assert_eq!(early_header.ptype, packet::PacketType::ZeroRttProtected);

    sim.server.incoming(&initial, sim.client_addr, now);
    sim.server.incoming(&early, sim.client_addr, now);

    // the early bytes arrived before any client 1-RTT packet could exist
    assert_eq!(
        sim.server_events.borrow().data.get(&4).map(Vec::as_slice),
        Some(&b"early data"[..])
    );
    let server_state = sim.server_state().unwrap();
    assert_eq!(server_state, State::ServerAlmostReady);

    sim.pump(30);
    assert!(sim.client.connection(handle).unwrap().zero_rtt_accepted());
    assert_eq!(
        sim.server_events.borrow().fins,
        vec![4]
    );
}

#[test]
fn reset_stream_test() {
    let mut sim = endpoint_pair(|_| {});
    let handle = sim.connect("reset.example.com");
    sim.pump(10);

    let now = sim.now();
    sim.client
        .add_to_stream(handle, StreamId::new(4), b"partial", false, now)
        .unwrap();
    sim.pump(20);

    let now = sim.now();
    sim.client
        .connection_mut(handle)
        .unwrap()
        .reset_stream(StreamId::new(4), 0x77, now)
        .unwrap();
    sim.pump(20);

    assert_eq!(sim.server_events.borrow().resets, vec![(4, 0x77)]);
}

#[test]
fn stop_sending_obliges_reset_test() {
    let mut sim = endpoint_pair(|_| {});
    let handle = sim.connect("stop.example.com");
    sim.pump(10);

    let now = sim.now();
    sim.client
        .add_to_stream(handle, StreamId::new(4), b"unwanted", false, now)
        .unwrap();
    sim.pump(20);

    let server_handle = *sim.server.handles().first().unwrap();
    let now = sim.now();
    sim.server
        .connection_mut(server_handle)
        .unwrap()
        .stop_sending(StreamId::new(4), 0x55, now)
        .unwrap();
    sim.pump(30);

    // the client saw the request and answered with a reset carrying the
    // same application error
    assert_eq!(sim.client_events.borrow().stops, vec![(4, 0x55)]);
    assert_eq!(sim.server_events.borrow().resets, vec![(4, 0x55)]);
}

#[test]
fn application_close_test() {
    let mut sim = endpoint_pair(|_| {});
    let handle = sim.connect("close.example.com");
    sim.pump(10);

    let now = sim.now();
    sim.client
        .connection_mut(handle)
        .unwrap()
        .close(Some(0x30), now);
    sim.pump(10);

    assert!(sim
        .server_events
        .borrow()
        .closes
        .contains(&CloseReason::Application(0x30)));

    // sends after closing fail
    let result = sim
        .client
        .add_to_stream(handle, StreamId::new(8), b"late", false, sim.now());
    assert!(result.is_err());
}
