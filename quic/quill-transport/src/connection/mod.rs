// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection protocol engine.
//!
//! A connection binds the packet pipeline, the stream table, the
//! reliability engine and the TLS session into one state machine. It is
//! driven synchronously: the endpoint context routes inbound datagrams to
//! [`Connection::incoming_packet`] and polls
//! [`Connection::prepare_packet`] for outbound ones.

pub mod state;

pub use state::State;

use crate::{
    recovery::{self, Recovery, SentPacket},
    stream::{StreamHead, StreamSet},
};
use core::time::Duration;
use quill_codec::{DecoderBuffer, Encoder, EncoderBuffer, EncoderValue};
use quill_core::{
    connection_id::{ConnectionId, ResetToken},
    crypto::{self, tls, Epoch, KeyPhase},
    endpoint,
    frame::{self, Frame},
    packet::{self, Header, PacketType, ENFORCED_INITIAL_MIN_SIZE},
    sack::SackList,
    stream::StreamId,
    time::Timestamp,
    transport::{parameters::Parameters, Error},
    varint::VarInt,
    version::{self, Version},
};
use std::{cell::RefCell, collections::VecDeque, net::SocketAddr, rc::Rc};
use tracing::{debug, trace};

/// Hard ceiling on silence before a connection is torn down
pub const MICROSEC_SILENCE_MAX: Duration = Duration::from_secs(120);
/// Hard ceiling on handshake duration
pub const MICROSEC_WAIT_MAX: Duration = Duration::from_secs(10);
/// Initial path MTU assumption before transport parameters arrive
const INITIAL_SEND_MTU: usize = 1_252;
/// Connection-level send window assumed for 0-RTT data before the peer's
/// transport parameters arrive
const DEFAULT_0RTT_WINDOW: u64 = 4_096;

/// Stream-level event surfaced to the application
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    /// In-order stream data
    Data(&'a [u8]),
    /// The final in-order data of the stream; empty for a bare FIN
    Fin(&'a [u8]),
    /// The peer reset the stream with this application error
    ResetReceived(u16),
    /// The peer asked us to stop sending with this application error
    StopSendingReceived(u16),
}

/// Why a connection went away
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// CONNECTION_CLOSE from the peer
    Transport(u16),
    /// APPLICATION_CLOSE from the peer
    Application(u16),
    /// Locally detected protocol error, already reported to the peer
    Local(u16),
    IdleTimeout,
    HandshakeFailure,
    /// A stateless reset matched an announced token
    StatelessReset,
}

/// The application side of a connection
pub trait ApplicationHandler {
    fn on_stream_data(&mut self, stream_id: StreamId, event: StreamEvent);
    fn on_close(&mut self, reason: CloseReason);
}

pub type Handler = Rc<RefCell<dyn ApplicationHandler>>;

/// Everything a connection borrows from its context at creation
pub struct ConnectionConfig {
    pub role: endpoint::Type,
    pub provider: Rc<dyn crypto::Provider>,
    pub tls_context: Rc<dyn tls::Context>,
    pub handler: Handler,
    pub local_parameters: Parameters,
    pub check_cookie: bool,
    pub retry_seed: [u8; 64],
}

pub struct Connection {
    role: endpoint::Type,
    state: State,
    pub(crate) proposed_version: Version,
    pub(crate) version_index: usize,
    pub(crate) initial_cnx_id: ConnectionId,
    pub(crate) server_cnx_id: ConnectionId,
    pub(crate) peer_addr: SocketAddr,
    start_time: Timestamp,
    sni: Option<String>,
    alpn: Option<String>,

    provider: Rc<dyn crypto::Provider>,
    tls_context: Rc<dyn tls::Context>,
    tls: Box<dyn tls::Session>,
    handler: Handler,
    offered_ticket: Option<Vec<u8>>,
    harvested_ticket: Option<Vec<u8>>,

    send_sequence: u64,
    send_mtu: usize,
    cleartext: Option<KeyPhase>,
    zero_rtt: Option<KeyPhase>,
    one_rtt: Option<KeyPhase>,
    zero_rtt_accepted: bool,
    max_early_data_size: usize,
    retry_received: bool,

    local_parameters: Parameters,
    remote_parameters: Option<Parameters>,

    // receive-side ack state
    sack: SackList,
    largest_received: Option<u64>,
    time_largest_received: Timestamp,
    highest_ack_sent: u64,
    highest_ack_time: Timestamp,
    ack_needed: bool,
    eliciting_since_ack: u32,
    out_of_order_seen: bool,
    ack_delay_local: Duration,

    pub recovery: Recovery,

    // connection-level flow control; stream 0 is exempt
    data_sent: u64,
    data_received: u64,
    maxdata_local: u64,
    maxdata_remote: u64,
    max_stream_id_bidir_local: u64,
    max_stream_id_unidir_local: u64,
    max_stream_id_bidir_remote: u64,
    max_stream_id_unidir_remote: u64,

    streams: StreamSet,
    misc_frames: VecDeque<Vec<u8>>,
    retransmit_ready: VecDeque<Vec<u8>>,
    /// Send offset at which a connection-level BLOCKED hint went out
    conn_blocked_at: Option<u64>,

    local_error: Option<Error>,
    remote_error: Option<u16>,
    local_application_error: Option<u16>,
    remote_application_error: Option<u16>,
    close_frame: Option<Vec<u8>>,
    close_respond_needed: bool,
    end_of_closing: Option<Timestamp>,

    /// Peer reset tokens learned from NEW_CONNECTION_ID
    peer_reset_tokens: Vec<ResetToken>,
    /// A stateless packet (retry) the context must transmit for us
    pub(crate) pending_stateless: Option<Vec<u8>>,

    latest_progress_time: Timestamp,
    pub(crate) next_wake_time: Timestamp,
}

impl Connection {
    /// Creates a client connection. The handshake does not start until
    /// [`Connection::start`].
    #[allow(clippy::too_many_arguments)]
    pub fn new_client(
        config: ConnectionConfig,
        initial_cnx_id: ConnectionId,
        peer_addr: SocketAddr,
        sni: &str,
        alpn: &str,
        proposed_version: Version,
        offered_ticket: Option<Vec<u8>>,
        now: Timestamp,
    ) -> Result<Self, Error> {
        let version_index = version::get_version_index(proposed_version)
            .ok_or(Error::VERSION_NEGOTIATION_ERROR.with_reason("unsupported proposed version"))?;

        let mut tp = [0u8; quill_core::transport::parameters::MAX_ENCODED_LEN + 8];
        let mut encoder = EncoderBuffer::new(&mut tp);
        config
            .local_parameters
            .encode_client(proposed_version, &mut encoder);
        let tp_len = encoder.len();

        let tls = config.tls_context.new_session(tls::SessionParams {
            role: endpoint::Type::Client,
            server_name: Some(sni),
            alpn: Some(alpn),
            transport_parameters: &tp[..tp_len],
            session_ticket: offered_ticket.as_deref(),
            cookie: Default::default(),
        })?;

        let mut connection = Self::new_common(
            config,
            endpoint::Type::Client,
            tls,
            initial_cnx_id,
            peer_addr,
            proposed_version,
            version_index,
            now,
        )?;
        connection.state = State::ClientInit;
        connection.sni = Some(sni.to_string());
        connection.alpn = Some(alpn.to_string());
        connection.offered_ticket = offered_ticket;
        Ok(connection)
    }

    /// Creates a server connection for a freshly seen client initial
    pub fn new_server(
        config: ConnectionConfig,
        initial_cnx_id: ConnectionId,
        server_cnx_id: ConnectionId,
        peer_addr: SocketAddr,
        proposed_version: Version,
        now: Timestamp,
    ) -> Result<Self, Error> {
        let version_index = version::get_version_index(proposed_version)
            .ok_or(Error::VERSION_NEGOTIATION_ERROR.with_reason("unsupported proposed version"))?;

        let mut tp = [0u8; quill_core::transport::parameters::MAX_ENCODED_LEN + 64];
        let mut encoder = EncoderBuffer::new(&mut tp);
        let supported: Vec<Version> = version::SUPPORTED_VERSIONS
            .iter()
            .map(|parameters| parameters.version)
            .collect();
        config
            .local_parameters
            .encode_server(proposed_version, &supported, &mut encoder);
        let tp_len = encoder.len();

        let peer_addr_string = peer_addr.to_string();
        let tls = config.tls_context.new_session(tls::SessionParams {
            role: endpoint::Type::Server,
            server_name: None,
            alpn: None,
            transport_parameters: &tp[..tp_len],
            session_ticket: None,
            cookie: tls::CookieSettings {
                enforce: config.check_cookie,
                key: &config.retry_seed,
                additional_data: peer_addr_string.as_bytes(),
            },
        })?;

        let mut connection = Self::new_common(
            config,
            endpoint::Type::Server,
            tls,
            initial_cnx_id,
            peer_addr,
            proposed_version,
            version_index,
            now,
        )?;
        connection.state = State::ServerInit;
        connection.server_cnx_id = server_cnx_id;
        Ok(connection)
    }

    #[allow(clippy::too_many_arguments)]
    fn new_common(
        config: ConnectionConfig,
        role: endpoint::Type,
        tls: Box<dyn tls::Session>,
        initial_cnx_id: ConnectionId,
        peer_addr: SocketAddr,
        proposed_version: Version,
        version_index: usize,
        now: Timestamp,
    ) -> Result<Self, Error> {
        let salt = version::SUPPORTED_VERSIONS[version_index].salt;
        let cleartext = crypto::cleartext_phase(
            config.provider.as_ref(),
            salt,
            initial_cnx_id,
            role,
        )
        .map_err(|_| Error::INTERNAL_ERROR.with_reason("cleartext key derivation failed"))?;

        let local = config.local_parameters;

        Ok(Self {
            role,
            state: State::ClientInit,
            proposed_version,
            version_index,
            initial_cnx_id,
            server_cnx_id: ConnectionId::default(),
            peer_addr,
            start_time: now,
            sni: None,
            alpn: None,
            provider: config.provider,
            tls_context: config.tls_context,
            tls,
            handler: config.handler,
            offered_ticket: None,
            harvested_ticket: None,
            send_sequence: 0,
            send_mtu: INITIAL_SEND_MTU,
            cleartext: Some(cleartext),
            zero_rtt: None,
            one_rtt: None,
            zero_rtt_accepted: false,
            max_early_data_size: 0,
            retry_received: false,
            local_parameters: local,
            remote_parameters: None,
            sack: SackList::new(),
            largest_received: None,
            time_largest_received: now,
            highest_ack_sent: 0,
            highest_ack_time: now,
            ack_needed: false,
            eliciting_since_ack: 0,
            out_of_order_seen: false,
            ack_delay_local: recovery::rtt::ACK_DELAY_MAX,
            recovery: Recovery::new(),
            data_sent: 0,
            data_received: 0,
            maxdata_local: local.initial_max_data as u64,
            maxdata_remote: DEFAULT_0RTT_WINDOW,
            max_stream_id_bidir_local: local.initial_max_stream_id_bidir as u64,
            max_stream_id_unidir_local: local.initial_max_stream_id_unidir as u64,
            max_stream_id_bidir_remote: 0,
            max_stream_id_unidir_remote: 0,
            streams: StreamSet::new_with_handshake(),
            misc_frames: VecDeque::new(),
            retransmit_ready: VecDeque::new(),
            conn_blocked_at: None,
            local_error: None,
            remote_error: None,
            local_application_error: None,
            remote_application_error: None,
            close_frame: None,
            close_respond_needed: false,
            end_of_closing: None,
            peer_reset_tokens: Vec::new(),
            pending_stateless: None,
            latest_progress_time: now,
            next_wake_time: now,
        })
    }

    // === accessors ===

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn role(&self) -> endpoint::Type {
        self.role
    }

    #[inline]
    pub fn next_wake_time(&self) -> Timestamp {
        self.next_wake_time
    }

    #[inline]
    pub fn initial_cnx_id(&self) -> ConnectionId {
        self.initial_cnx_id
    }

    /// The server-chosen connection id, zero until learned
    #[inline]
    pub fn server_cnx_id(&self) -> ConnectionId {
        self.server_cnx_id
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn zero_rtt_accepted(&self) -> bool {
        self.zero_rtt_accepted
    }

    /// The local transport error that closed the connection, if any
    #[inline]
    pub fn local_error(&self) -> Option<Error> {
        self.local_error
    }

    /// The transport error code the peer closed with, if any
    #[inline]
    pub fn remote_error(&self) -> Option<u16> {
        self.remote_error
    }

    /// The application error codes exchanged at close, (local, remote)
    #[inline]
    pub fn application_errors(&self) -> (Option<u16>, Option<u16>) {
        (self.local_application_error, self.remote_application_error)
    }

    #[inline]
    pub fn negotiated_version(&self) -> Version {
        version::SUPPORTED_VERSIONS[self.version_index].version
    }

    /// A ticket issued during this connection, handed to the context's
    /// store together with the SNI/ALPN it is bound to
    pub fn harvest_ticket(&mut self) -> Option<(String, String, Vec<u8>)> {
        let ticket = self.harvested_ticket.take()?;
        Some((
            self.sni.clone().unwrap_or_default(),
            self.alpn.clone().unwrap_or_default(),
            ticket,
        ))
    }

    // === application surface ===

    /// Starts the client handshake: runs the first TLS flight onto
    /// stream 0 and arms 0-RTT keys when a ticket allows it
    pub fn start(&mut self, now: Timestamp) -> Result<(), Error> {
        debug_assert!(self.role.is_client());
        debug_assert_eq!(self.state, State::ClientInit);

        self.drive_tls(&[], now)?;

        if self.offered_ticket.is_some() {
            self.max_early_data_size = self.tls.max_early_data_size();
            if let Ok(secret) = self.tls.export_secret(crypto::label::EXPORTER_0RTT, true) {
                self.zero_rtt =
                    KeyPhase::from_shared_secret(self.provider.as_ref(), &secret).ok();
            }
            if self.zero_rtt.is_some() {
                // stream limits remembered from the resumed session; the
                // server's fresh parameters replace these at completion
                self.max_stream_id_bidir_remote =
                    self.local_parameters.initial_max_stream_id_bidir as u64;
                self.max_stream_id_unidir_remote =
                    self.local_parameters.initial_max_stream_id_unidir as u64;
            }
        }

        self.reschedule(now);
        Ok(())
    }

    /// Queues application data. Streams are created on first use, gated
    /// by the peer's advertised stream-id limit.
    pub fn add_to_stream(
        &mut self,
        stream_id: StreamId,
        data: &[u8],
        fin: bool,
        now: Timestamp,
    ) -> Result<(), Error> {
        if self.state.is_closing() || self.state.is_disconnected() {
            return Err(Error::NO_ERROR.with_reason("connection closed"));
        }
        if stream_id.is_handshake() {
            return Err(Error::STREAM_ID_ERROR.with_reason("stream 0 is reserved"));
        }

        let limit = self.stream_id_limit_for(stream_id);
        let maxdata_local = self.local_parameters.initial_max_stream_data as u64;
        let maxdata_remote = self
            .remote_parameters
            .map(|parameters| parameters.initial_max_stream_data as u64)
            // before the peer's parameters arrive, only the 0-RTT window
            // from a resumed session justifies optimism
            .unwrap_or(self.max_early_data_size as u64);

        let stream =
            self.streams
                .find_or_create(stream_id, |_| limit, maxdata_local, maxdata_remote)?;
        stream.enqueue_send(data, fin)?;
        self.reschedule(now);
        Ok(())
    }

    /// Abruptly terminates the sending side of a stream
    pub fn reset_stream(
        &mut self,
        stream_id: StreamId,
        error_code: u16,
        now: Timestamp,
    ) -> Result<(), Error> {
        let stream = self
            .streams
            .find(stream_id)
            .ok_or(Error::STREAM_ID_ERROR.with_reason("unknown stream"))?;
        stream.local_error = error_code;
        stream.flags.set_reset_requested();
        self.reschedule(now);
        Ok(())
    }

    /// Asks the peer to stop sending on a stream
    pub fn stop_sending(
        &mut self,
        stream_id: StreamId,
        error_code: u16,
        now: Timestamp,
    ) -> Result<(), Error> {
        let stream = self
            .streams
            .find(stream_id)
            .ok_or(Error::STREAM_ID_ERROR.with_reason("unknown stream"))?;
        stream.local_stop_error = error_code;
        stream.flags.set_stop_sending_requested();
        self.reschedule(now);
        Ok(())
    }

    /// Starts an orderly local close
    pub fn close(&mut self, application_error: Option<u16>, now: Timestamp) {
        if self.state.is_closing() || self.state.is_disconnected() {
            return;
        }
        match application_error {
            Some(code) => {
                self.local_application_error = Some(code);
                self.queue_close_frame(Frame::ApplicationClose(frame::ApplicationClose {
                    error_code: code,
                    reason: b"",
                }));
            }
            None => {
                self.queue_close_frame(Frame::ConnectionClose(frame::ConnectionClose {
                    error_code: Error::NO_ERROR.code,
                    reason: b"",
                }));
            }
        }
        self.state = State::Disconnecting;
        self.reschedule(now);
    }

    /// Records a local protocol error: the close frame is queued and the
    /// connection is headed for `disconnected`
    pub(crate) fn connection_error(&mut self, error: Error, now: Timestamp) {
        if self.state.is_closing() || self.state.is_disconnected() {
            return;
        }
        debug!(code = error.code, reason = error.reason, "local transport error");
        self.local_error = Some(error);
        self.queue_close_frame(Frame::ConnectionClose(frame::ConnectionClose {
            error_code: error.code,
            reason: error.reason.as_bytes(),
        }));
        self.state = State::Disconnecting;
        self.handler
            .borrow_mut()
            .on_close(CloseReason::Local(error.code));
        self.reschedule(now);
    }

    fn queue_close_frame(&mut self, frame: Frame) {
        let mut bytes = [0u8; 256];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&frame);
        let len = encoder.len();
        self.close_frame = Some(bytes[..len].to_vec());
    }

    /// Queues a PING probe; the peer answers with a PONG echoing `data`
    pub fn ping(&mut self, data: &[u8], now: Timestamp) {
        debug_assert!(data.len() <= u8::MAX as usize);
        let frame = Frame::Ping(frame::Ping { data });
        let mut bytes = [0u8; 300];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&frame);
        let len = encoder.len();
        self.misc_frames.push_back(bytes[..len].to_vec());
        self.reschedule(now);
    }

    /// Queues a NEW_CONNECTION_ID announcement
    pub fn queue_new_connection_id(
        &mut self,
        sequence: u64,
        cnx_id: ConnectionId,
        reset_token: ResetToken,
    ) {
        let frame = Frame::NewConnectionId(frame::NewConnectionId {
            sequence: VarInt::new(sequence).unwrap_or(VarInt::ZERO),
            cnx_id,
            reset_token: *reset_token.as_bytes(),
        });
        let mut bytes = [0u8; 64];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&frame);
        let len = encoder.len();
        self.misc_frames.push_back(bytes[..len].to_vec());
    }

    // === helpers ===

    fn stream_id_limit_for(&self, stream_id: StreamId) -> u64 {
        let locally_initiated = stream_id.initiator() == self.role;
        match (locally_initiated, stream_id.is_bidirectional()) {
            (true, true) => self.max_stream_id_bidir_remote,
            (true, false) => self.max_stream_id_unidir_remote,
            (false, true) => self.max_stream_id_bidir_local,
            (false, false) => self.max_stream_id_unidir_local,
        }
    }

    fn keys_for(&self, epoch: Epoch) -> Option<&KeyPhase> {
        match epoch {
            Epoch::Cleartext => self.cleartext.as_ref(),
            Epoch::ZeroRtt => self.zero_rtt.as_ref(),
            Epoch::OneRtt => self.one_rtt.as_ref(),
        }
    }

    fn effective_idle_timeout(&self) -> Duration {
        let mut seconds = self.local_parameters.idle_timeout;
        if let Some(remote) = &self.remote_parameters {
            seconds = seconds.min(remote.idle_timeout);
        }
        Duration::from_secs(seconds as u64).min(MICROSEC_SILENCE_MAX)
    }

    /// The connection id the peer expects in our short headers
    fn send_cnx_id(&self) -> ConnectionId {
        if self.server_cnx_id.is_zero() {
            self.initial_cnx_id
        } else {
            self.server_cnx_id
        }
    }

    fn omit_cnx_id(&self) -> bool {
        self.remote_parameters
            .map(|parameters| parameters.omit_connection_id)
            .unwrap_or(false)
    }
}

mod io;
mod send;
