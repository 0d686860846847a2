// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The process-wide endpoint context.
//!
//! One [`Quic`] instance serves one role. It owns the connection table
//! (indexed by connection id and by peer address), the queue of stateless
//! packets, the ticket store and the seeds for stateless-reset tokens and
//! retry cookies. Connections live in an arena of stable indices; the
//! wake order is resolved by scanning, the population is small.

use crate::{
    connection::{ApplicationHandler, Connection, ConnectionConfig, Handler},
    recovery,
    ticket::TicketStore,
};
use core::time::Duration;
use hashbrown::HashMap;
use quill_codec::{Encoder, EncoderBuffer};
use quill_core::{
    connection_id::ConnectionId,
    crypto::{self, tls},
    endpoint,
    packet::{self, Header, PacketType},
    random,
    stream::StreamId,
    time::Timestamp,
    transport::{parameters::Parameters, Error},
    version::{self, Version},
};
use std::{cell::RefCell, collections::VecDeque, net::SocketAddr, rc::Rc};
use tracing::{debug, trace};

pub const RESET_SECRET_SIZE: usize = 16;
pub const RETRY_SECRET_SIZE: usize = 64;
/// How long newly stored session tickets stay valid
const TICKET_LIFETIME: Duration = Duration::from_secs(100_000);

/// A packet not tied to any connection: version negotiation, stateless
/// retry, stateless reset
#[derive(Debug)]
pub struct StatelessPacket {
    pub bytes: Vec<u8>,
    pub peer_addr: SocketAddr,
}

/// Role and policy knobs for a context
pub struct Config {
    pub role: endpoint::Type,
    pub local_parameters: Parameters,
    /// Require a retry cookie before accepting any client initial
    pub check_cookie: bool,
    /// Always assign a server-chosen connection id, even when the
    /// client's could be kept
    pub unconditional_cnx_id: bool,
    pub default_alpn: String,
}

impl Config {
    pub fn new(role: endpoint::Type) -> Self {
        Self {
            role,
            local_parameters: Parameters::default_for(role),
            check_cookie: false,
            unconditional_cnx_id: true,
            default_alpn: String::new(),
        }
    }
}

/// Handle to a connection owned by the context
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(usize);

pub struct Quic {
    config: Config,
    provider: Rc<dyn crypto::Provider>,
    tls_context: Rc<dyn tls::Context>,
    default_handler: Handler,
    reset_seed: [u8; RESET_SECRET_SIZE],
    retry_seed: [u8; RETRY_SECRET_SIZE],
    rng: random::Generator,
    /// Optional override of the server-chosen connection id
    cnx_id_callback: Option<Box<dyn Fn(ConnectionId) -> ConnectionId>>,

    connections: Vec<Option<Connection>>,
    by_id: HashMap<u64, usize>,
    by_addr: HashMap<SocketAddr, usize>,
    stateless: VecDeque<StatelessPacket>,
    pub tickets: TicketStore,
}

impl Quic {
    pub fn new(
        config: Config,
        provider: Rc<dyn crypto::Provider>,
        tls_context: Rc<dyn tls::Context>,
        default_handler: Rc<RefCell<dyn ApplicationHandler>>,
    ) -> Self {
        let mut reset_seed = [0u8; RESET_SECRET_SIZE];
        provider.fill_random(&mut reset_seed);
        let mut retry_seed = [0u8; RETRY_SECRET_SIZE];
        provider.fill_random(&mut retry_seed);
        let mut rng_seed = [0u8; 128];
        provider.fill_random(&mut rng_seed);

        Self {
            config,
            provider,
            tls_context,
            default_handler,
            reset_seed,
            retry_seed,
            rng: random::Generator::new(rng_seed),
            cnx_id_callback: None,
            connections: Vec::new(),
            by_id: HashMap::new(),
            by_addr: HashMap::new(),
            stateless: VecDeque::new(),
            tickets: TicketStore::new(),
        }
    }

    /// Installs a callback customizing server-chosen connection ids
    pub fn set_cnx_id_callback(
        &mut self,
        callback: impl Fn(ConnectionId) -> ConnectionId + 'static,
    ) {
        self.cnx_id_callback = Some(Box::new(callback));
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            role: self.config.role,
            provider: self.provider.clone(),
            tls_context: self.tls_context.clone(),
            handler: self.default_handler.clone(),
            local_parameters: self.config.local_parameters,
            check_cookie: self.config.check_cookie,
            retry_seed: self.retry_seed,
        }
    }

    fn insert_connection(&mut self, connection: Connection) -> ConnectionHandle {
        let index = self
            .connections
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.connections.push(None);
                self.connections.len() - 1
            });

        let initial_id = connection.initial_cnx_id;
        let server_id = connection.server_cnx_id;
        let peer_addr = connection.peer_addr;
        self.connections[index] = Some(connection);
        self.by_id.insert(initial_id.as_u64(), index);
        if !server_id.is_zero() {
            self.by_id.insert(server_id.as_u64(), index);
        }
        self.by_addr.insert(peer_addr, index);
        ConnectionHandle(index)
    }

    /// Creates and starts a client connection
    pub fn create_client_connection(
        &mut self,
        peer_addr: SocketAddr,
        sni: &str,
        alpn: &str,
        proposed_version: Version,
        now: Timestamp,
    ) -> Result<ConnectionHandle, Error> {
        debug_assert!(self.config.role.is_client());

        let alpn = if alpn.is_empty() {
            self.config.default_alpn.clone()
        } else {
            alpn.to_string()
        };
        let alpn = alpn.as_str();

        let initial_cnx_id = ConnectionId::new(self.rng.next_non_zero_u64());
        let ticket = self
            .tickets
            .get(sni, alpn, now)
            .map(|stored| stored.ticket.clone());

        let mut connection = Connection::new_client(
            self.connection_config(),
            initial_cnx_id,
            peer_addr,
            sni,
            alpn,
            proposed_version,
            ticket,
            now,
        )?;
        connection.start(now)?;

        debug!(cnx_id = %initial_cnx_id, "client connection created");
        Ok(self.insert_connection(connection))
    }

    pub fn connection_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        self.connections.get_mut(handle.0)?.as_mut()
    }

    pub fn connection(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.connections.get(handle.0)?.as_ref()
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.iter().flatten().count()
    }

    /// Handles of every live connection
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .enumerate()
            .filter(|(_, connection)| connection.is_some())
            .map(|(index, _)| ConnectionHandle(index))
            .collect()
    }

    // === inbound path ===

    /// Routes one received datagram
    pub fn incoming(&mut self, datagram: &[u8], peer_addr: SocketAddr, now: Timestamp) {
        let header = match Header::parse(datagram, datagram.len(), self.config.role) {
            Ok(header) => header,
            Err(error) => {
                trace!(reason = error.reason, "dropping unparseable datagram");
                return;
            }
        };

        // locate the connection: by id, else by address
        let mut index = if header.cnx_id_present {
            self.by_id.get(&header.cnx_id.as_u64()).copied()
        } else {
            None
        };
        if index.is_none() {
            index = self.by_addr.get(&peer_addr).copied();
        }

        let index = match index {
            Some(index) => index,
            None => {
                self.handle_unmatched(datagram, &header, peer_addr, now);
                return;
            }
        };

        if let Some(connection) = self.connections[index].as_mut() {
            connection.incoming_packet(datagram, header, now);
        }
        self.after_connection_activity(index, now);
    }

    /// A datagram matching no connection: accept, negotiate, or reset
    fn handle_unmatched(
        &mut self,
        datagram: &[u8],
        header: &Header,
        peer_addr: SocketAddr,
        now: Timestamp,
    ) {
        if self.config.role.is_server() && header.ptype == PacketType::ClientInitial {
            if header.version_index.is_none() {
                self.queue_version_negotiation(header, peer_addr);
                return;
            }

            let random_id = ConnectionId::new(self.rng.next_non_zero_u64());
            let proposed = match &self.cnx_id_callback {
                Some(callback) => callback(random_id),
                None => random_id,
            };
            let server_cnx_id = if self.config.unconditional_cnx_id {
                proposed
            } else {
                header.cnx_id
            };

            match Connection::new_server(
                self.connection_config(),
                header.cnx_id,
                server_cnx_id,
                peer_addr,
                header.version,
                now,
            ) {
                Ok(connection) => {
                    debug!(cnx_id = %header.cnx_id, "server connection accepted");
                    let handle = self.insert_connection(connection);
                    let index = handle.0;
                    if let Some(connection) = self.connections[index].as_mut() {
                        connection.incoming_packet(datagram, header.clone(), now);
                    }
                    self.after_connection_activity(index, now);
                }
                Err(error) => {
                    debug!(reason = error.reason, "failed to accept connection");
                }
            }
            return;
        }

        if !header.ptype.is_long() && header.cnx_id_present {
            // an unknown short-header packet earns a stateless reset
            self.queue_stateless_reset(header, peer_addr);
        }
    }

    fn queue_version_negotiation(&mut self, header: &Header, peer_addr: SocketAddr) {
        let mut bytes = vec![0u8; 17 + version::SUPPORTED_VERSIONS.len() * 4];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        let supported: Vec<Version> = version::SUPPORTED_VERSIONS
            .iter()
            .map(|parameters| parameters.version)
            .collect();
        packet::encode_version_negotiation(
            header.cnx_id,
            header.pn_truncated as u32,
            header.version,
            &supported,
            &mut encoder,
        );
        let len = encoder.len();
        bytes.truncate(len);

        debug!(version = header.version, "queueing version negotiation");
        self.stateless.push_back(StatelessPacket { bytes, peer_addr });
    }

    /// Stateless reset: a short header shape, filler, and the token
    /// derived from the reset seed and the unknown connection id
    fn queue_stateless_reset(&mut self, header: &Header, peer_addr: SocketAddr) {
        let token = self.provider.reset_token(&self.reset_seed, header.cnx_id);

        let mut bytes = Vec::with_capacity(64);
        bytes.push(0x41);
        let mut filler = [0u8; 20];
        self.provider.fill_random(&mut filler);
        bytes.extend_from_slice(&filler);
        bytes.extend_from_slice(token.as_ref());

        trace!(cnx_id = %header.cnx_id, "queueing stateless reset");
        self.stateless.push_back(StatelessPacket { bytes, peer_addr });
    }

    /// Post-processing after any connection activity: index upkeep,
    /// ticket harvesting, retry emission, deferred destruction
    fn after_connection_activity(&mut self, index: usize, now: Timestamp) {
        let Some(connection) = self.connections[index].as_mut() else {
            return;
        };

        // the server id is learned mid-handshake on the client side
        if !connection.server_cnx_id.is_zero() {
            self.by_id
                .entry(connection.server_cnx_id.as_u64())
                .or_insert(index);
        }

        if let Some((sni, alpn, ticket)) = connection.harvest_ticket() {
            if self.config.role.is_client() {
                let valid_until = now + TICKET_LIFETIME;
                self.tickets.store(&sni, &alpn, ticket, valid_until);
            }
        }

        if let Some(bytes) = connection.pending_stateless.take() {
            let peer_addr = connection.peer_addr;
            self.stateless.push_back(StatelessPacket { bytes, peer_addr });
        }

        if connection.state().is_disconnected() {
            self.remove_connection(index);
        }
    }

    fn remove_connection(&mut self, index: usize) {
        let Some(connection) = self.connections[index].take() else {
            return;
        };
        debug!(cnx_id = %connection.initial_cnx_id, "connection removed");
        self.by_id.retain(|_, value| *value != index);
        self.by_addr.retain(|_, value| *value != index);
    }

    // === outbound path ===

    /// Produces the next datagram to transmit, if any is due at `now`.
    /// Stateless packets drain first, then the most urgent connection.
    pub fn prepare_next(&mut self, now: Timestamp) -> Option<(Vec<u8>, SocketAddr)> {
        if let Some(packet) = self.stateless.pop_front() {
            return Some((packet.bytes, packet.peer_addr));
        }

        let mut visited = Vec::new();
        loop {
            // most urgent connection first
            let mut best: Option<(usize, Timestamp)> = None;
            for (index, connection) in self.connections.iter().enumerate() {
                if visited.contains(&index) {
                    continue;
                }
                let Some(connection) = connection else {
                    continue;
                };
                let wake = connection.next_wake_time();
                if best.map_or(true, |(_, current)| wake < current) {
                    best = Some((index, wake));
                }
            }

            let (index, wake) = best?;
            if wake > now {
                return None;
            }
            visited.push(index);

            let mut buf = vec![0u8; recovery::MAX_PACKET_SIZE as usize];
            let (written, peer_addr) = {
                let Some(connection) = self.connections[index].as_mut() else {
                    continue;
                };
                let written = connection.prepare_packet(now, &mut buf);
                (written, connection.peer_addr)
            };
            self.after_connection_activity(index, now);

            // a retry might have been queued during preparation
            if let Some(packet) = self.stateless.pop_front() {
                return Some((packet.bytes, packet.peer_addr));
            }

            if written > 0 {
                buf.truncate(written);
                return Some((buf, peer_addr));
            }
        }
    }

    /// Earliest instant any connection wants to be polled again
    pub fn next_wake_time(&self) -> Option<Timestamp> {
        if !self.stateless.is_empty() {
            return Some(Timestamp::from_micros(0));
        }
        self.connections
            .iter()
            .flatten()
            .map(Connection::next_wake_time)
            .min()
    }

    /// Convenience for hosts: queue data on a stream of a connection
    pub fn add_to_stream(
        &mut self,
        handle: ConnectionHandle,
        stream_id: StreamId,
        data: &[u8],
        fin: bool,
        now: Timestamp,
    ) -> Result<(), Error> {
        let connection = self
            .connection_mut(handle)
            .ok_or(Error::NO_ERROR.with_reason("connection closed"))?;
        connection.add_to_stream(stream_id, data, fin, now)
    }
}
