// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The abstract TLS 1.3 provider.
//!
//! The transport drives the handshake record stream over stream 0 and
//! consumes the provider purely as a secret exporter: certificate
//! handling, alert processing and session tickets stay on the provider's
//! side of this interface.

use crate::{endpoint, transport};

/// Outcome of feeding handshake bytes to the session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The provider needs more input; not a suspension point, control
    /// returns to the caller until more stream-0 bytes arrive
    InProgress,
    /// The handshake is complete and exporter secrets are available
    Complete,
    /// The server refused the hello and produced a retry; the output in
    /// the send buffer must ride a stateless retry packet
    HelloRetryRequest,
}

/// One TLS session, owned by a connection
pub trait Session {
    /// Feeds stream-0 octets to the handshake (or, once complete, to the
    /// post-handshake message stream). Provider output to transmit is
    /// appended to `sendbuf`.
    fn handshake(
        &mut self,
        input: &[u8],
        sendbuf: &mut Vec<u8>,
    ) -> Result<HandshakeStatus, transport::Error>;

    fn is_handshake_complete(&self) -> bool;

    /// TLS exporter interface; `early` selects the early-exporter master
    /// secret used for the 0-RTT label
    fn export_secret(&self, label: &str, early: bool) -> Result<Vec<u8>, super::Error>;

    fn negotiated_alpn(&self) -> Option<String>;

    fn server_name(&self) -> Option<String>;

    fn is_psk_handshake(&self) -> bool;

    /// The raw transport-parameter extension body received from the peer,
    /// once the carrying handshake message has been processed
    fn peer_transport_parameters(&self) -> Option<Vec<u8>>;

    /// Whether the peer accepted early data (client side, after the
    /// server's first flight)
    fn early_data_accepted(&self) -> bool;

    /// Maximum early data the server advertised for the presented ticket
    fn max_early_data_size(&self) -> usize;

    /// Takes a freshly issued session ticket, if the provider produced
    /// one. The transport stores it in the context ticket store.
    fn take_new_ticket(&mut self) -> Option<Vec<u8>>;
}

/// Server-side retry-cookie settings, signed with the context retry seed
/// over the client address
#[derive(Clone, Copy, Debug, Default)]
pub struct CookieSettings<'a> {
    pub enforce: bool,
    pub key: &'a [u8],
    pub additional_data: &'a [u8],
}

/// Parameters for creating a session
#[derive(Debug)]
pub struct SessionParams<'a> {
    pub role: endpoint::Type,
    pub server_name: Option<&'a str>,
    pub alpn: Option<&'a str>,
    /// Our transport-parameter extension body
    pub transport_parameters: &'a [u8],
    /// Client only: a stored session ticket enabling resumption and 0-RTT
    pub session_ticket: Option<&'a [u8]>,
    pub cookie: CookieSettings<'a>,
}

/// The process-wide TLS context (certificates, ticket keys, ALPN policy)
pub trait Context {
    fn new_session(&self, params: SessionParams) -> Result<Box<dyn Session>, transport::Error>;
}
