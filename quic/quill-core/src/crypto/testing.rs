// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic crypto and TLS implementations for tests.
//!
//! The fake handshake exchanges tiny framed messages over stream 0 and
//! derives secrets from a running transcript hash, so both endpoints of a
//! simulated connection converge on the same keys without touching a real
//! TLS stack. The AEAD is a keyed XOR stream with a 64-bit checksum tag:
//! worthless as cryptography, but it fails loudly whenever the two sides
//! disagree on keys, sequence numbers or additional data.

use crate::{
    connection_id::{ConnectionId, ResetToken},
    crypto::{self, tls, Error, Key},
    endpoint,
    transport,
};
use core::cell::Cell;

fn fnv64(chunks: &[&[u8]]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for chunk in chunks {
        for byte in *chunk {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

fn expand_secret(label: &str, material: &[u8]) -> Vec<u8> {
    let mut secret = Vec::with_capacity(32);
    for counter in 0u8..4 {
        let word = fnv64(&[label.as_bytes(), material, &[counter]]);
        secret.extend_from_slice(&word.to_be_bytes());
    }
    secret
}

// === AEAD ===

const TAG_LEN: usize = 8;

#[derive(Debug)]
pub struct XorKey {
    secret: Vec<u8>,
}

impl XorKey {
    fn keystream_byte(&self, seq: u64, index: usize) -> u8 {
        let word = fnv64(&[&self.secret, &seq.to_be_bytes(), &(index as u64).to_be_bytes()]);
        (word & 0xff) as u8
    }

    fn tag(&self, seq: u64, aad: &[u8], ciphertext: &[u8]) -> [u8; TAG_LEN] {
        fnv64(&[&self.secret, &seq.to_be_bytes(), aad, ciphertext]).to_be_bytes()
    }
}

impl Key for XorKey {
    fn encrypt(
        &self,
        seq: u64,
        aad: &[u8],
        payload: &[u8],
        output: &mut [u8],
    ) -> Result<usize, Error> {
        let total = payload.len() + TAG_LEN;
        if output.len() < total {
            return Err(Error::new("encrypt output buffer too small"));
        }
        for (index, byte) in payload.iter().enumerate() {
            output[index] = byte ^ self.keystream_byte(seq, index);
        }
        let tag = self.tag(seq, aad, &output[..payload.len()]);
        output[payload.len()..total].copy_from_slice(&tag);
        Ok(total)
    }

    fn decrypt(
        &self,
        seq: u64,
        aad: &[u8],
        payload: &[u8],
        output: &mut [u8],
    ) -> Result<usize, Error> {
        let text_len = payload.len().checked_sub(TAG_LEN).ok_or(Error::DECRYPT_ERROR)?;
        let (ciphertext, tag) = payload.split_at(text_len);
        if self.tag(seq, aad, ciphertext)[..] != *tag {
            return Err(Error::DECRYPT_ERROR);
        }
        if output.len() < text_len {
            return Err(Error::new("decrypt output buffer too small"));
        }
        for (index, byte) in ciphertext.iter().enumerate() {
            output[index] = byte ^ self.keystream_byte(seq, index);
        }
        Ok(text_len)
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }
}

// === Provider ===

#[derive(Debug, Default)]
pub struct Provider {
    random_counter: Cell<u64>,
}

impl Provider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl crypto::Provider for Provider {
    fn cleartext_secrets(
        &self,
        salt: &[u8],
        cnx_id: ConnectionId,
    ) -> Result<(Vec<u8>, Vec<u8>), Error> {
        let id = cnx_id.to_bytes();
        let material: Vec<u8> = salt.iter().chain(id.iter()).copied().collect();
        Ok((
            expand_secret(crypto::label::HANDSHAKE_CLIENT, &material),
            expand_secret(crypto::label::HANDSHAKE_SERVER, &material),
        ))
    }

    fn key_from_secret(&self, secret: &[u8]) -> Result<Box<dyn Key>, Error> {
        Ok(Box::new(XorKey {
            secret: secret.to_vec(),
        }))
    }

    fn reset_token(&self, seed: &[u8; 16], cnx_id: ConnectionId) -> ResetToken {
        let id = cnx_id.to_bytes();
        let high = fnv64(&[seed, &id, b"high"]);
        let low = fnv64(&[seed, &id, b"low"]);
        let mut token = [0u8; ResetToken::LEN];
        token[..8].copy_from_slice(&high.to_be_bytes());
        token[8..].copy_from_slice(&low.to_be_bytes());
        ResetToken::new(token)
    }

    fn fill_random(&self, dest: &mut [u8]) {
        for byte in dest {
            let counter = self.random_counter.get().wrapping_add(1);
            self.random_counter.set(counter);
            *byte = (fnv64(&[&counter.to_be_bytes()]) & 0xff) as u8;
        }
    }
}

// === Fake TLS ===

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_RETRY: u8 = 3;
const MSG_FINISHED: u8 = 4;

const COOKIE_LEN: usize = 8;
const EARLY_DATA_WINDOW: usize = 4_096;

fn cookie_for(key: &[u8], additional_data: &[u8]) -> [u8; COOKIE_LEN] {
    fnv64(&[key, additional_data, b"cookie"]).to_be_bytes()
}

/// Process-wide fake TLS configuration
#[derive(Debug)]
pub struct Context {
    pub accept_early_data: bool,
    ticket_sequence: Cell<u64>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            accept_early_data: true,
            ticket_sequence: Cell::new(1),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl tls::Context for Context {
    fn new_session(
        &self,
        params: tls::SessionParams,
    ) -> Result<Box<dyn tls::Session>, transport::Error> {
        let ticket_sequence = self.ticket_sequence.get();
        self.ticket_sequence.set(ticket_sequence + 1);

        Ok(Box::new(Session {
            role: params.role,
            server_name: params.server_name.map(str::to_string),
            alpn: params.alpn.map(str::to_string),
            transport_parameters: params.transport_parameters.to_vec(),
            offered_ticket: params.session_ticket.map(<[u8]>::to_vec),
            enforce_cookie: params.cookie.enforce,
            cookie_key: params.cookie.key.to_vec(),
            cookie_additional_data: params.cookie.additional_data.to_vec(),
            accept_early_data: self.accept_early_data,
            ticket_sequence,
            inbuf: Vec::new(),
            transcript: 0,
            sent_hello: false,
            retry_cookie: None,
            peer_transport_parameters: None,
            new_ticket: None,
            complete: false,
            early_accepted: false,
            psk: false,
        }))
    }
}

pub struct Session {
    role: endpoint::Type,
    server_name: Option<String>,
    alpn: Option<String>,
    transport_parameters: Vec<u8>,
    offered_ticket: Option<Vec<u8>>,
    enforce_cookie: bool,
    cookie_key: Vec<u8>,
    cookie_additional_data: Vec<u8>,
    accept_early_data: bool,
    ticket_sequence: u64,

    inbuf: Vec<u8>,
    transcript: u64,
    sent_hello: bool,
    retry_cookie: Option<[u8; COOKIE_LEN]>,
    peer_transport_parameters: Option<Vec<u8>>,
    new_ticket: Option<Vec<u8>>,
    complete: bool,
    early_accepted: bool,
    psk: bool,
}

impl Session {
    fn push_message(sendbuf: &mut Vec<u8>, kind: u8, body: &[u8]) {
        sendbuf.push(kind);
        sendbuf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        sendbuf.extend_from_slice(body);
    }

    fn client_hello_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self.retry_cookie {
            Some(cookie) => {
                body.push(1);
                body.extend_from_slice(&cookie);
            }
            None => body.push(0),
        }

        let ticket = self.offered_ticket.as_deref().unwrap_or(&[]);
        body.extend_from_slice(&(ticket.len() as u16).to_be_bytes());
        body.extend_from_slice(ticket);

        let sni = self.server_name.as_deref().unwrap_or("");
        body.push(sni.len() as u8);
        body.extend_from_slice(sni.as_bytes());

        let alpn = self.alpn.as_deref().unwrap_or("");
        body.push(alpn.len() as u8);
        body.extend_from_slice(alpn.as_bytes());

        body.extend_from_slice(&(self.transport_parameters.len() as u16).to_be_bytes());
        body.extend_from_slice(&self.transport_parameters);
        body
    }

    fn server_hello_body(&self, ticket: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(self.early_accepted as u8);
        body.extend_from_slice(&(self.transport_parameters.len() as u16).to_be_bytes());
        body.extend_from_slice(&self.transport_parameters);
        body.extend_from_slice(&(ticket.len() as u16).to_be_bytes());
        body.extend_from_slice(ticket);
        body
    }

    fn issue_ticket(&self) -> Vec<u8> {
        // 64-bit sequence, then the PSK cipher suite at offset 8
        let mut ticket = Vec::new();
        ticket.extend_from_slice(&self.ticket_sequence.to_be_bytes());
        ticket.extend_from_slice(&0x1301u16.to_be_bytes());
        ticket.extend_from_slice(self.server_name.as_deref().unwrap_or("").as_bytes());
        ticket
    }

    /// Pops one complete framed message from the input buffer
    fn next_message(&mut self) -> Option<(u8, Vec<u8>)> {
        if self.inbuf.len() < 3 {
            return None;
        }
        let len = u16::from_be_bytes([self.inbuf[1], self.inbuf[2]]) as usize;
        if self.inbuf.len() < 3 + len {
            return None;
        }
        let kind = self.inbuf[0];
        let body = self.inbuf[3..3 + len].to_vec();
        self.inbuf.drain(..3 + len);
        Some((kind, body))
    }

    fn client_step(&mut self, sendbuf: &mut Vec<u8>) -> Result<tls::HandshakeStatus, transport::Error> {
        if !self.sent_hello {
            let body = self.client_hello_body();
            self.transcript = fnv64(&[&self.transcript.to_be_bytes(), &body]);
            Self::push_message(sendbuf, MSG_CLIENT_HELLO, &body);
            self.sent_hello = true;
            self.psk = self.offered_ticket.is_some();
            return Ok(tls::HandshakeStatus::InProgress);
        }

        while let Some((kind, body)) = self.next_message() {
            match kind {
                MSG_RETRY => {
                    if self.retry_cookie.is_some() {
                        return Err(transport::Error::TLS_HANDSHAKE_FAILED
                            .with_reason("second retry"));
                    }
                    let cookie = body
                        .get(..COOKIE_LEN)
                        .and_then(|cookie| <[u8; COOKIE_LEN]>::try_from(cookie).ok())
                        .ok_or(transport::Error::TLS_HANDSHAKE_FAILED)?;
                    self.retry_cookie = Some(cookie);
                    // the transport resets stream 0 before resending;
                    // rebuild the hello with the cookie attached
                    self.transcript = 0;
                    let body = self.client_hello_body();
                    self.transcript = fnv64(&[&self.transcript.to_be_bytes(), &body]);
                    Self::push_message(sendbuf, MSG_CLIENT_HELLO, &body);
                }
                MSG_SERVER_HELLO => {
                    let buffer = quill_codec::DecoderBuffer::new(&body);
                    let (early, buffer) = buffer
                        .decode::<u8>()
                        .map_err(|_| transport::Error::TLS_HANDSHAKE_FAILED)?;
                    let (tp, buffer) = buffer
                        .decode_slice_with_len_prefix::<u16>()
                        .map_err(|_| transport::Error::TLS_HANDSHAKE_FAILED)?;
                    let (ticket, _) = buffer
                        .decode_slice_with_len_prefix::<u16>()
                        .map_err(|_| transport::Error::TLS_HANDSHAKE_FAILED)?;

                    self.early_accepted = early != 0;
                    self.peer_transport_parameters =
                        Some(tp.into_less_safe_slice().to_vec());
                    let ticket = ticket.into_less_safe_slice();
                    if !ticket.is_empty() {
                        self.new_ticket = Some(ticket.to_vec());
                    }
                    self.transcript = fnv64(&[&self.transcript.to_be_bytes(), &body]);
                    self.complete = true;
                    Self::push_message(sendbuf, MSG_FINISHED, &[]);
                    return Ok(tls::HandshakeStatus::Complete);
                }
                _ => {
                    return Err(
                        transport::Error::TLS_HANDSHAKE_FAILED.with_reason("unexpected message")
                    )
                }
            }
        }

        Ok(tls::HandshakeStatus::InProgress)
    }

    fn server_step(&mut self, sendbuf: &mut Vec<u8>) -> Result<tls::HandshakeStatus, transport::Error> {
        while let Some((kind, body)) = self.next_message() {
            match kind {
                MSG_CLIENT_HELLO => {
                    let buffer = quill_codec::DecoderBuffer::new(&body);
                    let (cookie_present, buffer) = buffer
                        .decode::<u8>()
                        .map_err(|_| transport::Error::TLS_HANDSHAKE_FAILED)?;
                    let (cookie, buffer) = if cookie_present != 0 {
                        let (cookie, buffer) = buffer
                            .decode_slice(COOKIE_LEN)
                            .map_err(|_| transport::Error::TLS_HANDSHAKE_FAILED)?;
                        (Some(cookie.into_less_safe_slice().to_vec()), buffer)
                    } else {
                        (None, buffer)
                    };

                    let expected = cookie_for(&self.cookie_key, &self.cookie_additional_data);
                    if self.enforce_cookie && cookie.as_deref() != Some(&expected[..]) {
                        Self::push_message(sendbuf, MSG_RETRY, &expected);
                        return Ok(tls::HandshakeStatus::HelloRetryRequest);
                    }

                    let (ticket, buffer) = buffer
                        .decode_slice_with_len_prefix::<u16>()
                        .map_err(|_| transport::Error::TLS_HANDSHAKE_FAILED)?;
                    let (sni, buffer) = buffer
                        .decode_slice_with_len_prefix::<u8>()
                        .map_err(|_| transport::Error::TLS_HANDSHAKE_FAILED)?;
                    let (alpn, buffer) = buffer
                        .decode_slice_with_len_prefix::<u8>()
                        .map_err(|_| transport::Error::TLS_HANDSHAKE_FAILED)?;
                    let (tp, _) = buffer
                        .decode_slice_with_len_prefix::<u16>()
                        .map_err(|_| transport::Error::TLS_HANDSHAKE_FAILED)?;

                    let ticket = ticket.into_less_safe_slice();
                    self.psk = !ticket.is_empty();
                    if self.psk {
                        self.offered_ticket = Some(ticket.to_vec());
                    }
                    self.early_accepted = self.psk && self.accept_early_data;
                    self.server_name =
                        String::from_utf8(sni.into_less_safe_slice().to_vec()).ok();
                    self.alpn =
                        String::from_utf8(alpn.into_less_safe_slice().to_vec()).ok();
                    self.peer_transport_parameters =
                        Some(tp.into_less_safe_slice().to_vec());

                    self.transcript = fnv64(&[&self.transcript.to_be_bytes(), &body]);

                    let ticket = self.issue_ticket();
                    let reply = self.server_hello_body(&ticket);
                    self.transcript = fnv64(&[&self.transcript.to_be_bytes(), &reply]);
                    Self::push_message(sendbuf, MSG_SERVER_HELLO, &reply);
                    self.complete = true;
                    return Ok(tls::HandshakeStatus::Complete);
                }
                MSG_FINISHED => {
                    // post-handshake confirmation, nothing to answer
                }
                _ => {
                    return Err(
                        transport::Error::TLS_HANDSHAKE_FAILED.with_reason("unexpected message")
                    )
                }
            }
        }

        Ok(tls::HandshakeStatus::InProgress)
    }
}

impl tls::Session for Session {
    fn handshake(
        &mut self,
        input: &[u8],
        sendbuf: &mut Vec<u8>,
    ) -> Result<tls::HandshakeStatus, transport::Error> {
        self.inbuf.extend_from_slice(input);
        let status = match self.role {
            endpoint::Type::Client => self.client_step(sendbuf)?,
            endpoint::Type::Server => self.server_step(sendbuf)?,
        };
        if self.complete && status == tls::HandshakeStatus::InProgress {
            return Ok(tls::HandshakeStatus::Complete);
        }
        Ok(status)
    }

    fn is_handshake_complete(&self) -> bool {
        self.complete
    }

    fn export_secret(&self, label: &str, early: bool) -> Result<Vec<u8>, Error> {
        if early {
            let ticket = self
                .offered_ticket
                .as_deref()
                .ok_or(Error::new("no early secret without a ticket"))?;
            Ok(expand_secret(label, ticket))
        } else {
            if !self.complete {
                return Err(Error::new("exporter not available before completion"));
            }
            Ok(expand_secret(label, &self.transcript.to_be_bytes()))
        }
    }

    fn negotiated_alpn(&self) -> Option<String> {
        self.alpn.clone()
    }

    fn server_name(&self) -> Option<String> {
        self.server_name.clone()
    }

    fn is_psk_handshake(&self) -> bool {
        self.psk
    }

    fn peer_transport_parameters(&self) -> Option<Vec<u8>> {
        self.peer_transport_parameters.clone()
    }

    fn early_data_accepted(&self) -> bool {
        self.early_accepted
    }

    fn max_early_data_size(&self) -> usize {
        if self.psk {
            EARLY_DATA_WINDOW
        } else {
            0
        }
    }

    fn take_new_ticket(&mut self) -> Option<Vec<u8>> {
        self.new_ticket.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{label, tls::Context as _, Provider as _};

    #[test]
    fn aead_round_trip_test() {
        let provider = Provider::new();
        let key = provider.key_from_secret(b"secret").unwrap();
        let mut sealed = vec![0u8; 64];
        let len = key.encrypt(3, b"aad", b"payload", &mut sealed).unwrap();
        assert_eq!(len, 7 + TAG_LEN);

        let mut opened = vec![0u8; 64];
        let plain_len = key.decrypt(3, b"aad", &sealed[..len], &mut opened).unwrap();
        assert_eq!(&opened[..plain_len], b"payload");

        // wrong sequence number must fail authentication
        assert!(key.decrypt(4, b"aad", &sealed[..len], &mut opened).is_err());
        // and so must altered additional data
        assert!(key.decrypt(3, b"axd", &sealed[..len], &mut opened).is_err());
    }

    fn run_handshake(
        client: &mut Box<dyn tls::Session>,
        server: &mut Box<dyn tls::Session>,
    ) -> (tls::HandshakeStatus, tls::HandshakeStatus) {
        let mut client_status = tls::HandshakeStatus::InProgress;
        let mut server_status = tls::HandshakeStatus::InProgress;
        let mut to_server = Vec::new();
        client.handshake(&[], &mut to_server).unwrap();

        for _ in 0..4 {
            let mut to_client = Vec::new();
            server_status = server.handshake(&to_server, &mut to_client).unwrap();
            to_server = Vec::new();
            if to_client.is_empty() {
                break;
            }
            client_status = client.handshake(&to_client, &mut to_server).unwrap();
            if to_server.is_empty() {
                break;
            }
        }
        (client_status, server_status)
    }

    #[test]
    fn handshake_and_exporter_test() {
        let context = Context::new();
        let tp = [1u8, 2, 3];
        let mut client = context
            .new_session(tls::SessionParams {
                role: endpoint::Type::Client,
                server_name: Some("test.example.com"),
                alpn: Some("hq-08"),
                transport_parameters: &tp,
                session_ticket: None,
                cookie: Default::default(),
            })
            .unwrap();
        let mut server = context
            .new_session(tls::SessionParams {
                role: endpoint::Type::Server,
                server_name: None,
                alpn: None,
                transport_parameters: &[9, 9],
                session_ticket: None,
                cookie: Default::default(),
            })
            .unwrap();

        let (client_status, server_status) = run_handshake(&mut client, &mut server);
        assert_eq!(client_status, tls::HandshakeStatus::Complete);
        assert_eq!(server_status, tls::HandshakeStatus::Complete);
        assert!(client.is_handshake_complete());
        assert!(server.is_handshake_complete());
        assert_eq!(server.server_name().as_deref(), Some("test.example.com"));
        assert_eq!(client.peer_transport_parameters().as_deref(), Some(&[9u8, 9][..]));
        assert_eq!(server.peer_transport_parameters().as_deref(), Some(&tp[..]));

        // both ends export the same 1-RTT secrets
        let client_tx = client.export_secret(label::EXPORTER_1RTT_CLIENT, false).unwrap();
        let server_rx = server.export_secret(label::EXPORTER_1RTT_CLIENT, false).unwrap();
        assert_eq!(client_tx, server_rx);

        // the client walks away with a ticket
        assert!(client.take_new_ticket().is_some());
        assert!(client.take_new_ticket().is_none());
    }

    #[test]
    fn cookie_enforcement_test() {
        let context = Context::new();
        let key = [5u8; 8];
        let addr = b"192.0.2.1:4433";
        let mut client = context
            .new_session(tls::SessionParams {
                role: endpoint::Type::Client,
                server_name: Some("retry.example.com"),
                alpn: Some("hq-08"),
                transport_parameters: &[1],
                session_ticket: None,
                cookie: Default::default(),
            })
            .unwrap();
        let mut server = context
            .new_session(tls::SessionParams {
                role: endpoint::Type::Server,
                server_name: None,
                alpn: None,
                transport_parameters: &[2],
                session_ticket: None,
                cookie: tls::CookieSettings {
                    enforce: true,
                    key: &key,
                    additional_data: addr,
                },
            })
            .unwrap();

        let mut to_server = Vec::new();
        client.handshake(&[], &mut to_server).unwrap();

        let mut retry = Vec::new();
        let status = server.handshake(&to_server, &mut retry).unwrap();
        assert_eq!(status, tls::HandshakeStatus::HelloRetryRequest);

        // second hello carries the cookie and is accepted
        let mut to_server = Vec::new();
        client.handshake(&retry, &mut to_server).unwrap();
        let mut to_client = Vec::new();
        let status = server.handshake(&to_server, &mut to_client).unwrap();
        assert_eq!(status, tls::HandshakeStatus::Complete);
    }

    #[test]
    fn early_secret_test() {
        let context = Context::new();
        let ticket = [8u8; 24];
        let client = context
            .new_session(tls::SessionParams {
                role: endpoint::Type::Client,
                server_name: Some("0rtt.example.com"),
                alpn: Some("hq-08"),
                transport_parameters: &[1],
                session_ticket: Some(&ticket),
                cookie: Default::default(),
            })
            .unwrap();

        // available before any handshake flight
        let secret = client.export_secret(label::EXPORTER_0RTT, true).unwrap();
        assert_eq!(secret.len(), 32);
        assert_eq!(
            secret,
            expand_secret(label::EXPORTER_0RTT, &ticket)
        );
    }
}
