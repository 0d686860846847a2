// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Long and short packet header codecs.
//!
//! Packet types are nominal: the wire value depends on the negotiated
//! version's header-encoding family (a single family today, so the table
//! is small).

pub mod number;

use crate::{
    connection_id::ConnectionId,
    crypto::Epoch,
    endpoint,
    transport::Error,
    version::{self, Version},
};
use quill_codec::{DecoderBuffer, Encoder};

/// Datagrams carrying a client initial must be padded to at least this size
pub const ENFORCED_INITIAL_MIN_SIZE: usize = 1_200;

const FORM_LONG: u8 = 0x80;
const SHORT_CNX_ID_BIT: u8 = 0x40;
const SHORT_KEY_PHASE_BIT: u8 = 0x20;

/// Nominal packet types used internally; the wire encoding is
/// version-indexed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    VersionNegotiation,
    ClientInitial,
    ServerStateless,
    ServerCleartext,
    ClientCleartext,
    ZeroRttProtected,
    OneRttPhi0,
    OneRttPhi1,
}

impl PacketType {
    /// The protection epoch whose keys open this packet
    #[inline]
    pub fn epoch(self) -> Epoch {
        match self {
            Self::VersionNegotiation
            | Self::ClientInitial
            | Self::ServerStateless
            | Self::ServerCleartext
            | Self::ClientCleartext => Epoch::Cleartext,
            Self::ZeroRttProtected => Epoch::ZeroRtt,
            Self::OneRttPhi0 | Self::OneRttPhi1 => Epoch::OneRtt,
        }
    }

    #[inline]
    pub fn is_long(self) -> bool {
        !matches!(self, Self::OneRttPhi0 | Self::OneRttPhi1)
    }

    fn long_type(self) -> u8 {
        match self {
            Self::VersionNegotiation => 0x01,
            Self::ClientInitial => 0x02,
            Self::ServerStateless => 0x03,
            Self::ServerCleartext => 0x04,
            Self::ClientCleartext => 0x05,
            Self::ZeroRttProtected => 0x06,
            Self::OneRttPhi0 | Self::OneRttPhi1 => unreachable!("short header types"),
        }
    }

    fn from_long_type(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::VersionNegotiation),
            0x02 => Some(Self::ClientInitial),
            0x03 => Some(Self::ServerStateless),
            0x04 => Some(Self::ServerCleartext),
            0x05 => Some(Self::ClientCleartext),
            0x06 => Some(Self::ZeroRttProtected),
            _ => None,
        }
    }
}

/// A parsed packet header.
///
/// `pn` starts as the truncated wire value; the caller completes it with
/// [`Header::decode_packet_number`] once the relevant `largest received`
/// is known.
#[derive(Clone, Debug)]
pub struct Header {
    pub ptype: PacketType,
    pub cnx_id: ConnectionId,
    pub cnx_id_present: bool,
    pub version: Version,
    pub version_index: Option<usize>,
    /// Truncated packet number as it appeared on the wire
    pub pn_truncated: u64,
    /// Width of the truncated packet number
    pub pn_mask: u64,
    /// Fully reconstructed packet number
    pub pn: u64,
    /// Octets consumed by the header; the protected payload starts here
    pub offset: usize,
}

impl Header {
    /// Parses the first octets of a datagram.
    ///
    /// `datagram_len` is the full UDP payload length: a server must reject
    /// under-padded client initials before doing any work on them.
    pub fn parse(
        bytes: &[u8],
        datagram_len: usize,
        receiver: endpoint::Type,
    ) -> Result<Self, Error> {
        let buffer = DecoderBuffer::new(bytes);
        let (first, buffer) = buffer.decode::<u8>()?;

        if first & FORM_LONG != 0 {
            let ptype = PacketType::from_long_type(first & 0x7f)
                .ok_or(Error::FRAME_FORMAT_ERROR.with_reason("unknown long packet type"))?;
            let (cnx_id, buffer) = buffer.decode::<ConnectionId>()?;
            let (pn_truncated, buffer) = buffer.decode::<u32>()?;
            let (version, buffer) = buffer.decode::<u32>()?;

            if ptype == PacketType::ClientInitial
                && receiver.is_server()
                && datagram_len < ENFORCED_INITIAL_MIN_SIZE
            {
                return Err(Error::PROTOCOL_VIOLATION.with_reason("initial datagram under 1200 octets"));
            }

            Ok(Self {
                ptype,
                cnx_id,
                cnx_id_present: true,
                version,
                version_index: version::get_version_index(version),
                pn_truncated: pn_truncated as u64,
                pn_mask: 0xffff_ffff,
                pn: pn_truncated as u64,
                offset: bytes.len() - buffer.len(),
            })
        } else {
            let key_phase = first & SHORT_KEY_PHASE_BIT != 0;
            let ptype = if key_phase {
                PacketType::OneRttPhi1
            } else {
                PacketType::OneRttPhi0
            };

            let (cnx_id, cnx_id_present, buffer) = if first & SHORT_CNX_ID_BIT != 0 {
                let (cnx_id, buffer) = buffer.decode::<ConnectionId>()?;
                (cnx_id, true, buffer)
            } else {
                // resolved by peer address in the context
                (ConnectionId::default(), false, buffer)
            };

            let (pn_truncated, pn_mask, buffer) = match first & 0x1f {
                0x01 => {
                    let (pn, buffer) = buffer.decode::<u8>()?;
                    (pn as u64, 0xff, buffer)
                }
                0x02 => {
                    let (pn, buffer) = buffer.decode::<u16>()?;
                    (pn as u64, 0xffff, buffer)
                }
                0x03 => {
                    let (pn, buffer) = buffer.decode::<u32>()?;
                    (pn as u64, 0xffff_ffff, buffer)
                }
                _ => {
                    return Err(Error::FRAME_FORMAT_ERROR.with_reason("unknown short packet type"))
                }
            };

            Ok(Self {
                ptype,
                cnx_id,
                cnx_id_present,
                version: 0,
                version_index: None,
                pn_truncated,
                pn_mask,
                pn: pn_truncated,
                offset: bytes.len() - buffer.len(),
            })
        }
    }

    /// Completes the truncated packet number against the highest packet
    /// number seen so far
    #[inline]
    pub fn decode_packet_number(&mut self, largest_received: u64) {
        self.pn = number::reconstruct(largest_received, self.pn_mask, self.pn_truncated);
    }
}

/// Encodes a long header
pub fn encode_long<E: Encoder>(
    ptype: PacketType,
    cnx_id: ConnectionId,
    pn: u32,
    version: Version,
    encoder: &mut E,
) {
    debug_assert!(ptype.is_long());
    encoder.encode(&(FORM_LONG | ptype.long_type()));
    encoder.encode(&cnx_id);
    encoder.encode(&pn);
    encoder.encode(&version);
}

/// Encodes a short header. `cnx_id` is omitted when the peer negotiated
/// `omit_connection_id`.
pub fn encode_short<E: Encoder>(
    cnx_id: Option<ConnectionId>,
    key_phase: bool,
    pn_len: number::PnLen,
    pn: u64,
    encoder: &mut E,
) {
    let mut first = pn_len.short_type();
    if cnx_id.is_some() {
        first |= SHORT_CNX_ID_BIT;
    }
    if key_phase {
        first |= SHORT_KEY_PHASE_BIT;
    }
    encoder.encode(&first);
    if let Some(cnx_id) = cnx_id {
        encoder.encode(&cnx_id);
    }
    match pn_len {
        number::PnLen::One => encoder.encode(&(pn as u8)),
        number::PnLen::Two => encoder.encode(&(pn as u16)),
        number::PnLen::Four => encoder.encode(&(pn as u32)),
    }
}

/// Encodes a version negotiation packet, echoing the header fields of the
/// packet that triggered it
pub fn encode_version_negotiation<E: Encoder>(
    cnx_id: ConnectionId,
    pn: u32,
    version: Version,
    supported: &[Version],
    encoder: &mut E,
) {
    encode_long(PacketType::VersionNegotiation, cnx_id, pn, version, encoder);
    for version in supported {
        encoder.encode(version);
    }
}
