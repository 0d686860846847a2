// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport parameters, exchanged once per connection inside a dedicated
//! TLS extension.
//!
//! The client's extension opens with the version it first proposed; the
//! server's opens with the negotiated version and the full supported list,
//! which lets the client detect a forged version-negotiation exchange.

use crate::{endpoint, transport::Error, version::Version};
use quill_codec::{decoder_invariant, DecoderBuffer, Encoder, EncoderBuffer};

/// TLS extension carrying the parameters
pub const TLS_EXTENSION: u16 = 26;
/// Upper bound on the encoded extension body
pub const MAX_ENCODED_LEN: usize = 512;

const ID_INITIAL_MAX_STREAM_DATA: u16 = 0;
const ID_INITIAL_MAX_DATA: u16 = 1;
const ID_INITIAL_MAX_STREAM_ID_BIDIR: u16 = 2;
const ID_IDLE_TIMEOUT: u16 = 3;
const ID_OMIT_CONNECTION_ID: u16 = 4;
const ID_MAX_PACKET_SIZE: u16 = 5;
const ID_ACK_DELAY_EXPONENT: u16 = 7;
const ID_INITIAL_MAX_STREAM_ID_UNIDIR: u16 = 8;

/// Connection-scoped configuration advertised to the peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parameters {
    pub initial_max_stream_data: u32,
    pub initial_max_data: u32,
    pub initial_max_stream_id_bidir: u32,
    pub initial_max_stream_id_unidir: u32,
    /// In seconds
    pub idle_timeout: u32,
    pub omit_connection_id: bool,
    pub max_packet_size: u32,
    pub ack_delay_exponent: u8,
}

impl Parameters {
    pub fn default_for(role: endpoint::Type) -> Self {
        // both roles currently advertise the same defaults
        let _ = role;
        Self {
            initial_max_stream_data: 65_535,
            initial_max_data: 0x10_0000,
            initial_max_stream_id_bidir: 65_533,
            initial_max_stream_id_unidir: 65_535,
            idle_timeout: 120,
            omit_connection_id: false,
            max_packet_size: 1_536,
            ack_delay_exponent: 3,
        }
    }

    fn encode_body<E: Encoder>(&self, encoder: &mut E) {
        let mut body = [0u8; MAX_ENCODED_LEN];
        let mut list = EncoderBuffer::new(&mut body);

        let param_u32 = |list: &mut EncoderBuffer, id: u16, value: u32| {
            list.encode(&id);
            list.encode(&4u16);
            list.encode(&value);
        };

        param_u32(&mut list, ID_INITIAL_MAX_STREAM_DATA, self.initial_max_stream_data);
        param_u32(&mut list, ID_INITIAL_MAX_DATA, self.initial_max_data);
        param_u32(
            &mut list,
            ID_INITIAL_MAX_STREAM_ID_BIDIR,
            self.initial_max_stream_id_bidir,
        );
        param_u32(
            &mut list,
            ID_INITIAL_MAX_STREAM_ID_UNIDIR,
            self.initial_max_stream_id_unidir,
        );
        param_u32(&mut list, ID_IDLE_TIMEOUT, self.idle_timeout);
        param_u32(&mut list, ID_MAX_PACKET_SIZE, self.max_packet_size);

        list.encode(&ID_ACK_DELAY_EXPONENT);
        list.encode(&1u16);
        list.encode(&self.ack_delay_exponent);

        if self.omit_connection_id {
            // zero-length parameter, presence is the signal
            list.encode(&ID_OMIT_CONNECTION_ID);
            list.encode(&0u16);
        }

        let len = list.len();
        encoder.encode(&(len as u16));
        encoder.write_slice(&body[..len]);
    }

    /// Encodes the client form of the extension
    pub fn encode_client<E: Encoder>(&self, initial_version: Version, encoder: &mut E) {
        encoder.encode(&initial_version);
        self.encode_body(encoder);
    }

    /// Encodes the server form of the extension
    pub fn encode_server<E: Encoder>(
        &self,
        negotiated_version: Version,
        supported_versions: &[Version],
        encoder: &mut E,
    ) {
        encoder.encode(&negotiated_version);
        encoder.encode(&((supported_versions.len() * 4) as u8));
        for version in supported_versions {
            encoder.encode(version);
        }
        self.encode_body(encoder);
    }

    fn decode_body(buffer: DecoderBuffer) -> Result<Self, Error> {
        let (list, buffer) = buffer.decode_slice_with_len_prefix::<u16>()?;
        buffer.ensure_empty()?;

        let mut parameters = Self::default_for(endpoint::Type::Client);
        // mandatory parameters must all be present exactly once
        let mut seen = [false; 9];
        let mut list = list;

        while !list.is_empty() {
            let (id, remaining) = list.decode::<u16>()?;
            let (value, remaining) = remaining.decode_slice_with_len_prefix::<u16>()?;
            list = remaining;

            if let Some(seen) = seen.get_mut(id as usize) {
                decoder_invariant!(!*seen, "duplicate transport parameter");
                *seen = true;
            }

            let value = value.peek();
            match id {
                ID_INITIAL_MAX_STREAM_DATA => {
                    parameters.initial_max_stream_data = decode_u32(value)?
                }
                ID_INITIAL_MAX_DATA => parameters.initial_max_data = decode_u32(value)?,
                ID_INITIAL_MAX_STREAM_ID_BIDIR => {
                    parameters.initial_max_stream_id_bidir = decode_u32(value)?
                }
                ID_INITIAL_MAX_STREAM_ID_UNIDIR => {
                    parameters.initial_max_stream_id_unidir = decode_u32(value)?
                }
                ID_IDLE_TIMEOUT => parameters.idle_timeout = decode_u32(value)?,
                ID_MAX_PACKET_SIZE => parameters.max_packet_size = decode_u32(value)?,
                ID_ACK_DELAY_EXPONENT => {
                    let (exponent, value) = value.decode::<u8>()?;
                    value.ensure_empty()?;
                    if exponent > 20 {
                        return Err(Error::TRANSPORT_PARAMETER_ERROR
                            .with_reason("ack_delay_exponent out of range"));
                    }
                    parameters.ack_delay_exponent = exponent;
                }
                ID_OMIT_CONNECTION_ID => {
                    value.ensure_empty()?;
                    parameters.omit_connection_id = true;
                }
                // unknown parameters are skipped for forward compatibility
                _ => {}
            }
        }

        for id in [
            ID_INITIAL_MAX_STREAM_DATA,
            ID_INITIAL_MAX_DATA,
            ID_IDLE_TIMEOUT,
        ] {
            if !seen[id as usize] {
                return Err(Error::TRANSPORT_PARAMETER_ERROR
                    .with_reason("missing mandatory transport parameter"));
            }
        }

        if parameters.max_packet_size < 1_200 {
            return Err(
                Error::TRANSPORT_PARAMETER_ERROR.with_reason("max_packet_size below 1200")
            );
        }

        Ok(parameters)
    }

    /// Decodes the extension sent by a client
    pub fn decode_client(bytes: &[u8]) -> Result<(Version, Self), Error> {
        let buffer = DecoderBuffer::new(bytes);
        let (initial_version, buffer) = buffer.decode::<u32>()?;
        let parameters = Self::decode_body(buffer)?;
        Ok((initial_version, parameters))
    }

    /// Decodes the extension sent by a server
    pub fn decode_server(bytes: &[u8]) -> Result<(ServerVersionInfo, Self), Error> {
        let buffer = DecoderBuffer::new(bytes);
        let (negotiated_version, buffer) = buffer.decode::<u32>()?;
        let (versions, buffer) = buffer.decode_slice_with_len_prefix::<u8>()?;
        decoder_invariant!(
            versions.len() % 4 == 0,
            "supported version list must be a multiple of 4 octets"
        );

        let mut supported_versions = Vec::with_capacity(versions.len() / 4);
        let mut versions = versions;
        while !versions.is_empty() {
            let (version, remaining) = versions.decode::<u32>()?;
            supported_versions.push(version);
            versions = remaining;
        }

        let parameters = Self::decode_body(buffer)?;
        Ok((
            ServerVersionInfo {
                negotiated_version,
                supported_versions,
            },
            parameters,
        ))
    }
}

/// Version information carried in the server's extension prologue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerVersionInfo {
    pub negotiated_version: Version,
    pub supported_versions: Vec<Version>,
}

fn decode_u32(buffer: DecoderBuffer) -> Result<u32, Error> {
    let (value, buffer) = buffer.decode::<u32>()?;
    buffer.ensure_empty()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version;

    #[test]
    fn client_round_trip_test() {
        let parameters = Parameters::default_for(endpoint::Type::Client);
        let mut bytes = [0u8; MAX_ENCODED_LEN];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        parameters.encode_client(version::DRAFT_08, &mut encoder);
        let len = encoder.len();
        assert!(len <= MAX_ENCODED_LEN);

        let (initial_version, decoded) = Parameters::decode_client(&bytes[..len]).unwrap();
        assert_eq!(initial_version, version::DRAFT_08);
        assert_eq!(decoded, parameters);
    }

    #[test]
    fn server_round_trip_test() {
        let mut parameters = Parameters::default_for(endpoint::Type::Server);
        parameters.omit_connection_id = true;
        let supported = [version::DRAFT_08, version::DRAFT_07];

        let mut bytes = [0u8; MAX_ENCODED_LEN];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        parameters.encode_server(version::DRAFT_08, &supported, &mut encoder);
        let len = encoder.len();

        let (info, decoded) = Parameters::decode_server(&bytes[..len]).unwrap();
        assert_eq!(info.negotiated_version, version::DRAFT_08);
        assert_eq!(info.supported_versions, supported);
        assert_eq!(decoded, parameters);
    }

    #[test]
    fn rejects_small_packet_size_test() {
        let mut parameters = Parameters::default_for(endpoint::Type::Client);
        parameters.max_packet_size = 600;

        let mut bytes = [0u8; MAX_ENCODED_LEN];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        parameters.encode_client(version::DRAFT_08, &mut encoder);
        let len = encoder.len();

        assert_eq!(
            Parameters::decode_client(&bytes[..len]).unwrap_err().code,
            Error::TRANSPORT_PARAMETER_ERROR.code
        );
    }
}
