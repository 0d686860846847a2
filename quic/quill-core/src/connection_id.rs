// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderValue, Encoder, EncoderValue,
};
use subtle::ConstantTimeEq;

/// A 64-bit connection identifier.
///
/// The client chooses the initial id; the server may substitute its own
/// when it answers. A value of zero is reserved for the negotiated
/// "omit connection id" short-header form.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const LEN: usize = 8;

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The id serialized as it feeds key derivation (8 octets, network order)
    #[inline]
    pub fn to_bytes(self) -> [u8; Self::LEN] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl<'a> DecoderValue<'a> for ConnectionId {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let (id, buffer) = buffer.decode::<u64>()?;
        Ok((Self(id), buffer))
    }
}

impl EncoderValue for ConnectionId {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.0);
    }
}

/// The 16-octet stateless reset token derived from the context reset seed
/// and a connection id
#[derive(Clone, Copy, Debug, Default, Eq)]
pub struct ResetToken([u8; Self::LEN]);

impl ResetToken {
    pub const LEN: usize = 16;

    pub const fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl PartialEq for ResetToken {
    /// Token comparison happens on untrusted input, so it does not
    /// short-circuit
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl AsRef<[u8]> for ResetToken {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
