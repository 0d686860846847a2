// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The AEAD facade between the packet pipeline and the TLS provider.
//!
//! The core never touches cipher internals: it sees opaque [`Key`] handles
//! produced by a [`Provider`] from either the version-salted cleartext
//! derivation or a secret exported by the TLS session.

pub mod label;
pub mod tls;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use crate::connection_id::{ConnectionId, ResetToken};
use crate::endpoint;
use core::fmt;

/// A local cryptographic failure. Decrypt failures are silent by policy:
/// the packet is dropped without acknowledgement or connection impact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Error {
    pub reason: &'static str,
}

impl Error {
    pub const DECRYPT_ERROR: Self = Self {
        reason: "packet authentication failed",
    };

    pub const fn new(reason: &'static str) -> Self {
        Self { reason }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.reason)
    }
}

impl std::error::Error for Error {}

/// An installed AEAD key
pub trait Key {
    /// Seals `payload` into `output`, returning the number of octets
    /// written (payload length plus tag)
    fn encrypt(
        &self,
        seq: u64,
        aad: &[u8],
        payload: &[u8],
        output: &mut [u8],
    ) -> Result<usize, Error>;

    /// Opens `payload` into `output`, returning the plaintext length.
    /// An authentication failure is an error; callers must drop the packet
    /// without counting it.
    fn decrypt(
        &self,
        seq: u64,
        aad: &[u8],
        payload: &[u8],
        output: &mut [u8],
    ) -> Result<usize, Error>;

    /// Length of the appended authentication tag
    fn tag_len(&self) -> usize;
}

/// The keys installed for one protection epoch.
///
/// `mirror` opens traffic protected with the local secret, so logging can
/// inspect what was just sent without holding cipher state elsewhere.
pub struct KeyPhase {
    pub sealer: Box<dyn Key>,
    pub opener: Box<dyn Key>,
    pub mirror: Box<dyn Key>,
}

impl KeyPhase {
    /// Builds a phase from a (local, remote) secret pair
    pub fn from_secrets(
        provider: &dyn Provider,
        local_secret: &[u8],
        remote_secret: &[u8],
    ) -> Result<Self, Error> {
        Ok(Self {
            sealer: provider.key_from_secret(local_secret)?,
            opener: provider.key_from_secret(remote_secret)?,
            mirror: provider.key_from_secret(local_secret)?,
        })
    }

    /// Builds a phase from a single shared secret (the 0-RTT exporter case)
    pub fn from_shared_secret(provider: &dyn Provider, secret: &[u8]) -> Result<Self, Error> {
        Self::from_secrets(provider, secret, secret)
    }
}

impl fmt::Debug for KeyPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyPhase").finish_non_exhaustive()
    }
}

/// The protection epoch a packet belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Epoch {
    Cleartext,
    ZeroRtt,
    OneRtt,
}

/// The AEAD/HKDF half of the crypto provider
pub trait Provider {
    /// Derives the (client, server) cleartext secrets for a connection:
    /// HKDF-Extract with the version salt over the 8-octet initial
    /// connection id, then HKDF-Expand-Label with the handshake labels
    /// (see [`label`])
    fn cleartext_secrets(
        &self,
        salt: &[u8],
        cnx_id: ConnectionId,
    ) -> Result<(Vec<u8>, Vec<u8>), Error>;

    /// Installs an AEAD key from a raw traffic secret
    fn key_from_secret(&self, secret: &[u8]) -> Result<Box<dyn Key>, Error>;

    /// Derives the 16-octet stateless reset token for a connection id:
    /// `SHA-256(reset_seed || cnx_id)[0..16]`
    fn reset_token(&self, seed: &[u8; 16], cnx_id: ConnectionId) -> ResetToken;

    /// Fills `dest` from the provider's cryptographic RNG
    fn fill_random(&self, dest: &mut [u8]);
}

/// Derives the full cleartext key phase for one role
pub fn cleartext_phase(
    provider: &dyn Provider,
    salt: &[u8],
    cnx_id: ConnectionId,
    role: endpoint::Type,
) -> Result<KeyPhase, Error> {
    let (client_secret, server_secret) = provider.cleartext_secrets(salt, cnx_id)?;
    match role {
        endpoint::Type::Client => KeyPhase::from_secrets(provider, &client_secret, &server_secret),
        endpoint::Type::Server => KeyPhase::from_secrets(provider, &server_secret, &client_secret),
    }
}
