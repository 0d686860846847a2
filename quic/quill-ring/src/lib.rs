// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! AEAD and HKDF provider backed by *ring*.
//!
//! Implements the crypto half of the transport's provider contract:
//! cleartext secret derivation from the per-version salt and initial
//! connection id, AES-128-GCM traffic keys from raw secrets, stateless
//! reset tokens and retry-cookie signing. The TLS handshake itself lives
//! behind the separate session interface and is not provided here.

use quill_core::{
    connection_id::{ConnectionId, ResetToken},
    crypto::{label, Error, Key, Provider},
};
use ring::{aead, digest, hkdf, hmac, rand, rand::SecureRandom};
use zeroize::Zeroize;

const AES_128_KEY_LEN: usize = 16;
const IV_LEN: usize = 12;

/// Labels used to turn a traffic secret into key material, matching the
/// TLS 1.3 key schedule with the `tls13` prefix spelled into the label
const LABEL_KEY: &str = "tls13 key";
const LABEL_IV: &str = "tls13 iv";

struct OutLen(usize);

impl hkdf::KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn hkdf_expand_label(prk: &hkdf::Prk, label_text: &str, out: &mut [u8]) -> Result<(), Error> {
    let info = label::hkdf_expand_info(out.len() as u16, label_text);
    prk.expand(&[&info], OutLen(out.len()))
        .and_then(|okm| okm.fill(out))
        .map_err(|_| Error::new("hkdf expand failed"))
}

/// An installed AES-128-GCM traffic key
pub struct RingKey {
    key: aead::LessSafeKey,
    iv: [u8; IV_LEN],
}

impl RingKey {
    /// Derives key and IV from a raw traffic secret
    pub fn from_secret(secret: &[u8]) -> Result<Self, Error> {
        let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);

        let mut key_bytes = [0u8; AES_128_KEY_LEN];
        hkdf_expand_label(&prk, LABEL_KEY, &mut key_bytes)?;
        let mut iv = [0u8; IV_LEN];
        hkdf_expand_label(&prk, LABEL_IV, &mut iv)?;

        let unbound = aead::UnboundKey::new(&aead::AES_128_GCM, &key_bytes)
            .map_err(|_| Error::new("aead key rejected"))?;
        key_bytes.zeroize();

        Ok(Self {
            key: aead::LessSafeKey::new(unbound),
            iv,
        })
    }

    /// Packet-protection nonce: the IV with the sequence number folded
    /// into its trailing 64 bits
    fn nonce(&self, seq: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (nonce_byte, seq_byte) in nonce[IV_LEN - 8..].iter_mut().zip(seq.to_be_bytes()) {
            *nonce_byte ^= seq_byte;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

impl Key for RingKey {
    fn encrypt(
        &self,
        seq: u64,
        aad: &[u8],
        payload: &[u8],
        output: &mut [u8],
    ) -> Result<usize, Error> {
        let total = payload.len() + self.tag_len();
        if output.len() < total {
            return Err(Error::new("encrypt output buffer too small"));
        }

        output[..payload.len()].copy_from_slice(payload);
        let tag = self
            .key
            .seal_in_place_separate_tag(
                self.nonce(seq),
                aead::Aad::from(aad),
                &mut output[..payload.len()],
            )
            .map_err(|_| Error::new("seal failed"))?;
        output[payload.len()..total].copy_from_slice(tag.as_ref());
        Ok(total)
    }

    fn decrypt(
        &self,
        seq: u64,
        aad: &[u8],
        payload: &[u8],
        output: &mut [u8],
    ) -> Result<usize, Error> {
        if payload.len() < self.tag_len() {
            return Err(Error::DECRYPT_ERROR);
        }

        let mut in_out = payload.to_vec();
        let plaintext = self
            .key
            .open_in_place(self.nonce(seq), aead::Aad::from(aad), &mut in_out)
            .map_err(|_| Error::DECRYPT_ERROR)?;

        if output.len() < plaintext.len() {
            return Err(Error::new("decrypt output buffer too small"));
        }
        output[..plaintext.len()].copy_from_slice(plaintext);
        Ok(plaintext.len())
    }

    fn tag_len(&self) -> usize {
        aead::AES_128_GCM.tag_len()
    }
}

/// The *ring*-backed provider
pub struct RingProvider {
    rng: rand::SystemRandom,
}

impl RingProvider {
    pub fn new() -> Self {
        Self {
            rng: rand::SystemRandom::new(),
        }
    }

    /// Signs a retry cookie over the client address with the context's
    /// retry seed
    pub fn retry_cookie(retry_seed: &[u8], peer_addr: &[u8]) -> [u8; 16] {
        let key = hmac::Key::new(hmac::HMAC_SHA256, retry_seed);
        let tag = hmac::sign(&key, peer_addr);
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&tag.as_ref()[..16]);
        cookie
    }
}

impl Default for RingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for RingProvider {
    fn cleartext_secrets(
        &self,
        salt: &[u8],
        cnx_id: ConnectionId,
    ) -> Result<(Vec<u8>, Vec<u8>), Error> {
        // cleartext_secret = HKDF-Extract(version_salt, cnx_id)
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(&cnx_id.to_bytes());

        let mut client = vec![0u8; digest::SHA256_OUTPUT_LEN];
        hkdf_expand_label(&prk, label::HANDSHAKE_CLIENT, &mut client)?;
        let mut server = vec![0u8; digest::SHA256_OUTPUT_LEN];
        hkdf_expand_label(&prk, label::HANDSHAKE_SERVER, &mut server)?;
        Ok((client, server))
    }

    fn key_from_secret(&self, secret: &[u8]) -> Result<Box<dyn Key>, Error> {
        Ok(Box::new(RingKey::from_secret(secret)?))
    }

    fn reset_token(&self, seed: &[u8; 16], cnx_id: ConnectionId) -> ResetToken {
        let mut material = [0u8; 16 + ConnectionId::LEN];
        material[..16].copy_from_slice(seed);
        material[16..].copy_from_slice(&cnx_id.to_bytes());

        let hash = digest::digest(&digest::SHA256, &material);
        let mut token = [0u8; ResetToken::LEN];
        token.copy_from_slice(&hash.as_ref()[..ResetToken::LEN]);
        ResetToken::new(token)
    }

    fn fill_random(&self, dest: &mut [u8]) {
        // SystemRandom failures are not survivable for an endpoint
        self.rng.fill(dest).expect("system rng");
    }
}

/// AEAD sealer for server session tickets: a 64-bit sequence number in
/// the clear, the ticket body sealed under a key derived from the
/// configured ticket secret
pub struct TicketSealer {
    key: RingKey,
}

impl TicketSealer {
    pub fn new(ticket_secret: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            key: RingKey::from_secret(ticket_secret)?,
        })
    }

    pub fn seal(&self, sequence: u64, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let aad = sequence.to_be_bytes();
        let mut out = vec![0u8; 8 + plaintext.len() + self.key.tag_len()];
        out[..8].copy_from_slice(&aad);
        let sealed = self.key.encrypt(sequence, &aad, plaintext, &mut out[8..])?;
        out.truncate(8 + sealed);
        Ok(out)
    }

    pub fn open(&self, ticket: &[u8]) -> Result<(u64, Vec<u8>), Error> {
        if ticket.len() < 8 {
            return Err(Error::DECRYPT_ERROR);
        }
        let sequence = u64::from_be_bytes(ticket[..8].try_into().expect("length checked"));
        let mut plaintext = vec![0u8; ticket.len() - 8];
        let len = self
            .key
            .decrypt(sequence, &ticket[..8], &ticket[8..], &mut plaintext)?;
        plaintext.truncate(len);
        Ok((sequence, plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::{crypto::KeyPhase, version};

    #[test]
    fn seal_open_round_trip_test() {
        let provider = RingProvider::new();
        let key = provider.key_from_secret(&[7u8; 32]).unwrap();

        let mut sealed = vec![0u8; 128];
        let len = key.encrypt(11, b"header", b"payload bytes", &mut sealed).unwrap();
        assert_eq!(len, 13 + 16);

        let mut opened = vec![0u8; 128];
        let plain = key.decrypt(11, b"header", &sealed[..len], &mut opened).unwrap();
        assert_eq!(&opened[..plain], b"payload bytes");

        // sequence number and additional data are authenticated
        assert!(key.decrypt(12, b"header", &sealed[..len], &mut opened).is_err());
        assert!(key.decrypt(11, b"headex", &sealed[..len], &mut opened).is_err());
    }

    #[test]
    fn cleartext_secrets_are_role_separated_test() {
        let provider = RingProvider::new();
        let cnx_id = ConnectionId::new(0x8394_c8f0_3e51_5708);
        let salt = version::SUPPORTED_VERSIONS[0].salt;

        let (client, server) = provider.cleartext_secrets(salt, cnx_id).unwrap();
        assert_eq!(client.len(), 32);
        assert_eq!(server.len(), 32);
        assert_ne!(client, server);

        // derivation is deterministic in the connection id
        let (client_again, _) = provider.cleartext_secrets(salt, cnx_id).unwrap();
        assert_eq!(client, client_again);
        let (client_other, _) = provider
            .cleartext_secrets(salt, ConnectionId::new(1))
            .unwrap();
        assert_ne!(client, client_other);
    }

    #[test]
    fn cleartext_phases_interoperate_test() {
        let provider = RingProvider::new();
        let cnx_id = ConnectionId::new(42);
        let salt = version::SUPPORTED_VERSIONS[0].salt;
        let (client_secret, server_secret) =
            provider.cleartext_secrets(salt, cnx_id).unwrap();

        let client = KeyPhase::from_secrets(&provider, &client_secret, &server_secret).unwrap();
        let server = KeyPhase::from_secrets(&provider, &server_secret, &client_secret).unwrap();

        let mut sealed = vec![0u8; 64];
        let len = client.sealer.encrypt(1, b"h", b"ping", &mut sealed).unwrap();
        let mut opened = vec![0u8; 64];
        let plain = server.opener.decrypt(1, b"h", &sealed[..len], &mut opened).unwrap();
        assert_eq!(&opened[..plain], b"ping");

        // the mirror opens our own traffic for logging
        let plain = client.mirror.decrypt(1, b"h", &sealed[..len], &mut opened).unwrap();
        assert_eq!(&opened[..plain], b"ping");
    }

    #[test]
    fn reset_token_test() {
        use hex_literal::hex;
        let provider = RingProvider::new();
        let seed = hex!("000102030405060708090a0b0c0d0e0f");
        let a = provider.reset_token(&seed, ConnectionId::new(1));
        let b = provider.reset_token(&seed, ConnectionId::new(1));
        let c = provider.reset_token(&seed, ConnectionId::new(2));
        assert_eq!(a, b);
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn ticket_sealer_test() {
        let sealer = TicketSealer::new(&[9u8; 32]).unwrap();
        let ticket = sealer.seal(7, b"resumption state").unwrap();
        let (sequence, plaintext) = sealer.open(&ticket).unwrap();
        assert_eq!(sequence, 7);
        assert_eq!(plaintext, b"resumption state");

        let mut tampered = ticket.clone();
        *tampered.last_mut().unwrap() ^= 1;
        assert!(sealer.open(&tampered).is_err());
    }

    #[test]
    fn retry_cookie_test() {
        let seed = [1u8; 64];
        let a = RingProvider::retry_cookie(&seed, b"192.0.2.1:4433");
        let b = RingProvider::retry_cookie(&seed, b"192.0.2.1:4433");
        let c = RingProvider::retry_cookie(&seed, b"192.0.2.2:4433");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
