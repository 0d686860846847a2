// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! HKDF label plumbing for the cleartext epoch and the TLS exporter.

/// Cleartext secret labels, expanded from the extracted per-version master
pub const HANDSHAKE_CLIENT: &str = "tls13 QUIC client handshake secret";
pub const HANDSHAKE_SERVER: &str = "tls13 QUIC server handshake secret";

/// TLS exporter labels for the protected epochs
pub const EXPORTER_0RTT: &str = "EXPORTER-QUIC 0-RTT Secret";
pub const EXPORTER_1RTT_CLIENT: &str = "EXPORTER-QUIC client 1-RTT Secret";
pub const EXPORTER_1RTT_SERVER: &str = "EXPORTER-QUIC server 1-RTT Secret";

/// Formats the `HkdfLabel` info structure:
///
/// ```text
/// struct {
///     uint16 length = Length;
///     opaque label<10..255> = Label;
///     uint8 hashLength;     // always 0
/// } HkdfLabel;
/// ```
pub fn hkdf_expand_info(out_len: u16, label: &str) -> Vec<u8> {
    debug_assert!(label.len() <= 252);

    let mut info = Vec::with_capacity(4 + label.len());
    info.extend_from_slice(&out_len.to_be_bytes());
    info.push(label.len() as u8);
    info.extend_from_slice(label.as_bytes());
    info.push(0);
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_format_test() {
        let info = hkdf_expand_info(32, HANDSHAKE_CLIENT);
        assert_eq!(&info[..2], &[0, 32]);
        assert_eq!(info[2] as usize, HANDSHAKE_CLIENT.len());
        assert_eq!(&info[3..3 + HANDSHAKE_CLIENT.len()], HANDSHAKE_CLIENT.as_bytes());
        assert_eq!(*info.last().unwrap(), 0);
    }
}
