// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use bolero::check;
use quill_codec::EncoderBuffer;

fn round_trip(value: u64) {
    let value = VarInt::new(value).unwrap();
    let mut bytes = [0u8; 8];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&value);
    let len = encoder.len();
    assert_eq!(len, value.encoding_size());

    let (decoded, remaining) = DecoderBuffer::new(&bytes[..len]).decode::<VarInt>().unwrap();
    assert_eq!(decoded, value);
    assert!(remaining.is_empty());
}

#[test]
fn round_trip_boundary_test() {
    for value in [
        0,
        63,
        64,
        16_383,
        16_384,
        (1 << 30) - 1,
        1 << 30,
        MAX_VARINT_VALUE,
    ] {
        round_trip(value);
    }
}

#[test]
fn round_trip_fuzz_test() {
    check!().with_type::<u64>().cloned().for_each(|value| {
        round_trip(value & MAX_VARINT_VALUE);
    });
}

#[test]
fn range_test() {
    assert!(VarInt::new(MAX_VARINT_VALUE).is_ok());
    assert!(VarInt::new(MAX_VARINT_VALUE + 1).is_err());
}

#[test]
fn truncated_decode_test() {
    let mut bytes = [0u8; 8];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&VarInt::new(16_384).unwrap());
    let len = encoder.len();

    for cut in 0..len {
        assert!(DecoderBuffer::new(&bytes[..cut]).decode::<VarInt>().is_err());
    }
}

#[test]
fn wire_size_test() {
    assert_eq!(VarInt::wire_size_from_first_byte(0x00), 1);
    assert_eq!(VarInt::wire_size_from_first_byte(0x40), 2);
    assert_eq!(VarInt::wire_size_from_first_byte(0x80), 4);
    assert_eq!(VarInt::wire_size_from_first_byte(0xc0), 8);
}

#[test]
fn example_encoding_test() {
    // examples from the transport draft appendix
    let mut bytes = [0u8; 8];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&VarInt::new(151_288_809_941_952_652).unwrap());
    assert_eq!(
        encoder.as_slice(),
        &[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]
    );

    let mut bytes = [0u8; 4];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&VarInt::new(494_878_333).unwrap());
    assert_eq!(encoder.as_slice(), &[0x9d, 0x7f, 0x3e, 0x7d]);

    let mut bytes = [0u8; 2];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&VarInt::new(15_293).unwrap());
    assert_eq!(encoder.as_slice(), &[0x7b, 0xbd]);

    let mut bytes = [0u8; 1];
    let mut encoder = EncoderBuffer::new(&mut bytes);
    encoder.encode(&VarInt::new(37).unwrap());
    assert_eq!(encoder.as_slice(), &[0x25]);
}
