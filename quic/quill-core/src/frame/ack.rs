// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Tag, TAG_ACK},
    sack::SackList,
    varint::VarInt,
};
use quill_codec::{
    decoder_invariant, DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder,
    EncoderValue,
};

/// Acknowledges received packet numbers as a series of descending ranges.
///
/// The ack delay is carried in units scaled by `2^ack_delay_exponent`;
/// scaling is applied by the connection, not the codec.
#[derive(Debug, PartialEq, Eq)]
pub struct Ack {
    pub largest: VarInt,
    pub ack_delay: VarInt,
    /// Closed `(start, end)` ranges ordered from the highest down;
    /// `ranges[0].1 == largest`
    pub ranges: Vec<(u64, u64)>,
}

impl Ack {
    /// Snapshots a receive ledger into a frame.
    ///
    /// The whole ledger is included; callers constrained for space trim
    /// with [`Ack::trim_to_fit`]. Returns `None` on an empty ledger.
    pub fn from_sack(sack: &SackList, ack_delay: VarInt) -> Option<Self> {
        let largest = sack.largest()?;
        let ranges = sack
            .iter()
            .map(|interval| (interval.start, interval.end))
            .collect();
        Some(Self {
            largest: VarInt::new(largest).ok()?,
            ack_delay,
            ranges,
        })
    }

    /// The smallest packet number acknowledged by the frame
    #[inline]
    pub fn smallest(&self) -> u64 {
        self.ranges.last().map(|(start, _)| *start).unwrap_or(0)
    }

    /// Drops ranges from the oldest end until the encoding fits in
    /// `capacity`. Returns `false` if even a single-range frame is too
    /// large.
    pub fn trim_to_fit(&mut self, capacity: usize) -> bool {
        while self.encoding_size() > capacity {
            if self.ranges.len() <= 1 {
                return false;
            }
            self.ranges.pop();
        }
        true
    }
}

impl<'a> DecoderParameterizedValue<'a> for Ack {
    type Parameter = Tag;

    fn decode_parameterized(_tag: Tag, buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let (largest, buffer) = buffer.decode::<VarInt>()?;
        let (ack_delay, buffer) = buffer.decode::<VarInt>()?;
        let (block_count, buffer) = buffer.decode::<VarInt>()?;
        let (first_block, buffer) = buffer.decode::<VarInt>()?;

        let start = largest
            .as_u64()
            .checked_sub(first_block.as_u64())
            .ok_or_else(|| {
                quill_codec::DecoderError::InvariantViolation("ack block under-runs packet space")
            })?;

        let mut ranges = Vec::with_capacity(1 + *block_count as usize);
        ranges.push((start, largest.as_u64()));

        let mut buffer = buffer;
        let mut lowest = start;
        for _ in 0..*block_count {
            let (gap, remaining) = buffer.decode::<VarInt>()?;
            let (len, remaining) = remaining.decode::<VarInt>()?;
            buffer = remaining;

            let end = lowest
                .checked_sub(gap.as_u64())
                .and_then(|value| value.checked_sub(2));
            let end = match end {
                Some(end) => end,
                None => {
                    return Err(quill_codec::DecoderError::InvariantViolation(
                        "ack gap under-runs packet space",
                    ))
                }
            };
            decoder_invariant!(end >= len.as_u64(), "ack block under-runs packet space");
            let start = end - len.as_u64();

            ranges.push((start, end));
            lowest = start;
        }

        Ok((
            Ack {
                largest,
                ack_delay,
                ranges,
            },
            buffer,
        ))
    }
}

impl EncoderValue for Ack {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        debug_assert!(!self.ranges.is_empty());
        debug_assert_eq!(self.ranges[0].1, self.largest.as_u64());

        encoder.encode(&TAG_ACK);
        encoder.encode(&self.largest);
        encoder.encode(&self.ack_delay);
        encoder.encode(&VarInt::try_from(self.ranges.len() - 1).unwrap_or(VarInt::ZERO));

        let (first_start, first_end) = self.ranges[0];
        encoder.encode(&VarInt::new(first_end - first_start).unwrap_or(VarInt::ZERO));

        let mut previous_start = first_start;
        for (start, end) in self.ranges.iter().skip(1).copied() {
            debug_assert!(end + 2 <= previous_start, "ranges must descend");
            let gap = previous_start - end - 2;
            encoder.encode(&VarInt::new(gap).unwrap_or(VarInt::ZERO));
            encoder.encode(&VarInt::new(end - start).unwrap_or(VarInt::ZERO));
            previous_start = start;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_codec::EncoderBuffer;

    fn round_trip(ack: Ack) {
        let mut bytes = [0u8; 512];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&ack);
        let len = encoder.len();

        let buffer = DecoderBuffer::new(&bytes[1..len]);
        let (decoded, remaining) = Ack::decode_parameterized(TAG_ACK, buffer).unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded, ack);
    }

    #[test]
    fn single_range_test() {
        round_trip(Ack {
            largest: VarInt::from_u8(7),
            ack_delay: VarInt::from_u8(0),
            ranges: vec![(0, 7)],
        });
    }

    #[test]
    fn multi_range_test() {
        round_trip(Ack {
            largest: VarInt::from_u32(1_000),
            ack_delay: VarInt::from_u16(300),
            ranges: vec![(990, 1_000), (100, 200), (0, 50)],
        });
    }

    #[test]
    fn ledger_snapshot_test() {
        let mut sack = SackList::new();
        sack.insert(0, 3);
        sack.insert(7, 9);
        sack.insert(20, 20);

        let ack = Ack::from_sack(&sack, VarInt::ZERO).unwrap();
        assert_eq!(ack.largest, 20u64);
        assert_eq!(ack.ranges, vec![(20, 20), (7, 9), (0, 3)]);
        assert_eq!(ack.smallest(), 0);
        round_trip(ack);
    }

    #[test]
    fn trim_test() {
        let mut sack = SackList::new();
        for i in 0..64 {
            sack.insert(i * 3, i * 3 + 1);
        }
        let mut ack = Ack::from_sack(&sack, VarInt::ZERO).unwrap();
        let full = ack.encoding_size();
        assert!(ack.trim_to_fit(full / 2));
        assert!(ack.encoding_size() <= full / 2);
        // the most recent range always survives
        assert_eq!(ack.ranges[0].1, ack.largest.as_u64());
    }

    #[test]
    fn invalid_underrun_test() {
        // largest = 1 but first block claims 5 packets
        let mut bytes = [0u8; 16];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&VarInt::from_u8(1));
        encoder.encode(&VarInt::ZERO);
        encoder.encode(&VarInt::ZERO);
        encoder.encode(&VarInt::from_u8(5));
        let len = encoder.len();

        assert!(Ack::decode_parameterized(TAG_ACK, DecoderBuffer::new(&bytes[..len])).is_err());
    }
}
