// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{FitError, Tag, TAG_STREAM_MIN},
    varint::VarInt,
};
use core::mem::size_of;
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder, EncoderValue,
};

const OFF_BIT: u8 = 0x04;
const LEN_BIT: u8 = 0x02;
const FIN_BIT: u8 = 0x01;

/// Carries a contiguous slice of stream data.
///
/// The encoder picks the most compact header form that still
/// round-trips: the offset is elided at zero and the length is elided
/// when the frame runs to the end of the packet.
#[derive(Debug, PartialEq, Eq)]
pub struct Stream<'a> {
    pub stream_id: VarInt,
    pub offset: VarInt,
    /// If true, the frame extends to the end of the packet and carries no
    /// length field
    pub is_last_frame: bool,
    /// If true, the frame marks the end of the stream at
    /// `offset + data.len()`
    pub is_fin: bool,
    pub data: &'a [u8],
}

impl Stream<'_> {
    #[inline]
    pub fn tag(&self) -> Tag {
        let mut tag = TAG_STREAM_MIN;
        if *self.offset != 0 {
            tag |= OFF_BIT;
        }
        if !self.is_last_frame {
            tag |= LEN_BIT;
        }
        if self.is_fin {
            tag |= FIN_BIT;
        }
        tag
    }

    /// Tries to fit the frame into `capacity` octets, updating
    /// `is_last_frame`. On success returns the number of data octets that
    /// fit.
    pub fn try_fit(&mut self, capacity: usize) -> Result<usize, FitError> {
        let mut fixed_len = size_of::<Tag>();
        fixed_len += self.stream_id.encoding_size();
        if *self.offset != 0 {
            fixed_len += self.offset.encoding_size();
        }

        let remaining_capacity = capacity.checked_sub(fixed_len).ok_or(FitError)?;
        let max_data_len = remaining_capacity.min(self.data.len());

        // data filling the remainder exactly elides the length field
        if max_data_len == remaining_capacity {
            self.is_last_frame = true;
            return Ok(max_data_len);
        }

        self.is_last_frame = false;
        let len_prefix_size = VarInt::try_from(max_data_len)
            .map_err(|_| FitError)?
            .encoding_size();
        let prefixed_data_len = remaining_capacity
            .checked_sub(len_prefix_size)
            .ok_or(FitError)?;

        Ok(prefixed_data_len.min(self.data.len()))
    }
}

impl<'a> DecoderParameterizedValue<'a> for Stream<'a> {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(tag: Tag, buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let has_offset = tag & OFF_BIT == OFF_BIT;
        let is_last_frame = tag & LEN_BIT != LEN_BIT;
        let is_fin = tag & FIN_BIT == FIN_BIT;

        let (stream_id, buffer) = buffer.decode()?;

        let (offset, buffer) = if has_offset {
            buffer.decode()?
        } else {
            (VarInt::ZERO, buffer)
        };

        let (data, buffer) = if is_last_frame {
            let len = buffer.len();
            buffer.decode_slice(len)?
        } else {
            buffer.decode_slice_with_len_prefix::<VarInt>()?
        };

        Ok((
            Stream {
                stream_id,
                offset,
                is_last_frame,
                is_fin,
                data: data.into_less_safe_slice(),
            },
            buffer,
        ))
    }
}

impl EncoderValue for Stream<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.tag());
        encoder.encode(&self.stream_id);

        if *self.offset != 0 {
            encoder.encode(&self.offset);
        }

        if !self.is_last_frame {
            let len = VarInt::try_from(self.data.len()).expect("stream frame data too large");
            encoder.encode(&len);
        }
        encoder.write_slice(self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;
    use quill_codec::EncoderBuffer;

    fn round_trip(frame: &Stream) {
        let mut bytes = [0u8; 2048];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(frame);
        let len = encoder.len();

        let buffer = DecoderBuffer::new(&bytes[..len]);
        let (tag, buffer) = buffer.decode::<u8>().unwrap();
        let (decoded, remaining) = Stream::decode_parameterized(tag, buffer).unwrap();
        assert!(remaining.is_empty());
        assert_eq!(&decoded, frame);
    }

    #[test]
    fn round_trip_test() {
        round_trip(&Stream {
            stream_id: VarInt::from_u8(4),
            offset: VarInt::ZERO,
            is_last_frame: false,
            is_fin: false,
            data: b"hello",
        });
        round_trip(&Stream {
            stream_id: VarInt::from_u8(4),
            offset: VarInt::from_u32(70_000),
            is_last_frame: true,
            is_fin: true,
            data: b"",
        });
    }

    #[test]
    fn try_fit_test() {
        check!()
            .with_type::<(u16, u32, u16, u16)>()
            .cloned()
            .for_each(|(stream_id, offset, data_len, capacity)| {
                let data = vec![0u8; data_len as usize];
                let mut frame = Stream {
                    stream_id: VarInt::from_u16(stream_id),
                    offset: VarInt::from_u32(offset),
                    is_last_frame: false,
                    is_fin: false,
                    data: &data,
                };

                let capacity = capacity as usize;
                if let Ok(fitted) = frame.try_fit(capacity) {
                    frame.data = &data[..fitted];
                    assert!(
                        frame.encoding_size() <= capacity,
                        "encoding size exceeds capacity: {frame:?}"
                    );
                    if frame.is_last_frame {
                        assert_eq!(frame.encoding_size(), capacity);
                    }
                }
            });
    }
}
