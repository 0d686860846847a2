// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::decoder::buffer::{DecoderBuffer, DecoderBufferResult};
use byteorder::{ByteOrder, NetworkEndian};
use core::mem::size_of;

pub trait DecoderValue<'a>: Sized {
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self>;
}

impl<'a> DecoderValue<'a> for u8 {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let (value, buffer) = buffer.decode_slice(size_of::<Self>())?;
        Ok((value.as_less_safe_slice()[0], buffer))
    }
}

macro_rules! decoder_value_network_endian {
    ($call:ident, $ty:ty) => {
        impl<'a> DecoderValue<'a> for $ty {
            #[inline]
            fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
                let (value, buffer) = buffer.decode_slice(size_of::<Self>())?;
                let value = NetworkEndian::$call(value.as_less_safe_slice());
                Ok((value, buffer))
            }
        }
    };
}

decoder_value_network_endian!(read_u16, u16);
decoder_value_network_endian!(read_u32, u32);
decoder_value_network_endian!(read_u64, u64);

impl<'a> DecoderValue<'a> for DecoderBuffer<'a> {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let len = buffer.len();
        buffer.decode_slice(len)
    }
}

impl<'a> DecoderValue<'a> for &'a [u8] {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let len = buffer.len();
        let (slice, buffer) = buffer.decode_slice(len)?;
        Ok((slice.into_less_safe_slice(), buffer))
    }
}

/// A value whose decoding implementation is altered by a parameter,
/// e.g. a frame body parsed according to its tag byte.
pub trait DecoderParameterizedValue<'a>: Sized {
    type Parameter;

    fn decode_parameterized(
        parameter: Self::Parameter,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self>;
}
