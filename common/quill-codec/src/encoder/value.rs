// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::encoder::{Encoder, EncoderLenEstimator};
use byteorder::{ByteOrder, NetworkEndian};
use core::mem::size_of;

pub trait EncoderValue: Sized {
    /// Encodes the value into the encoder
    fn encode<E: Encoder>(&self, encoder: &mut E);

    /// Returns the encoding size with no buffer constraints
    #[inline]
    fn encoding_size(&self) -> usize {
        let mut estimator = EncoderLenEstimator::new(usize::MAX);
        self.encode(&mut estimator);
        estimator.len()
    }

    /// Encodes the value into the encoder, prefixed with the
    /// encoded length as `Len`
    #[inline]
    fn encode_with_len_prefix<Len: TryFrom<usize> + EncoderValue, E: Encoder>(
        &self,
        encoder: &mut E,
    ) where
        Len::Error: core::fmt::Debug,
    {
        let len: Len = self
            .encoding_size()
            .try_into()
            .expect("value encoding size exceeded length prefix");
        encoder.encode(&len);
        encoder.encode(self);
    }
}

impl EncoderValue for u8 {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(&[*self]);
    }
}

macro_rules! encoder_value_network_endian {
    ($call:ident, $ty:ty) => {
        impl EncoderValue for $ty {
            #[inline]
            fn encode<E: Encoder>(&self, encoder: &mut E) {
                encoder.write_sized(size_of::<$ty>(), |dest| NetworkEndian::$call(dest, *self));
            }
        }
    };
}

encoder_value_network_endian!(write_u16, u16);
encoder_value_network_endian!(write_u32, u32);
encoder_value_network_endian!(write_u64, u64);

impl EncoderValue for &[u8] {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self);
    }
}

impl<T: EncoderValue> EncoderValue for &T {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        (*self).encode(encoder)
    }
}
