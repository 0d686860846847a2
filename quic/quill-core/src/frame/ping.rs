// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::{Tag, TAG_PING, TAG_PONG};
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder, EncoderValue,
};

macro_rules! ping_frame {
    ($ty:ident, $tag:expr) => {
        /// Carries up to 255 octets of opaque data. A PONG must echo the
        /// data of the PING it answers.
        #[derive(Debug, PartialEq, Eq)]
        pub struct $ty<'a> {
            pub data: &'a [u8],
        }

        impl<'a> DecoderParameterizedValue<'a> for $ty<'a> {
            type Parameter = Tag;

            #[inline]
            fn decode_parameterized(
                _tag: Tag,
                buffer: DecoderBuffer<'a>,
            ) -> DecoderBufferResult<'a, Self> {
                let (data, buffer) = buffer.decode_slice_with_len_prefix::<u8>()?;
                Ok((
                    $ty {
                        data: data.into_less_safe_slice(),
                    },
                    buffer,
                ))
            }
        }

        impl EncoderValue for $ty<'_> {
            #[inline]
            fn encode<E: Encoder>(&self, encoder: &mut E) {
                debug_assert!(self.data.len() <= u8::MAX as usize);
                encoder.encode(&$tag);
                encoder.encode(&(self.data.len() as u8));
                encoder.write_slice(self.data);
            }
        }
    };
}

ping_frame!(Ping, TAG_PING);
ping_frame!(Pong, TAG_PONG);
