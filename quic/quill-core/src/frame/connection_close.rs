// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Tag, TAG_APPLICATION_CLOSE, TAG_CONNECTION_CLOSE},
    varint::VarInt,
};
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder, EncoderValue,
};

macro_rules! close_frame {
    ($(#[$doc:meta])* $ty:ident, $tag:expr) => {
        $(#[$doc])*
        #[derive(Debug, PartialEq, Eq)]
        pub struct $ty<'a> {
            pub error_code: u16,
            pub reason: &'a [u8],
        }

        impl<'a> DecoderParameterizedValue<'a> for $ty<'a> {
            type Parameter = Tag;

            #[inline]
            fn decode_parameterized(
                _tag: Tag,
                buffer: DecoderBuffer<'a>,
            ) -> DecoderBufferResult<'a, Self> {
                let (error_code, buffer) = buffer.decode()?;
                let (reason, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
                Ok((
                    $ty {
                        error_code,
                        reason: reason.into_less_safe_slice(),
                    },
                    buffer,
                ))
            }
        }

        impl EncoderValue for $ty<'_> {
            #[inline]
            fn encode<E: Encoder>(&self, encoder: &mut E) {
                encoder.encode(&$tag);
                encoder.encode(&self.error_code);
                let reason_len =
                    VarInt::try_from(self.reason.len()).unwrap_or(VarInt::ZERO);
                encoder.encode(&reason_len);
                encoder.write_slice(&self.reason[..*reason_len as usize]);
            }
        }
    };
}

close_frame!(
    /// Closes the connection with a transport error code
    ConnectionClose,
    TAG_CONNECTION_CLOSE
);
close_frame!(
    /// Closes the connection with an application-defined error code
    ApplicationClose,
    TAG_APPLICATION_CLOSE
);
