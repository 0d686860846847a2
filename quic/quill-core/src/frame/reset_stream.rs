// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Tag, TAG_RESET_STREAM},
    varint::VarInt,
};
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder, EncoderValue,
};

/// Abruptly terminates the sending side of a stream. The final offset
/// pins down the peer's flow-control accounting.
#[derive(Debug, PartialEq, Eq)]
pub struct ResetStream {
    pub stream_id: VarInt,
    pub error_code: u16,
    pub final_offset: VarInt,
}

impl<'a> DecoderParameterizedValue<'a> for ResetStream {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(
        _tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (stream_id, buffer) = buffer.decode()?;
        let (error_code, buffer) = buffer.decode()?;
        let (final_offset, buffer) = buffer.decode()?;
        Ok((
            ResetStream {
                stream_id,
                error_code,
                final_offset,
            },
            buffer,
        ))
    }
}

impl EncoderValue for ResetStream {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG_RESET_STREAM);
        encoder.encode(&self.stream_id);
        encoder.encode(&self.error_code);
        encoder.encode(&self.final_offset);
    }
}
