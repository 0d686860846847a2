// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Tag, TAG_MAX_STREAM_DATA},
    varint::VarInt,
};
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder, EncoderValue,
};

/// Raises the flow-control limit of a single stream
#[derive(Debug, PartialEq, Eq)]
pub struct MaxStreamData {
    pub stream_id: VarInt,
    pub maximum_stream_data: VarInt,
}

impl<'a> DecoderParameterizedValue<'a> for MaxStreamData {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(
        _tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (stream_id, buffer) = buffer.decode()?;
        let (maximum_stream_data, buffer) = buffer.decode()?;
        Ok((
            MaxStreamData {
                stream_id,
                maximum_stream_data,
            },
            buffer,
        ))
    }
}

impl EncoderValue for MaxStreamData {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG_MAX_STREAM_DATA);
        encoder.encode(&self.stream_id);
        encoder.encode(&self.maximum_stream_data);
    }
}
