// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Tag, TAG_MAX_STREAM_ID},
    varint::VarInt,
};
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder, EncoderValue,
};

/// Raises the highest stream id the peer may open. The low bits of the
/// carried id select which stream class the limit applies to.
#[derive(Debug, PartialEq, Eq)]
pub struct MaxStreamId {
    pub maximum_stream_id: VarInt,
}

impl<'a> DecoderParameterizedValue<'a> for MaxStreamId {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(
        _tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (maximum_stream_id, buffer) = buffer.decode()?;
        Ok((MaxStreamId { maximum_stream_id }, buffer))
    }
}

impl EncoderValue for MaxStreamId {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG_MAX_STREAM_ID);
        encoder.encode(&self.maximum_stream_id);
    }
}
