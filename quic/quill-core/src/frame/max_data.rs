// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Tag, TAG_MAX_DATA},
    varint::VarInt,
};
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder, EncoderValue,
};

/// Raises the connection-wide flow-control limit
#[derive(Debug, PartialEq, Eq)]
pub struct MaxData {
    pub maximum_data: VarInt,
}

impl<'a> DecoderParameterizedValue<'a> for MaxData {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(
        _tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (maximum_data, buffer) = buffer.decode()?;
        Ok((MaxData { maximum_data }, buffer))
    }
}

impl EncoderValue for MaxData {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG_MAX_DATA);
        encoder.encode(&self.maximum_data);
    }
}
