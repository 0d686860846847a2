// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The BLOCKED family: hints that the sender has data but is gated by a
//! peer-advertised limit. Purely advisory.

use crate::{
    frame::{Tag, TAG_BLOCKED, TAG_STREAM_BLOCKED, TAG_STREAM_ID_NEEDED},
    varint::VarInt,
};
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder, EncoderValue,
};

/// The connection-wide data limit gates sending
#[derive(Debug, PartialEq, Eq)]
pub struct Blocked {}

impl<'a> DecoderParameterizedValue<'a> for Blocked {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(
        _tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        Ok((Blocked {}, buffer))
    }
}

impl EncoderValue for Blocked {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG_BLOCKED);
    }
}

/// A per-stream data limit gates sending
#[derive(Debug, PartialEq, Eq)]
pub struct StreamBlocked {
    pub stream_id: VarInt,
}

impl<'a> DecoderParameterizedValue<'a> for StreamBlocked {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(
        _tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (stream_id, buffer) = buffer.decode()?;
        Ok((StreamBlocked { stream_id }, buffer))
    }
}

impl EncoderValue for StreamBlocked {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG_STREAM_BLOCKED);
        encoder.encode(&self.stream_id);
    }
}

/// The stream-id limit gates opening a new stream
#[derive(Debug, PartialEq, Eq)]
pub struct StreamIdNeeded {}

impl<'a> DecoderParameterizedValue<'a> for StreamIdNeeded {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(
        _tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        Ok((StreamIdNeeded {}, buffer))
    }
}

impl EncoderValue for StreamIdNeeded {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG_STREAM_ID_NEEDED);
    }
}
