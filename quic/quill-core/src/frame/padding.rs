// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::{Tag, TAG_PADDING};
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder, EncoderValue,
};

/// A run of padding octets. Consecutive padding bytes decode as a single
/// frame covering the whole run.
#[derive(Debug, PartialEq, Eq)]
pub struct Padding {
    /// Total number of padding octets, including the tag itself
    pub length: usize,
}

impl<'a> DecoderParameterizedValue<'a> for Padding {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(
        _tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let mut run = 1;
        let mut buffer = buffer;
        while buffer.peek_byte(0) == Ok(TAG_PADDING) {
            buffer = buffer.skip(1)?;
            run += 1;
        }
        Ok((Padding { length: run }, buffer))
    }
}

impl EncoderValue for Padding {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_repeated(self.length, TAG_PADDING);
    }
}
