// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Tag, TAG_STOP_SENDING},
    varint::VarInt,
};
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder, EncoderValue,
};

/// Asks the peer to stop transmitting on a stream; the receiver is obliged
/// to answer with a RESET_STREAM carrying a mapped application error.
#[derive(Debug, PartialEq, Eq)]
pub struct StopSending {
    pub stream_id: VarInt,
    pub error_code: u16,
}

impl<'a> DecoderParameterizedValue<'a> for StopSending {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(
        _tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (stream_id, buffer) = buffer.decode()?;
        let (error_code, buffer) = buffer.decode()?;
        Ok((
            StopSending {
                stream_id,
                error_code,
            },
            buffer,
        ))
    }
}

impl EncoderValue for StopSending {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG_STOP_SENDING);
        encoder.encode(&self.stream_id);
        encoder.encode(&self.error_code);
    }
}
