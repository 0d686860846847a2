// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    connection_id::{ConnectionId, ResetToken},
    frame::{Tag, TAG_NEW_CONNECTION_ID},
    varint::VarInt,
};
use quill_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderParameterizedValue, Encoder, EncoderValue,
};

/// Announces an alternative connection id, with the stateless reset token
/// the peer should honor for it
#[derive(Debug, PartialEq, Eq)]
pub struct NewConnectionId {
    pub sequence: VarInt,
    pub cnx_id: ConnectionId,
    pub reset_token: [u8; ResetToken::LEN],
}

impl<'a> DecoderParameterizedValue<'a> for NewConnectionId {
    type Parameter = Tag;

    #[inline]
    fn decode_parameterized(
        _tag: Tag,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (sequence, buffer) = buffer.decode()?;
        let (cnx_id, buffer) = buffer.decode()?;
        let (token, buffer) = buffer.decode_slice(ResetToken::LEN)?;
        let mut reset_token = [0u8; ResetToken::LEN];
        reset_token.copy_from_slice(token.as_less_safe_slice());
        Ok((
            NewConnectionId {
                sequence,
                cnx_id,
                reset_token,
            },
            buffer,
        ))
    }
}

impl EncoderValue for NewConnectionId {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&TAG_NEW_CONNECTION_ID);
        encoder.encode(&self.sequence);
        encoder.encode(&self.cnx_id);
        encoder.write_slice(&self.reset_token);
    }
}
