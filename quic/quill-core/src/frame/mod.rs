// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Frame codec for the draft frame table.
//!
//! Each frame type pairs an encoder with a tag-parameterized decoder.
//! Which frames are admissible in which packet epoch is policy, enforced
//! by the receiving connection, not by this codec.

use crate::transport::Error;
use core::fmt;
use quill_codec::{DecoderBuffer, Encoder, EncoderValue};

pub mod ack;
pub mod blocked;
pub mod connection_close;
pub mod max_data;
pub mod max_stream_data;
pub mod max_stream_id;
pub mod new_connection_id;
pub mod padding;
pub mod ping;
pub mod reset_stream;
pub mod stop_sending;
pub mod stream;

pub use ack::Ack;
pub use blocked::{Blocked, StreamBlocked, StreamIdNeeded};
pub use connection_close::{ApplicationClose, ConnectionClose};
pub use max_data::MaxData;
pub use max_stream_data::MaxStreamData;
pub use max_stream_id::MaxStreamId;
pub use new_connection_id::NewConnectionId;
pub use padding::Padding;
pub use ping::{Ping, Pong};
pub use reset_stream::ResetStream;
pub use stop_sending::StopSending;
pub use stream::Stream;

pub type Tag = u8;

pub const TAG_PADDING: Tag = 0x00;
pub const TAG_RESET_STREAM: Tag = 0x01;
pub const TAG_CONNECTION_CLOSE: Tag = 0x02;
pub const TAG_APPLICATION_CLOSE: Tag = 0x03;
pub const TAG_MAX_DATA: Tag = 0x04;
pub const TAG_MAX_STREAM_DATA: Tag = 0x05;
pub const TAG_MAX_STREAM_ID: Tag = 0x06;
pub const TAG_PING: Tag = 0x07;
pub const TAG_BLOCKED: Tag = 0x08;
pub const TAG_STREAM_BLOCKED: Tag = 0x09;
pub const TAG_STREAM_ID_NEEDED: Tag = 0x0a;
pub const TAG_NEW_CONNECTION_ID: Tag = 0x0b;
pub const TAG_STOP_SENDING: Tag = 0x0c;
pub const TAG_PONG: Tag = 0x0d;
pub const TAG_ACK: Tag = 0x0e;
pub const TAG_STREAM_MIN: Tag = 0x10;
pub const TAG_STREAM_MAX: Tag = 0x17;

/// A frame could not be fitted into the remaining packet budget
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FitError;

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "frame exceeds packet budget")
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding(Padding),
    ResetStream(ResetStream),
    ConnectionClose(ConnectionClose<'a>),
    ApplicationClose(ApplicationClose<'a>),
    MaxData(MaxData),
    MaxStreamData(MaxStreamData),
    MaxStreamId(MaxStreamId),
    Ping(Ping<'a>),
    Blocked(Blocked),
    StreamBlocked(StreamBlocked),
    StreamIdNeeded(StreamIdNeeded),
    NewConnectionId(NewConnectionId),
    StopSending(StopSending),
    Pong(Pong<'a>),
    Ack(Ack),
    Stream(Stream<'a>),
}

impl Frame<'_> {
    /// A pure-ack frame carries no retransmittable payload: a packet made
    /// only of these is never retransmitted and does not elicit an ack.
    #[inline]
    pub fn is_pure_ack(&self) -> bool {
        matches!(self, Frame::Padding(_) | Frame::Ack(_))
    }

    #[inline]
    pub fn is_ack_eliciting(&self) -> bool {
        !self.is_pure_ack()
    }

    /// Decodes the next frame from the buffer
    pub fn decode(buffer: DecoderBuffer) -> Result<(Frame, DecoderBuffer), Error> {
        let tag = buffer.peek_byte(0)?;

        macro_rules! frame {
            ($module:ident, $ty:ident) => {{
                let buffer = buffer.skip(1)?;
                let (frame, buffer) = buffer.decode_parameterized::<$module::$ty>(tag)?;
                Ok((Frame::$ty(frame), buffer))
            }};
        }

        match tag {
            TAG_PADDING => frame!(padding, Padding),
            TAG_RESET_STREAM => frame!(reset_stream, ResetStream),
            TAG_CONNECTION_CLOSE => frame!(connection_close, ConnectionClose),
            TAG_APPLICATION_CLOSE => frame!(connection_close, ApplicationClose),
            TAG_MAX_DATA => frame!(max_data, MaxData),
            TAG_MAX_STREAM_DATA => frame!(max_stream_data, MaxStreamData),
            TAG_MAX_STREAM_ID => frame!(max_stream_id, MaxStreamId),
            TAG_PING => frame!(ping, Ping),
            TAG_BLOCKED => frame!(blocked, Blocked),
            TAG_STREAM_BLOCKED => frame!(blocked, StreamBlocked),
            TAG_STREAM_ID_NEEDED => frame!(blocked, StreamIdNeeded),
            TAG_NEW_CONNECTION_ID => frame!(new_connection_id, NewConnectionId),
            TAG_STOP_SENDING => frame!(stop_sending, StopSending),
            TAG_PONG => frame!(ping, Pong),
            TAG_ACK => frame!(ack, Ack),
            TAG_STREAM_MIN..=TAG_STREAM_MAX => frame!(stream, Stream),
            _ => Err(Error::FRAME_FORMAT_ERROR.with_reason("unknown frame type")),
        }
    }
}

impl EncoderValue for Frame<'_> {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        match self {
            Frame::Padding(frame) => encoder.encode(frame),
            Frame::ResetStream(frame) => encoder.encode(frame),
            Frame::ConnectionClose(frame) => encoder.encode(frame),
            Frame::ApplicationClose(frame) => encoder.encode(frame),
            Frame::MaxData(frame) => encoder.encode(frame),
            Frame::MaxStreamData(frame) => encoder.encode(frame),
            Frame::MaxStreamId(frame) => encoder.encode(frame),
            Frame::Ping(frame) => encoder.encode(frame),
            Frame::Blocked(frame) => encoder.encode(frame),
            Frame::StreamBlocked(frame) => encoder.encode(frame),
            Frame::StreamIdNeeded(frame) => encoder.encode(frame),
            Frame::NewConnectionId(frame) => encoder.encode(frame),
            Frame::StopSending(frame) => encoder.encode(frame),
            Frame::Pong(frame) => encoder.encode(frame),
            Frame::Ack(frame) => encoder.encode(frame),
            Frame::Stream(frame) => encoder.encode(frame),
        }
    }
}

/// Iterates the frames of a decrypted packet payload
pub struct FrameIter<'a> {
    buffer: DecoderBuffer<'a>,
}

impl<'a> FrameIter<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            buffer: DecoderBuffer::new(payload),
        }
    }
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<Frame<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            return None;
        }
        match Frame::decode(self.buffer) {
            Ok((frame, remaining)) => {
                self.buffer = remaining;
                Some(Ok(frame))
            }
            Err(error) => {
                // poison the iterator
                self.buffer = DecoderBuffer::new(&[]);
                Some(Err(error))
            }
        }
    }
}

/// Returns whether every frame in the payload is a pure ack, without
/// materializing the frames. A decode failure counts as not pure.
pub fn payload_is_pure_ack(payload: &[u8]) -> bool {
    for frame in FrameIter::new(payload) {
        match frame {
            Ok(frame) if frame.is_pure_ack() => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::VarInt;
    use quill_codec::EncoderBuffer;

    fn round_trip(frame: Frame) {
        let mut bytes = [0u8; 1500];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&frame);
        let len = encoder.len();

        let (decoded, remaining) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_test() {
        round_trip(Frame::ResetStream(ResetStream {
            stream_id: VarInt::from_u8(4),
            error_code: 0x101,
            final_offset: VarInt::from_u32(100_000),
        }));
        round_trip(Frame::MaxData(MaxData {
            maximum_data: VarInt::from_u32(1 << 20),
        }));
        round_trip(Frame::MaxStreamData(MaxStreamData {
            stream_id: VarInt::from_u8(5),
            maximum_stream_data: VarInt::from_u32(65_536),
        }));
        round_trip(Frame::MaxStreamId(MaxStreamId {
            maximum_stream_id: VarInt::from_u16(513),
        }));
        round_trip(Frame::Ping(Ping { data: &[1, 2, 3] }));
        round_trip(Frame::Pong(Pong { data: &[1, 2, 3] }));
        round_trip(Frame::Blocked(Blocked {}));
        round_trip(Frame::StreamBlocked(StreamBlocked {
            stream_id: VarInt::from_u8(8),
        }));
        round_trip(Frame::StreamIdNeeded(StreamIdNeeded {}));
        round_trip(Frame::NewConnectionId(NewConnectionId {
            sequence: VarInt::from_u8(1),
            cnx_id: crate::connection_id::ConnectionId::new(0xfeed),
            reset_token: [7u8; 16],
        }));
        round_trip(Frame::StopSending(StopSending {
            stream_id: VarInt::from_u8(4),
            error_code: 0x33,
        }));
        round_trip(Frame::ConnectionClose(ConnectionClose {
            error_code: Error::PROTOCOL_VIOLATION.code,
            reason: b"went sideways",
        }));
        round_trip(Frame::ApplicationClose(ApplicationClose {
            error_code: 0x99,
            reason: b"",
        }));
    }

    #[test]
    fn pure_ack_classification_test() {
        assert!(Frame::Padding(Padding { length: 3 }).is_pure_ack());
        assert!(Frame::Ping(Ping { data: &[] }).is_ack_eliciting());

        let mut bytes = [0u8; 64];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&Frame::Padding(Padding { length: 5 }));
        let len = encoder.len();
        assert!(payload_is_pure_ack(&bytes[..len]));

        let mut bytes = [0u8; 64];
        let mut encoder = EncoderBuffer::new(&mut bytes);
        encoder.encode(&Frame::Ping(Ping { data: &[] }));
        let len = encoder.len();
        assert!(!payload_is_pure_ack(&bytes[..len]));
    }

    #[test]
    fn unknown_frame_test() {
        let bytes = [0xeeu8, 0, 0];
        assert!(Frame::decode(DecoderBuffer::new(&bytes)).is_err());
    }
}
