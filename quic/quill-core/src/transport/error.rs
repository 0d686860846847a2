// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use quill_codec::DecoderError;

//= https://tools.ietf.org/html/draft-ietf-quic-transport-08#section-12
//# Error codes are 16 bits long, with the first byte indicating the
//# general category of the error.  Transport error codes apply to the
//# entire connection and are carried in a CONNECTION_CLOSE frame.

/// A connection-level protocol error: the 16-bit wire code plus a static
/// reason used for logging and the CONNECTION_CLOSE reason phrase
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Error {
    pub code: u16,
    pub reason: &'static str,
}

impl Error {
    pub const fn new(code: u16, reason: &'static str) -> Self {
        Self { code, reason }
    }

    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "TransportError({:#06x})", self.code)
        } else {
            f.write_str(self.reason)
        }
    }
}

impl std::error::Error for Error {}

macro_rules! def_error {
    ($doc:expr, $name:ident, $code:expr) => {
        impl Error {
            #[doc = $doc]
            pub const $name: Error = Error::new($code, stringify!($name));
        }
    };
}

def_error!(
    "The connection is being closed abruptly in the absence of any error.",
    NO_ERROR,
    0x0
);
def_error!(
    "The endpoint encountered an internal error and cannot continue.",
    INTERNAL_ERROR,
    0x1
);
def_error!(
    "An endpoint received more data than it permitted in its advertised data limits.",
    FLOW_CONTROL_ERROR,
    0x3
);
def_error!(
    "An endpoint received a frame for a stream identifier it has not advertised.",
    STREAM_ID_ERROR,
    0x4
);
def_error!(
    "An endpoint received a frame for a stream that was not in a state permitting that frame.",
    STREAM_STATE_ERROR,
    0x5
);
def_error!(
    "An endpoint received stream data beyond, or inconsistent with, an established final offset.",
    FINAL_OFFSET_ERROR,
    0x6
);
def_error!(
    "An endpoint received a frame that was badly formatted.",
    FRAME_FORMAT_ERROR,
    0x7
);
def_error!(
    "An endpoint received transport parameters that were badly formatted or invalid.",
    TRANSPORT_PARAMETER_ERROR,
    0x8
);
def_error!(
    "An endpoint received a version negotiation packet permitting no acceptable version.",
    VERSION_NEGOTIATION_ERROR,
    0x9
);
def_error!(
    "An endpoint detected a protocol compliance error not covered by a more specific code.",
    PROTOCOL_VIOLATION,
    0xA
);
def_error!(
    "The TLS handshake failed.",
    TLS_HANDSHAKE_FAILED,
    0x201
);

impl From<DecoderError> for Error {
    fn from(error: DecoderError) -> Self {
        match error {
            DecoderError::InvariantViolation(reason) => {
                Self::FRAME_FORMAT_ERROR.with_reason(reason)
            }
            _ => Self::FRAME_FORMAT_ERROR,
        }
    }
}

impl From<crate::varint::VarIntError> for Error {
    fn from(_: crate::varint::VarIntError) -> Self {
        Self::INTERNAL_ERROR.with_reason("value exceeded varint range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_test() {
        assert_eq!(Error::FLOW_CONTROL_ERROR.to_string(), "FLOW_CONTROL_ERROR");
        assert_eq!(Error::new(0x42, "").to_string(), "TransportError(0x0042)");
    }
}
