// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod buffer;
pub mod value;

pub use buffer::*;
pub use value::*;

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderError {
    /// The buffer did not contain the requested number of bytes
    UnexpectedEof(usize),
    /// The buffer contained more bytes than the value should consume
    UnexpectedBytes(usize),
    /// A length prefix could not be represented in the platform's `usize`
    LengthCapacityExceeded,
    /// The encoded value violated an invariant of its type
    InvariantViolation(&'static str),
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnexpectedEof(len) => write!(f, "unexpected eof: {len}"),
            Self::UnexpectedBytes(len) => write!(f, "unexpected bytes: {len}"),
            Self::LengthCapacityExceeded => {
                write!(f, "length could not be represented in platform's usize type")
            }
            Self::InvariantViolation(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for DecoderError {}

impl From<DecoderError> for &'static str {
    fn from(error: DecoderError) -> Self {
        match error {
            DecoderError::UnexpectedEof(_) => "unexpected eof",
            DecoderError::UnexpectedBytes(_) => "unexpected bytes",
            DecoderError::LengthCapacityExceeded => {
                "length could not be represented in platform's usize type"
            }
            DecoderError::InvariantViolation(msg) => msg,
        }
    }
}

#[macro_export]
macro_rules! decoder_invariant {
    ($expr:expr, $invariant:expr) => {
        if !($expr) {
            return ::core::result::Result::Err(
                $crate::decoder::DecoderError::InvariantViolation($invariant).into(),
            );
        }
    };
}
