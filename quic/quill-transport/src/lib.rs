// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection QUIC protocol engine and the process-wide endpoint
//! context.
//!
//! The library owns no sockets and no threads: the host feeds inbound
//! datagrams to [`endpoint::Quic::incoming`] and polls
//! [`endpoint::Quic::prepare_next`] for outbound ones, driving every
//! connection's state machine synchronously on the calling thread.

pub mod connection;
pub mod endpoint;
pub mod recovery;
pub mod stream;
pub mod ticket;

pub use connection::{Connection, StreamEvent};
pub use endpoint::Quic;
