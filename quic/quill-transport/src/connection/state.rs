// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Connection lifecycle.
///
/// The client walks the left column, the server the right; the closing
/// tail is shared:
///
/// ```text
/// client_init                     server_init
///   -> client_init_sent             -> (stateless retry)
///   -> client_renegotiate           -> server_almost_ready
///   -> client_hrr_received          -> server_ready
///   -> client_init_resent
///   -> client_handshake_start
///   -> client_handshake_progress
///   -> client_almost_ready
///   -> client_ready
///
/// handshake_failure | disconnecting | closing | closing_received
///   | draining | disconnected
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    ClientInit,
    ClientInitSent,
    ClientRenegotiate,
    ClientHrrReceived,
    ClientInitResent,
    ClientHandshakeStart,
    ClientHandshakeProgress,
    ClientAlmostReady,
    ClientReady,
    ServerInit,
    ServerAlmostReady,
    ServerReady,
    HandshakeFailure,
    Disconnecting,
    Closing,
    ClosingReceived,
    Draining,
    Disconnected,
}

impl State {
    /// Both `_ready` states: the application data path is open
    #[inline]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::ClientReady | Self::ServerReady)
    }

    /// Handshake complete, 1-RTT keys installed, waiting for the peer to
    /// prove its own 1-RTT keys. Sending in 1-RTT is already allowed.
    #[inline]
    pub fn is_almost_ready(self) -> bool {
        matches!(self, Self::ClientAlmostReady | Self::ServerAlmostReady)
    }

    #[inline]
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            Self::Disconnecting | Self::Closing | Self::ClosingReceived | Self::Draining
        )
    }

    #[inline]
    pub fn is_disconnected(self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// The handshake is still in flight (either role)
    #[inline]
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            Self::ClientInit
                | Self::ClientInitSent
                | Self::ClientRenegotiate
                | Self::ClientHrrReceived
                | Self::ClientInitResent
                | Self::ClientHandshakeStart
                | Self::ClientHandshakeProgress
                | Self::ClientAlmostReady
                | Self::ServerInit
                | Self::ServerAlmostReady
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::ClientInit => "client_init",
            Self::ClientInitSent => "client_init_sent",
            Self::ClientRenegotiate => "client_renegotiate",
            Self::ClientHrrReceived => "client_hrr_received",
            Self::ClientInitResent => "client_init_resent",
            Self::ClientHandshakeStart => "client_handshake_start",
            Self::ClientHandshakeProgress => "client_handshake_progress",
            Self::ClientAlmostReady => "client_almost_ready",
            Self::ClientReady => "client_ready",
            Self::ServerInit => "server_init",
            Self::ServerAlmostReady => "server_almost_ready",
            Self::ServerReady => "server_ready",
            Self::HandshakeFailure => "handshake_failure",
            Self::Disconnecting => "disconnecting",
            Self::Closing => "closing",
            Self::ClosingReceived => "closing_received",
            Self::Draining => "draining",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
