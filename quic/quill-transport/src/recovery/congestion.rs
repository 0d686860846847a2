// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Largest datagram the stack will emit
pub const MAX_PACKET_SIZE: u64 = 1_536;
pub const CWIN_INITIAL: u64 = 10 * MAX_PACKET_SIZE;
pub const CWIN_MINIMUM: u64 = 2 * MAX_PACKET_SIZE;

/// The pluggable congestion-control law.
///
/// The reliability engine owns the in-transit accounting and calls these
/// hooks; implementations only manage the window.
pub trait CongestionController: fmt::Debug {
    /// Bytes newly acknowledged by the peer
    fn on_ack(&mut self, bytes_acked: u64);

    /// Bytes declared lost; `is_timeout` marks a retransmit-timer loss as
    /// opposed to a reordering one
    fn on_loss(&mut self, bytes_lost: u64, is_timeout: bool);

    /// Bytes handed to the network
    fn on_send(&mut self, bytes: u64);

    /// Returns the controller to its initial state (version renegotiation)
    fn reset(&mut self);

    /// Current congestion window in bytes
    fn window(&self) -> u64;
}

/// The reference controller: New Reno shaped, slow start then linear
/// growth, halving on loss
#[derive(Debug)]
pub struct NewReno {
    cwin: u64,
    ssthresh: u64,
}

impl Default for NewReno {
    fn default() -> Self {
        Self {
            cwin: CWIN_INITIAL,
            ssthresh: u64::MAX,
        }
    }
}

impl NewReno {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CongestionController for NewReno {
    fn on_ack(&mut self, bytes_acked: u64) {
        if self.cwin < self.ssthresh {
            self.cwin += bytes_acked;
        } else {
            // one MSS per window's worth of acknowledged data
            self.cwin += (MAX_PACKET_SIZE * bytes_acked).max(1) / self.cwin.max(1);
        }
    }

    fn on_loss(&mut self, _bytes_lost: u64, is_timeout: bool) {
        self.ssthresh = (self.cwin / 2).max(CWIN_MINIMUM);
        self.cwin = if is_timeout {
            CWIN_MINIMUM
        } else {
            self.ssthresh
        };
    }

    fn on_send(&mut self, _bytes: u64) {}

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn window(&self) -> u64 {
        self.cwin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_start_test() {
        let mut cc = NewReno::new();
        let initial = cc.window();
        cc.on_ack(MAX_PACKET_SIZE);
        assert_eq!(cc.window(), initial + MAX_PACKET_SIZE);
    }

    #[test]
    fn loss_halves_window_test() {
        let mut cc = NewReno::new();
        cc.on_loss(MAX_PACKET_SIZE, false);
        assert_eq!(cc.window(), CWIN_INITIAL / 2);

        // congestion avoidance growth is sub-linear afterwards
        let before = cc.window();
        cc.on_ack(MAX_PACKET_SIZE);
        assert!(cc.window() > before);
        assert!(cc.window() < before + MAX_PACKET_SIZE);
    }

    #[test]
    fn timeout_collapses_to_minimum_test() {
        let mut cc = NewReno::new();
        cc.on_loss(MAX_PACKET_SIZE, true);
        assert_eq!(cc.window(), CWIN_MINIMUM);
    }

    #[test]
    fn window_floor_test() {
        let mut cc = NewReno::new();
        for _ in 0..8 {
            cc.on_loss(MAX_PACKET_SIZE, false);
        }
        assert!(cc.window() >= CWIN_MINIMUM);
    }
}
