// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The reliability engine: the sent-packet ledger, ack processing, loss
//! declaration, RTT estimation, congestion control and pacing.
//!
//! There is a single packet-number sequence per connection, so one engine
//! covers every epoch.

pub mod congestion;
pub mod pacing;
pub mod rtt;

pub use congestion::{CongestionController, NewReno, CWIN_INITIAL, CWIN_MINIMUM, MAX_PACKET_SIZE};
pub use pacing::Pacer;
pub use rtt::RttEstimator;

use core::time::Duration;
use quill_core::{packet::PacketType, time::Timestamp};
use std::collections::VecDeque;

/// Packets declared lost while trailing the largest acknowledged by this
/// many are reordering losses
const REORDER_PACKET_THRESHOLD: u64 = 3;
/// A retransmitted packet acked later than this is no longer tracked for
/// spurious detection
const SPURIOUS_RETRANSMIT_DELAY_MAX: Duration = Duration::from_secs(1);

/// Everything needed to retransmit or account for one sent packet
#[derive(Clone, Debug)]
pub struct SentPacket {
    pub pn: u64,
    pub ptype: PacketType,
    pub send_time: Timestamp,
    /// On-wire length, tag included
    pub length: usize,
    /// Plaintext frame payload, kept for retransmission
    pub payload: Vec<u8>,
    /// Only acks and padding: never retransmitted, not counted in transit
    pub is_pure_ack: bool,
    /// Carries stream-0 handshake data
    pub contains_crypto: bool,
}

/// A packet we retransmitted, retained to recognize a spurious loss if
/// the original is acknowledged after all
#[derive(Clone, Debug)]
struct Retransmitted {
    pn: u64,
    send_time: Timestamp,
    loss_time: Timestamp,
    loss_gap: u64,
}

/// Result of processing one ACK frame
#[derive(Debug, Default)]
pub struct AckOutcome {
    /// Packets newly removed from the unacknowledged queue, oldest first
    pub newly_acked: Vec<SentPacket>,
}

#[derive(Debug)]
pub struct Recovery {
    /// Unacknowledged packets, oldest at the front
    sent: VecDeque<SentPacket>,
    /// Retransmitted-but-not-yet-acknowledged originals
    retransmitted: VecDeque<Retransmitted>,
    pub rtt: RttEstimator,
    pub congestion: Box<dyn CongestionController>,
    pub pacer: Pacer,
    pub bytes_in_transit: u64,
    pub highest_acknowledged: Option<u64>,
    /// Send time of the highest acknowledged packet
    pub latest_time_acknowledged: Option<Timestamp>,
    pub nb_retransmission_total: u64,
    pub nb_spurious: u64,
    pub max_spurious_rtt: Duration,
    pub max_reorder_gap: u64,
    pub nb_zero_rtt_sent: u64,
    pub nb_zero_rtt_acked: u64,
}

impl Default for Recovery {
    fn default() -> Self {
        Self {
            sent: VecDeque::new(),
            retransmitted: VecDeque::new(),
            rtt: RttEstimator::new(),
            congestion: Box::new(NewReno::new()),
            pacer: Pacer::new(),
            bytes_in_transit: 0,
            highest_acknowledged: None,
            latest_time_acknowledged: None,
            nb_retransmission_total: 0,
            nb_spurious: 0,
            max_spurious_rtt: Duration::ZERO,
            max_reorder_gap: 0,
            nb_zero_rtt_sent: 0,
            nb_zero_rtt_acked: 0,
        }
    }
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.sent.len()
    }

    /// Whether the congestion window admits another full-size packet
    #[inline]
    pub fn window_allows_send(&self) -> bool {
        self.bytes_in_transit + MAX_PACKET_SIZE <= self.congestion.window()
    }

    /// Records a freshly sent packet
    pub fn on_packet_sent(&mut self, packet: SentPacket, now: Timestamp) {
        if !packet.is_pure_ack {
            self.bytes_in_transit += packet.length as u64;
            self.congestion.on_send(packet.length as u64);
        }
        if packet.ptype == PacketType::ZeroRttProtected {
            self.nb_zero_rtt_sent += 1;
        }
        self.pacer
            .update(self.congestion.window(), self.rtt.smoothed_rtt());
        self.pacer.on_packet_sent(now);
        self.sent.push_back(packet);
    }

    /// Processes the ranges of a received ACK frame.
    ///
    /// `ack_delay` is the peer's reported delay, already de-scaled.
    /// Acknowledging the same packet twice dequeues it once; acking a
    /// range is identical to acking each contained number.
    pub fn process_ack(
        &mut self,
        largest: u64,
        ack_delay: Duration,
        ranges: &[(u64, u64)],
        now: Timestamp,
    ) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let acked = |pn: u64| ranges.iter().any(|(start, end)| *start <= pn && pn <= *end);

        let mut index = 0;
        while index < self.sent.len() {
            let pn = self.sent[index].pn;
            if pn > largest {
                break;
            }
            if acked(pn) {
                let packet = self.sent.remove(index).expect("index in bounds");
                if !packet.is_pure_ack {
                    self.bytes_in_transit =
                        self.bytes_in_transit.saturating_sub(packet.length as u64);
                    self.congestion.on_ack(packet.length as u64);
                }
                if packet.ptype == PacketType::ZeroRttProtected {
                    self.nb_zero_rtt_acked += 1;
                }

                if pn == largest {
                    // only the most recent transmission carries an RTT signal
                    let sample = now
                        .saturating_duration_since(packet.send_time)
                        .saturating_sub(ack_delay);
                    self.rtt.update(sample.max(Duration::from_micros(1)));
                }
                if self.highest_acknowledged.map_or(true, |highest| pn > highest) {
                    self.highest_acknowledged = Some(pn);
                    self.latest_time_acknowledged = Some(packet.send_time);
                }
                outcome.newly_acked.push(packet);
            } else {
                index += 1;
            }
        }

        // a "lost" packet surfacing in an ack was a spurious retransmit
        let mut index = 0;
        while index < self.retransmitted.len() {
            let entry = &self.retransmitted[index];
            if now.saturating_duration_since(entry.loss_time) > SPURIOUS_RETRANSMIT_DELAY_MAX {
                self.retransmitted.remove(index);
                continue;
            }
            if acked(entry.pn) {
                let entry = self.retransmitted.remove(index).expect("index in bounds");
                self.nb_spurious += 1;
                let delay = now.saturating_duration_since(entry.send_time);
                self.max_spurious_rtt = self.max_spurious_rtt.max(delay);
                self.max_reorder_gap = self.max_reorder_gap.max(entry.loss_gap);
                continue;
            }
            index += 1;
        }

        self.pacer
            .update(self.congestion.window(), self.rtt.smoothed_rtt());
        outcome
    }

    /// Declares losses and returns the packets whose frames must be
    /// queued for retransmission. Pure-ack packets are dropped silently.
    pub fn detect_loss(&mut self, now: Timestamp) -> Vec<SentPacket> {
        let mut to_retransmit = Vec::new();
        let timer = self.rtt.retransmit_timer();
        let highest_acknowledged = self.highest_acknowledged;

        let mut index = 0;
        let mut timeout_loss = false;
        while index < self.sent.len() {
            let packet = &self.sent[index];
            let gap_lost = highest_acknowledged
                .map(|highest| highest >= packet.pn + REORDER_PACKET_THRESHOLD)
                .unwrap_or(false);
            let timer_lost = now.saturating_duration_since(packet.send_time) >= timer;

            if !(gap_lost || timer_lost) {
                index += 1;
                continue;
            }

            let packet = self.sent.remove(index).expect("index in bounds");
            if !packet.is_pure_ack {
                self.bytes_in_transit =
                    self.bytes_in_transit.saturating_sub(packet.length as u64);
                self.nb_retransmission_total += 1;
                timeout_loss |= timer_lost && !gap_lost;

                self.retransmitted.push_back(Retransmitted {
                    pn: packet.pn,
                    send_time: packet.send_time,
                    loss_time: now,
                    loss_gap: highest_acknowledged
                        .map(|highest| highest.saturating_sub(packet.pn))
                        .unwrap_or(0),
                });
                to_retransmit.push(packet);
            }
        }

        if !to_retransmit.is_empty() {
            self.congestion.on_loss(
                to_retransmit.iter().map(|p| p.length as u64).sum(),
                timeout_loss,
            );
            self.pacer
                .update(self.congestion.window(), self.rtt.smoothed_rtt());
        }

        to_retransmit
    }

    /// Deadline at which the oldest unacknowledged packet is declared lost
    pub fn next_timer(&self) -> Option<Timestamp> {
        self.sent
            .iter()
            .find(|packet| !packet.is_pure_ack)
            .map(|packet| packet.send_time + self.rtt.retransmit_timer())
    }

    /// Drops all reliability state (version renegotiation restart)
    pub fn reset(&mut self) {
        self.sent.clear();
        self.retransmitted.clear();
        self.bytes_in_transit = 0;
        self.highest_acknowledged = None;
        self.latest_time_acknowledged = None;
        self.congestion.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pn: u64, time_micros: u64) -> SentPacket {
        SentPacket {
            pn,
            ptype: PacketType::OneRttPhi0,
            send_time: Timestamp::from_micros(time_micros),
            length: 1_200,
            payload: vec![0x07],
            is_pure_ack: false,
            contains_crypto: false,
        }
    }

    #[test]
    fn ack_dequeues_once_test() {
        let mut recovery = Recovery::new();
        let now = Timestamp::from_micros(1_000);
        recovery.on_packet_sent(packet(1, 0), now);
        recovery.on_packet_sent(packet(2, 0), now);

        let outcome = recovery.process_ack(2, Duration::ZERO, &[(1, 2)], now);
        assert_eq!(outcome.newly_acked.len(), 2);
        assert_eq!(recovery.in_flight(), 0);
        assert_eq!(recovery.bytes_in_transit, 0);

        // duplicate ack is a no-op
        let outcome = recovery.process_ack(2, Duration::ZERO, &[(1, 2)], now);
        assert!(outcome.newly_acked.is_empty());
    }

    #[test]
    fn range_ack_equals_individual_test() {
        let mut a = Recovery::new();
        let mut b = Recovery::new();
        let now = Timestamp::from_micros(10);
        for pn in 1..=5 {
            a.on_packet_sent(packet(pn, 0), now);
            b.on_packet_sent(packet(pn, 0), now);
        }

        let ranged = a.process_ack(5, Duration::ZERO, &[(1, 5)], now);
        let mut individual = Vec::new();
        for pn in 1..=5 {
            individual.extend(
                b.process_ack(5, Duration::ZERO, &[(pn, pn)], now)
                    .newly_acked,
            );
        }

        let ranged: Vec<u64> = ranged.newly_acked.iter().map(|p| p.pn).collect();
        let individual: Vec<u64> = individual.iter().map(|p| p.pn).collect();
        assert_eq!(ranged, individual);
    }

    #[test]
    fn gap_loss_test() {
        let mut recovery = Recovery::new();
        let now = Timestamp::from_micros(100);
        for pn in 1..=5 {
            recovery.on_packet_sent(packet(pn, 100), now);
        }
        recovery.process_ack(5, Duration::ZERO, &[(5, 5)], now);

        // 1 and 2 trail the largest by >= 3: lost; 3 and 4 survive
        let lost = recovery.detect_loss(now);
        let lost: Vec<u64> = lost.iter().map(|p| p.pn).collect();
        assert_eq!(lost, vec![1, 2]);
        assert_eq!(recovery.in_flight(), 2);
    }

    #[test]
    fn spurious_detection_test() {
        let mut recovery = Recovery::new();
        let sent_at = Timestamp::from_micros(0);
        recovery.on_packet_sent(packet(1, 0), sent_at);
        for pn in 2..=5 {
            recovery.on_packet_sent(packet(pn, 0), sent_at);
        }
        recovery.process_ack(5, Duration::ZERO, &[(2, 5)], Timestamp::from_micros(50_000));

        let lost = recovery.detect_loss(Timestamp::from_micros(50_000));
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].pn, 1);

        // the original arrives late: spurious, counted exactly once
        let ack_time = Timestamp::from_micros(200_000);
        recovery.process_ack(5, Duration::ZERO, &[(1, 5)], ack_time);
        assert_eq!(recovery.nb_spurious, 1);
        assert_eq!(recovery.max_spurious_rtt, Duration::from_micros(200_000));
        assert_eq!(recovery.max_reorder_gap, 4);

        recovery.process_ack(5, Duration::ZERO, &[(1, 5)], ack_time);
        assert_eq!(recovery.nb_spurious, 1);
    }

    #[test]
    fn pure_ack_not_retransmitted_test() {
        let mut recovery = Recovery::new();
        let now = Timestamp::from_micros(0);
        let mut ack_only = packet(1, 0);
        ack_only.is_pure_ack = true;
        recovery.on_packet_sent(ack_only, now);
        recovery.on_packet_sent(packet(2, 0), now);
        assert_eq!(recovery.bytes_in_transit, 1_200);

        let late = Timestamp::from_micros(5_000_000);
        let lost = recovery.detect_loss(late);
        let lost: Vec<u64> = lost.iter().map(|p| p.pn).collect();
        assert_eq!(lost, vec![2]);
    }

    #[test]
    fn rtt_sample_on_largest_test() {
        let mut recovery = Recovery::new();
        recovery.on_packet_sent(packet(1, 0), Timestamp::from_micros(0));
        let now = Timestamp::from_micros(80_000);
        recovery.process_ack(1, Duration::from_millis(20), &[(1, 1)], now);
        // 80 ms wire time minus 20 ms reported delay
        assert_eq!(recovery.rtt.smoothed_rtt(), Duration::from_millis(60));
    }
}
