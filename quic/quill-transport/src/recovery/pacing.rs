// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::recovery::congestion::MAX_PACKET_SIZE;
use core::time::Duration;
use quill_core::time::Timestamp;

/// Default jitter absorbed before a send is considered early
const DEFAULT_PACING_MARGIN_MICROS: u64 = 1_000;

/// Spreads sends over the round trip instead of releasing the whole
/// window in a burst.
///
/// The inter-packet interval is kept in nanoseconds with a running
/// remainder so slow links do not lose precision to rounding.
#[derive(Clone, Debug)]
pub struct Pacer {
    packet_time_nanos: u64,
    pacing_reminder_nanos: u64,
    pacing_margin_micros: u64,
    next_pacing_time: Timestamp,
}

impl Default for Pacer {
    fn default() -> Self {
        Self {
            packet_time_nanos: 0,
            pacing_reminder_nanos: 0,
            pacing_margin_micros: DEFAULT_PACING_MARGIN_MICROS,
            next_pacing_time: Timestamp::from_micros(0),
        }
    }
}

impl Pacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the inter-packet interval after the window or the RTT
    /// estimate changed: `MSS / (cwin / srtt)`
    pub fn update(&mut self, cwin: u64, smoothed_rtt: Duration) {
        let srtt_micros = (smoothed_rtt.as_micros() as u64).max(1);
        self.packet_time_nanos = (MAX_PACKET_SIZE * srtt_micros)
            .saturating_mul(1_000)
            / cwin.max(1);
    }

    /// Whether pacing admits a send at `now`
    #[inline]
    pub fn can_send(&self, now: Timestamp) -> bool {
        now + Duration::from_micros(self.pacing_margin_micros) >= self.next_pacing_time
    }

    /// Earliest time pacing admits the next send
    #[inline]
    pub fn next_time(&self) -> Timestamp {
        self.next_pacing_time
    }

    /// Advances the release time after a packet left
    pub fn on_packet_sent(&mut self, now: Timestamp) {
        let base = self.next_pacing_time.max(now);
        let nanos = self.packet_time_nanos + self.pacing_reminder_nanos;
        self.pacing_reminder_nanos = nanos % 1_000;
        self.next_pacing_time = base + Duration::from_micros(nanos / 1_000);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_test() {
        let mut pacer = Pacer::new();
        // 15_360 byte window over a 100 ms rtt: 10 packets per rtt
        pacer.update(10 * MAX_PACKET_SIZE, Duration::from_millis(100));

        let start = Timestamp::from_micros(1_000_000);
        assert!(pacer.can_send(start));
        pacer.on_packet_sent(start);
        // next release lands one tenth of the rtt later
        assert_eq!(pacer.next_time(), start + Duration::from_millis(10));

        // the margin lets a slightly early poll through
        assert!(pacer.can_send(start + Duration::from_micros(9_200)));
        assert!(!pacer.can_send(start + Duration::from_micros(1_000)));
    }

    #[test]
    fn remainder_accumulates_test() {
        let mut pacer = Pacer::new();
        pacer.update(3 * MAX_PACKET_SIZE, Duration::from_micros(100));
        let mut now = Timestamp::from_micros(1);
        for _ in 0..100 {
            pacer.on_packet_sent(now);
            now = pacer.next_time();
        }
        // 100 packets at 33_333ns each with remainder carry
        let elapsed = now - Timestamp::from_micros(1);
        assert!(elapsed >= Duration::from_micros(3_300));
        assert!(elapsed <= Duration::from_micros(3_400));
    }
}
