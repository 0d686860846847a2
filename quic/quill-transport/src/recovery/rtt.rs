// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;

/// Starting estimate before any sample arrives
pub const INITIAL_RTT: Duration = Duration::from_millis(250);
/// The retransmit timer never arms below this
pub const MIN_RETRANSMIT_TIMER: Duration = Duration::from_millis(50);
/// Initial retransmit timer, before any RTT sample
pub const INITIAL_RETRANSMIT_TIMER: Duration = Duration::from_secs(1);
/// Longest we will intentionally delay an acknowledgement
pub const ACK_DELAY_MAX: Duration = Duration::from_millis(20);
/// Timer granularity
const GRANULARITY: Duration = Duration::from_millis(1);

/// Exponentially-weighted RTT estimation and the retransmit timer derived
/// from it
#[derive(Clone, Debug)]
pub struct RttEstimator {
    smoothed_rtt: Duration,
    rtt_variant: Duration,
    rtt_min: Duration,
    retransmit_timer: Duration,
    max_ack_delay: Duration,
    has_sample: bool,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            smoothed_rtt: INITIAL_RTT,
            rtt_variant: INITIAL_RTT / 2,
            rtt_min: INITIAL_RTT,
            retransmit_timer: INITIAL_RETRANSMIT_TIMER,
            max_ack_delay: ACK_DELAY_MAX,
            has_sample: false,
        }
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt
    }

    #[inline]
    pub fn rtt_min(&self) -> Duration {
        self.rtt_min
    }

    #[inline]
    pub fn rtt_variant(&self) -> Duration {
        self.rtt_variant
    }

    #[inline]
    pub fn retransmit_timer(&self) -> Duration {
        self.retransmit_timer
    }

    #[inline]
    pub fn max_ack_delay(&self) -> Duration {
        self.max_ack_delay
    }

    #[inline]
    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    /// Feeds a raw round-trip measurement, already reduced by the peer's
    /// reported ack delay
    pub fn update(&mut self, rtt_sample: Duration) {
        if !self.has_sample {
            self.has_sample = true;
            self.smoothed_rtt = rtt_sample;
            self.rtt_variant = rtt_sample / 2;
            self.rtt_min = rtt_sample;
        } else {
            self.rtt_min = self.rtt_min.min(rtt_sample);

            let delta = if rtt_sample > self.smoothed_rtt {
                rtt_sample - self.smoothed_rtt
            } else {
                self.smoothed_rtt - rtt_sample
            };
            self.smoothed_rtt = (self.smoothed_rtt * 7 + rtt_sample) / 8;
            self.rtt_variant = (self.rtt_variant * 3 + delta) / 4;
        }

        self.retransmit_timer = (self.smoothed_rtt
            + (self.rtt_variant * 4).max(GRANULARITY)
            + self.max_ack_delay)
            .max(MIN_RETRANSMIT_TIMER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_test() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(100));
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(100));
        assert_eq!(rtt.rtt_variant(), Duration::from_millis(50));
        assert_eq!(rtt.rtt_min(), Duration::from_millis(100));
        // 100 + max(4*50, 1) + 20
        assert_eq!(rtt.retransmit_timer(), Duration::from_millis(320));
    }

    #[test]
    fn smoothing_test() {
        let mut rtt = RttEstimator::new();
        rtt.update(Duration::from_millis(80));
        rtt.update(Duration::from_millis(160));
        // 7/8 * 80 + 1/8 * 160
        assert_eq!(rtt.smoothed_rtt(), Duration::from_millis(90));
        assert_eq!(rtt.rtt_min(), Duration::from_millis(80));
    }

    #[test]
    fn timer_floor_test() {
        let mut rtt = RttEstimator::new();
        for _ in 0..16 {
            rtt.update(Duration::from_micros(200));
        }
        assert_eq!(rtt.retransmit_timer(), MIN_RETRANSMIT_TIMER);
    }
}
