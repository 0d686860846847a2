// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The receiver-side acknowledgement ledger.
//!
//! Received packet numbers (and, per stream, received byte offsets) are
//! tracked as disjoint closed intervals over the 62-bit number space.
//! Instead of one entry per value, only the bounds of each contiguous run
//! are stored, ordered from the highest run down, so the most recent range
//! is always at the front.

use std::collections::VecDeque;

/// A closed interval `[start, end]`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    #[inline]
    pub fn contains(&self, value: u64) -> bool {
        self.start <= value && value <= self.end
    }
}

/// An ordered set of disjoint, non-adjacent closed intervals.
///
/// Invariants, checked in debug builds after every mutation:
/// - intervals are disjoint and separated by at least one missing value
/// - the list is ordered from the highest interval to the lowest
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SackList {
    intervals: VecDeque<Interval>,
    /// Largest contiguous range ever held
    block_size_max: u64,
}

impl SackList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Number of disjoint intervals currently held
    #[inline]
    pub fn interval_len(&self) -> usize {
        self.intervals.len()
    }

    /// The highest value present, if any
    #[inline]
    pub fn largest(&self) -> Option<u64> {
        self.intervals.front().map(|interval| interval.end)
    }

    /// The lowest value present, if any
    #[inline]
    pub fn smallest(&self) -> Option<u64> {
        self.intervals.back().map(|interval| interval.start)
    }

    #[inline]
    pub fn block_size_max(&self) -> u64 {
        self.block_size_max
    }

    /// Merges `[min, max]` into the ledger.
    ///
    /// Returns `true` if any value in the range was new.
    pub fn insert(&mut self, min: u64, max: u64) -> bool {
        debug_assert!(min <= max);

        // find the first interval that could touch [min, max]: ordered
        // descending, so skip everything strictly above max + 1
        let mut first = 0;
        while first < self.intervals.len() && self.intervals[first].start > max.saturating_add(1) {
            first += 1;
        }

        // absorb every interval that overlaps or is adjacent
        let mut start = min;
        let mut end = max;
        let mut absorbed_len = 0;
        let mut last = first;
        while last < self.intervals.len() && self.intervals[last].end.saturating_add(1) >= min {
            start = start.min(self.intervals[last].start);
            end = end.max(self.intervals[last].end);
            absorbed_len += self.intervals[last].len();
            last += 1;
        }

        let merged = Interval { start, end };
        let is_new = merged.len() != absorbed_len;

        self.intervals.drain(first..last);
        self.intervals.insert(first, merged);
        self.block_size_max = self.block_size_max.max(merged.len());

        self.check_integrity();
        is_new
    }

    /// Returns whether `value` has been recorded
    #[inline]
    pub fn contains(&self, value: u64) -> bool {
        for interval in &self.intervals {
            if interval.contains(value) {
                return true;
            }
            if interval.end < value {
                break;
            }
        }
        false
    }

    /// Returns whether the whole of `[min, max]` has been recorded, i.e.
    /// the range would be a pure duplicate
    pub fn contains_range(&self, min: u64, max: u64) -> bool {
        self.intervals
            .iter()
            .any(|interval| interval.start <= min && max <= interval.end)
    }

    /// Removes `[min, max]` from the ledger, splitting intervals as needed.
    ///
    /// Used when the peer acknowledges an ACK frame: ranges the peer has
    /// seen no longer need to be advertised.
    pub fn remove(&mut self, min: u64, max: u64) {
        debug_assert!(min <= max);
        let mut result = VecDeque::with_capacity(self.intervals.len());

        for interval in self.intervals.drain(..) {
            if interval.end < min || interval.start > max {
                result.push_back(interval);
                continue;
            }
            if interval.end > max {
                result.push_back(Interval {
                    start: max + 1,
                    end: interval.end,
                });
            }
            if interval.start < min {
                result.push_back(Interval {
                    start: interval.start,
                    end: min - 1,
                });
            }
        }

        self.intervals = result;
        self.check_integrity();
    }

    /// Iterates the intervals from the most recent (highest) down
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = Interval> + '_ {
        self.intervals.iter().copied()
    }

    fn check_integrity(&self) {
        if cfg!(debug_assertions) {
            for pair in self
                .intervals
                .iter()
                .zip(self.intervals.iter().skip(1))
            {
                let (higher, lower) = pair;
                assert!(higher.start <= higher.end);
                assert!(lower.end + 1 < higher.start, "adjacent intervals must merge");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bolero::check;

    #[test]
    fn merge_test() {
        let mut sack = SackList::new();
        assert!(sack.insert(0, 0));
        assert!(sack.insert(1, 1));
        assert!(sack.insert(2, 3));
        assert_eq!(sack.interval_len(), 1);
        assert_eq!(sack.largest(), Some(3));

        assert!(sack.insert(5, 6));
        assert_eq!(sack.interval_len(), 2);

        // filling the hole collapses both runs
        assert!(sack.insert(4, 4));
        assert_eq!(sack.interval_len(), 1);
        assert_eq!(sack.block_size_max(), 7);

        // duplicates are recognized
        assert!(!sack.insert(2, 5));
        assert!(sack.contains_range(0, 6));
        assert!(!sack.contains_range(0, 7));
    }

    #[test]
    fn ordering_test() {
        let mut sack = SackList::new();
        sack.insert(10, 12);
        sack.insert(0, 1);
        sack.insert(5, 6);

        let intervals: Vec<_> = sack.iter().collect();
        assert_eq!(
            intervals,
            vec![
                Interval { start: 10, end: 12 },
                Interval { start: 5, end: 6 },
                Interval { start: 0, end: 1 },
            ]
        );
    }

    #[test]
    fn remove_test() {
        let mut sack = SackList::new();
        sack.insert(0, 10);
        sack.remove(3, 5);
        let intervals: Vec<_> = sack.iter().collect();
        assert_eq!(
            intervals,
            vec![
                Interval { start: 6, end: 10 },
                Interval { start: 0, end: 2 },
            ]
        );

        sack.remove(0, 2);
        assert_eq!(sack.interval_len(), 1);
    }

    /// Membership must agree with a naive bitmap under arbitrary inserts
    #[test]
    fn bitmap_model_test() {
        check!()
            .with_type::<Vec<(u8, u8)>>()
            .for_each(|operations| {
                let mut sack = SackList::new();
                let mut bitmap = [false; 256];

                for (a, b) in operations {
                    let (min, max) = if a <= b { (*a, *b) } else { (*b, *a) };
                    sack.insert(min as u64, max as u64);
                    for value in min..=max {
                        bitmap[value as usize] = true;
                    }
                }

                for (value, expected) in bitmap.iter().enumerate() {
                    assert_eq!(sack.contains(value as u64), *expected);
                }
            });
    }
}
