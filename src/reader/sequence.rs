//! Timestamp continuity tracking
//!
//! Classifies every validated record against the last accepted timestamp.
//! The baseline only moves forward: duplicates and late records are counted
//! and dropped without touching it.

use super::record::constants::SAMPLING_PERIOD_US;

/// Continuity classification of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// Next expected record (or the first one)
    Fresh,
    /// Same timestamp as the last accepted record
    Duplicate,
    /// Older than the last accepted record
    OutOfOrder,
    /// Newer, but further away than the jitter tolerance allows
    Gap { missed: u64 },
}

impl Continuity {
    /// Whether the record continues on to the demultiplexer
    #[inline]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Continuity::Fresh | Continuity::Gap { .. })
    }
}

/// Sequence state for one record stream
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    last_timestamp: Option<u64>,
    sampling_period_us: f64,
    max_allowable_gap_us: u64,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new(SAMPLING_PERIOD_US)
    }
}

impl SequenceTracker {
    /// Create a tracker for the given sampling period (microseconds)
    ///
    /// The tolerance is the truncated period plus one microsecond of slack,
    /// which absorbs the alternating 31/32 µs spacing of a 32 kHz stream.
    pub fn new(sampling_period_us: f64) -> Self {
        Self {
            last_timestamp: None,
            sampling_period_us,
            max_allowable_gap_us: sampling_period_us.trunc() as u64 + 1,
        }
    }

    /// Timestamp of the last accepted record
    pub fn last_timestamp(&self) -> Option<u64> {
        self.last_timestamp
    }

    /// Largest timestamp delta still treated as consecutive
    pub fn max_allowable_gap(&self) -> u64 {
        self.max_allowable_gap_us
    }

    pub fn sampling_period(&self) -> f64 {
        self.sampling_period_us
    }

    /// Classify a timestamp and update the baseline
    pub fn classify(&mut self, timestamp: u64) -> Continuity {
        let Some(last) = self.last_timestamp else {
            self.last_timestamp = Some(timestamp);
            return Continuity::Fresh;
        };

        if timestamp == last {
            return Continuity::Duplicate;
        }
        if timestamp < last {
            return Continuity::OutOfOrder;
        }

        let delta = timestamp - last;
        self.last_timestamp = Some(timestamp);

        if delta <= self.max_allowable_gap_us {
            Continuity::Fresh
        } else {
            let periods = (delta as f64 / self.sampling_period_us).round() as u64;
            Continuity::Gap {
                missed: periods.saturating_sub(1),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Timestamp of the n-th record of an ideal 32 kHz stream
    fn ts(n: u64) -> u64 {
        1_000_000 + (n as f64 * SAMPLING_PERIOD_US).round() as u64
    }

    #[test]
    fn tolerance_is_truncated_period_plus_one() {
        let tracker = SequenceTracker::default();
        assert_eq!(tracker.max_allowable_gap(), 32);
    }

    #[test]
    fn first_record_is_fresh() {
        let mut tracker = SequenceTracker::default();
        assert_eq!(tracker.classify(12345), Continuity::Fresh);
        assert_eq!(tracker.last_timestamp(), Some(12345));
    }

    #[test]
    fn steady_stream_is_all_fresh() {
        let mut tracker = SequenceTracker::default();
        for n in 0..10_000 {
            assert_eq!(tracker.classify(ts(n)), Continuity::Fresh, "record {}", n);
        }
    }

    #[test]
    fn duplicate_keeps_baseline() {
        let mut tracker = SequenceTracker::default();
        tracker.classify(ts(0));
        tracker.classify(ts(1));
        assert_eq!(tracker.classify(ts(1)), Continuity::Duplicate);
        assert_eq!(tracker.last_timestamp(), Some(ts(1)));
        assert_eq!(tracker.classify(ts(2)), Continuity::Fresh);
    }

    #[test]
    fn out_of_order_keeps_baseline() {
        let mut tracker = SequenceTracker::default();
        tracker.classify(ts(0));
        tracker.classify(ts(1));
        tracker.classify(ts(2));
        assert_eq!(tracker.classify(ts(1)), Continuity::OutOfOrder);
        assert_eq!(tracker.last_timestamp(), Some(ts(2)));
    }

    #[test]
    fn gap_counts_missing_periods() {
        for k in 2..20u64 {
            let mut tracker = SequenceTracker::default();
            tracker.classify(ts(0));
            assert_eq!(
                tracker.classify(ts(k)),
                Continuity::Gap { missed: k - 1 },
                "jump of {} periods",
                k
            );
            assert_eq!(tracker.last_timestamp(), Some(ts(k)));
        }
    }

    #[test]
    fn single_period_jump_is_within_tolerance() {
        let mut tracker = SequenceTracker::default();
        tracker.classify(1000);
        assert_eq!(tracker.classify(1032), Continuity::Fresh);
        assert_eq!(tracker.classify(1063), Continuity::Fresh);
    }

    #[test]
    fn just_above_tolerance_is_gap_without_missed_samples() {
        let mut tracker = SequenceTracker::default();
        tracker.classify(1000);
        assert_eq!(tracker.classify(1033), Continuity::Gap { missed: 0 });
    }

    #[test]
    fn accepted_classifications() {
        assert!(Continuity::Fresh.is_accepted());
        assert!(Continuity::Gap { missed: 3 }.is_accepted());
        assert!(!Continuity::Duplicate.is_accepted());
        assert!(!Continuity::OutOfOrder.is_accepted());
    }
}
