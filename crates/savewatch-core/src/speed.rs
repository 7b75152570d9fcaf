//! Windowed speed estimation for a monotonically growing counter.
//!
//! Samples arrive at irregular intervals (whenever the game saves), so the
//! estimator keeps a short time-bounded history and linearly interpolates
//! the counter's value one minute before the newest sample. The delta
//! between the two is reported as the counter's one-minute change.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};

use crate::interpolate::linear_interpolate;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Samples older than this (relative to the newest one) are evicted.
pub const RETENTION_WINDOW: TimeDelta = TimeDelta::minutes(2);

/// The delta is measured against the interpolated value this far back.
pub const DELTA_WINDOW: TimeDelta = TimeDelta::minutes(1);

/// One counter observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: i64,
}

/// One-minute delta estimator over a 2-minute sample history.
#[derive(Debug, Default)]
pub struct SpeedEstimator {
    history: VecDeque<Sample>,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample and estimate the counter's change over the last minute.
    ///
    /// Returns `None` until the history spans the one-minute mark on both
    /// sides (no sample at or before it, or none at or after it).
    ///
    /// Samples are appended as given. An out-of-order timestamp is kept in
    /// arrival order and only affects which samples are evicted and found.
    pub fn add(&mut self, value: i64, timestamp: DateTime<Utc>) -> Option<i64> {
        self.history.push_back(Sample { timestamp, value });

        let cutoff = timestamp - RETENTION_WINDOW;
        while self
            .history
            .front()
            .is_some_and(|sample| sample.timestamp < cutoff)
        {
            self.history.pop_front();
        }

        let target = timestamp - DELTA_WINDOW;
        let mut before: Option<&Sample> = None;
        let mut after: Option<&Sample> = None;
        for sample in &self.history {
            if sample.timestamp <= target {
                before = Some(sample);
            }
            if sample.timestamp >= target && after.is_none() {
                after = Some(sample);
            }
        }

        let (before, after) = (before?, after?);
        let interpolated = linear_interpolate(
            before.timestamp,
            before.value as f64,
            after.timestamp,
            after.value as f64,
            target,
        );
        Some((value as f64 - interpolated).trunc() as i64)
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Retained samples, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.history.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_interpolated_delta_scenario() {
        let mut speed = SpeedEstimator::new();
        assert_eq!(speed.add(100, at(0)), None);
        assert_eq!(speed.add(130, at(30)), None);
        // target = 0s: exact hit on the first sample
        assert_eq!(speed.add(160, at(60)), Some(60));
        // target = 5s: between (0, 100) and (30, 130) → 105
        assert_eq!(speed.add(166, at(65)), Some(61));
    }

    #[test]
    fn test_no_estimate_before_one_minute() {
        let mut speed = SpeedEstimator::new();
        assert_eq!(speed.add(1, at(0)), None);
        assert_eq!(speed.add(2, at(20)), None);
        assert_eq!(speed.add(3, at(59)), None);
        assert_eq!(speed.len(), 3);
    }

    #[test]
    fn test_single_sample_on_target_serves_both_sides() {
        let mut speed = SpeedEstimator::new();
        speed.add(500, at(0));
        assert_eq!(speed.add(560, at(60)), Some(60));
    }

    #[test]
    fn test_eviction_after_gap() {
        let mut speed = SpeedEstimator::new();
        speed.add(10, at(0));
        speed.add(20, at(30));
        // 5 minute gap: everything older than 2 minutes goes
        assert_eq!(speed.add(30, at(330)), None);
        assert_eq!(speed.len(), 1);

        let newest = at(330);
        assert!(
            speed
                .samples()
                .all(|s| s.timestamp >= newest - RETENTION_WINDOW)
        );
    }

    #[test]
    fn test_sample_exactly_at_retention_edge_is_kept() {
        let mut speed = SpeedEstimator::new();
        speed.add(0, at(0));
        speed.add(120, at(120));
        assert_eq!(speed.len(), 2);
        speed.add(121, at(121));
        assert_eq!(speed.len(), 2);
    }

    #[test]
    fn test_gap_straddling_target_gives_no_estimate() {
        let mut speed = SpeedEstimator::new();
        speed.add(0, at(50));
        // target = 40s: nothing at or before it
        assert_eq!(speed.add(10, at(100)), None);

        let mut speed = SpeedEstimator::new();
        speed.add(0, at(0));
        speed.add(10, at(10));
        // target = 40s: before = 10s, after = the new sample itself
        // 10 + (20 - 10) * (30 / 90) = 13.33.. → 20 - 13.33.. = 6.66.. → 6
        assert_eq!(speed.add(20, at(100)), Some(6));
    }

    #[test]
    fn test_delta_truncates_toward_zero() {
        let mut speed = SpeedEstimator::new();
        speed.add(0, at(0));
        speed.add(3, at(90));
        // target = 60s → interpolated 2.0 → 10 - 2 = 8
        assert_eq!(speed.add(10, at(120)), Some(8));

        let mut speed = SpeedEstimator::new();
        speed.add(0, at(0));
        speed.add(1, at(90));
        // target = 60s → interpolated 0.666.. → 0.333.. truncated to 0
        assert_eq!(speed.add(1, at(120)), Some(0));

        let mut speed = SpeedEstimator::new();
        speed.add(0, at(0));
        speed.add(1, at(90));
        // falling counter: 0 - 0.666.. = -0.666.. truncated to 0
        assert_eq!(speed.add(0, at(120)), Some(0));
    }

    #[test]
    fn test_out_of_order_samples_keep_arrival_order() {
        let mut speed = SpeedEstimator::new();
        assert_eq!(speed.add(100, at(100)), None);
        assert_eq!(speed.add(50, at(10)), None);
        // 10s sample sits behind the front, so it survives eviction and is the
        // last one at or before 140s: 200 - (50 + 150 * 130 / 190) = 47.36..
        assert_eq!(speed.add(200, at(200)), Some(47));
        assert_eq!(speed.len(), 3);
        assert_eq!(speed.add(10, at(0)), None);
        assert_eq!(speed.len(), 4);

        // eviction stops at the first sample inside the window (200s), so the
        // 0s sample behind it is kept; the target lands on 200s exactly
        assert_eq!(speed.add(300, at(260)), Some(100));
        let kept: Vec<i64> = speed.samples().map(|s| s.value).collect();
        assert_eq!(kept, vec![200, 10, 300]);
    }
}
