//! Linear interpolation between two timestamped values.

use chrono::{DateTime, TimeDelta, Utc};

/// Value at `target` on the line through `(t0, v0)` and `(t1, v1)`.
///
/// Returns `v0` when `t1 <= t0`: a zero-length or inverted interval has no
/// slope, and out-of-order samples land here.
pub fn linear_interpolate(
    t0: DateTime<Utc>,
    v0: f64,
    t1: DateTime<Utc>,
    v1: f64,
    target: DateTime<Utc>,
) -> f64 {
    if t1 <= t0 {
        return v0;
    }
    let ratio = seconds(target - t0) / seconds(t1 - t0);
    v0 + (v1 - v0) * ratio
}

/// Fractional seconds with microsecond resolution.
fn seconds(delta: TimeDelta) -> f64 {
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_seconds() as f64,
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
    fn test_endpoints() {
        assert_eq!(linear_interpolate(at(0), 100.0, at(30), 130.0, at(0)), 100.0);
        assert_eq!(linear_interpolate(at(0), 100.0, at(30), 130.0, at(30)), 130.0);
    }

    #[test]
    fn test_midpoint_and_fraction() {
        assert_eq!(linear_interpolate(at(0), 100.0, at(30), 130.0, at(15)), 115.0);
        assert_eq!(linear_interpolate(at(0), 100.0, at(30), 130.0, at(5)), 105.0);
    }

    #[test]
    fn test_monotonic_between_endpoints() {
        let mut prev = f64::MIN;
        for s in 0..=60 {
            let v = linear_interpolate(at(0), 10.0, at(60), 500.0, at(s));
            assert!(v >= prev, "not monotonic at {s}s: {v} < {prev}");
            prev = v;
        }

        let mut prev = f64::MAX;
        for s in 0..=60 {
            let v = linear_interpolate(at(0), 500.0, at(60), 10.0, at(s));
            assert!(v <= prev);
            prev = v;
        }
    }

    #[test]
    fn test_degenerate_interval_returns_first_value() {
        assert_eq!(linear_interpolate(at(10), 7.0, at(10), 99.0, at(10)), 7.0);
        assert_eq!(linear_interpolate(at(10), 7.0, at(5), 99.0, at(7)), 7.0);
        assert_eq!(linear_interpolate(at(10), 7.0, at(5), 99.0, at(1000)), 7.0);
    }

    #[test]
    fn test_sub_second_precision() {
        let t1 = at(1) + TimeDelta::milliseconds(0);
        let target = at(0) + TimeDelta::milliseconds(250);
        assert_eq!(linear_interpolate(at(0), 0.0, t1, 4.0, target), 1.0);
    }
}
