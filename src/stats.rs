//! Distance and speed statistics over a trip track.

use serde::{Deserialize, Serialize};

use crate::geo_utils::cumulative_distance;
use crate::LocationPoint;

/// m/s to km/h
const MS_TO_KMH: f64 = 3.6;
const MS_PER_HOUR: f64 = 3_600_000.0;

/// Aggregate statistics for the reconciled track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripStats {
    /// Total travelled distance over all points, in km
    pub distance_km: f64,
    /// Span between the earliest and latest timestamp, in ms
    pub elapsed_ms: i64,
    /// `distance_km / elapsed hours`, 0 when no time has elapsed
    pub avg_speed_kmh: f64,
    /// Highest reported device speed, 0 when no point carries one
    pub max_speed_kmh: f64,
}

impl TripStats {
    pub fn elapsed_hours(&self) -> f64 {
        self.elapsed_ms as f64 / MS_PER_HOUR
    }
}

/// Compute statistics for a track.
///
/// Requires at least two timestamped points, otherwise returns `None`.
/// Untimed points still count toward distance but not elapsed time.
pub fn compute_stats(points: &[LocationPoint]) -> Option<TripStats> {
    let mut timestamps = points.iter().filter_map(|p| p.timestamp);
    let first = timestamps.next()?;
    let (mut min_ts, mut max_ts, mut timed) = (first, first, 1usize);
    for ts in timestamps {
        min_ts = min_ts.min(ts);
        max_ts = max_ts.max(ts);
        timed += 1;
    }
    if timed < 2 {
        return None;
    }

    let distance_km = cumulative_distance(points);
    let elapsed_ms = max_ts.saturating_sub(min_ts);
    let avg_speed_kmh = if elapsed_ms > 0 {
        distance_km / (elapsed_ms as f64 / MS_PER_HOUR)
    } else {
        0.0
    };
    let max_speed_kmh = points
        .iter()
        .filter_map(|p| p.speed)
        .map(|s| s * MS_TO_KMH)
        .fold(0.0, f64::max);

    Some(TripStats {
        distance_km,
        elapsed_ms,
        avg_speed_kmh,
        max_speed_kmh,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_two_timestamped_points() {
        assert!(compute_stats(&[]).is_none());
        assert!(compute_stats(&[LocationPoint::with_time(0.0, 0.0, 0)]).is_none());

        // Two points but only one timestamp
        let track = vec![
            LocationPoint::with_time(0.0, 0.0, 0),
            LocationPoint::new(0.1, 0.0),
        ];
        assert!(compute_stats(&track).is_none());
    }

    #[test]
    fn test_average_speed() {
        // ~111.19 km in one hour
        let track = vec![
            LocationPoint::with_time(0.0, 0.0, 0),
            LocationPoint::with_time(1.0, 0.0, 3_600_000),
        ];
        let stats = compute_stats(&track).unwrap();
        assert_eq!(stats.elapsed_ms, 3_600_000);
        assert!((stats.avg_speed_kmh - 111.19).abs() < 0.01);
        assert_eq!(stats.elapsed_hours(), 1.0);
    }

    #[test]
    fn test_zero_elapsed_gives_zero_average() {
        let track = vec![
            LocationPoint::with_time(0.0, 0.0, 5),
            LocationPoint::with_time(0.01, 0.0, 5),
        ];
        let stats = compute_stats(&track).unwrap();
        assert_eq!(stats.elapsed_ms, 0);
        assert_eq!(stats.avg_speed_kmh, 0.0);
        assert!(stats.distance_km > 0.0);
    }

    #[test]
    fn test_untimed_points_count_toward_distance_only() {
        let track = vec![
            LocationPoint::with_time(0.0, 0.0, 0),
            LocationPoint::new(1.0, 0.0),
            LocationPoint::with_time(2.0, 0.0, 7_200_000),
        ];
        let stats = compute_stats(&track).unwrap();
        assert!((stats.distance_km - 2.0 * 111.19).abs() < 0.05);
        assert_eq!(stats.elapsed_ms, 7_200_000);
    }

    #[test]
    fn test_elapsed_uses_min_and_max() {
        // Timestamps not in arrival order
        let track = vec![
            LocationPoint::with_time(0.0, 0.0, 60_000),
            LocationPoint::with_time(0.0, 0.001, 0),
            LocationPoint::with_time(0.0, 0.002, 30_000),
        ];
        assert_eq!(compute_stats(&track).unwrap().elapsed_ms, 60_000);
    }

    #[test]
    fn test_max_speed() {
        let track = vec![
            LocationPoint::with_time(0.0, 0.0, 0).speed(10.0),
            LocationPoint::with_time(0.0, 0.001, 1_000),
            LocationPoint::with_time(0.0, 0.002, 2_000).speed(25.0),
        ];
        let stats = compute_stats(&track).unwrap();
        assert!((stats.max_speed_kmh - 90.0).abs() < 1e-9);

        let no_speed = vec![
            LocationPoint::with_time(0.0, 0.0, 0),
            LocationPoint::with_time(0.0, 0.001, 1_000),
        ];
        assert_eq!(compute_stats(&no_speed).unwrap().max_speed_kmh, 0.0);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let track = vec![
            LocationPoint::with_time(12.9, 80.1, i64::MIN + 1),
            LocationPoint::with_time(12.9, 80.1, i64::MAX),
        ];
        let stats = compute_stats(&track).unwrap();
        assert_eq!(stats.elapsed_ms, i64::MAX);
        assert!(stats.avg_speed_kmh >= 0.0);
    }
}
