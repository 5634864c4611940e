//! # Stop Detection
//!
//! Radius-based dwell detection over a trip track.
//!
//! A cluster is anchored at its first fix and grows while later fixes stay
//! within `radius_km` of that anchor. When a fix leaves the radius, the
//! cluster closes; if it lasted at least `min_duration_ms` it becomes a
//! [`StopEvent`] located at the mean of its fixes. Position jitter while
//! parked stays inside the radius, so one stop is not split in several.
//!
//! Detection is stateless: every call recomputes from the whole track.

use log::debug;

use crate::geo_utils::{compute_center, point_distance};
use crate::{LocationPoint, StopConfig, StopEvent};

/// Detect dwell events in a track.
///
/// Only timestamped points participate; fewer than three yields no stops.
pub fn detect_stops(points: &[LocationPoint], config: &StopConfig) -> Vec<StopEvent> {
    let timed: Vec<(LocationPoint, i64)> = points
        .iter()
        .filter_map(|p| p.timestamp.map(|ts| (*p, ts)))
        .collect();

    if timed.len() < 3 {
        return Vec::new();
    }

    let n = timed.len();
    let mut stops = Vec::new();
    let mut cluster_start = 0;

    for i in 1..n {
        let anchor = &timed[cluster_start].0;
        if point_distance(anchor, &timed[i].0) > config.radius_km {
            if let Some(stop) = close_cluster(&timed[cluster_start..i], config) {
                stops.push(stop);
            }
            cluster_start = i;
        }
    }

    if cluster_start < n - 1 {
        if let Some(stop) = close_cluster(&timed[cluster_start..], config) {
            stops.push(stop);
        }
    }

    debug!(
        "[StopDetector] {} stops from {} timed points",
        stops.len(),
        n
    );
    stops
}

/// Emit a stop for the cluster if it lasted long enough.
fn close_cluster(cluster: &[(LocationPoint, i64)], config: &StopConfig) -> Option<StopEvent> {
    let (_, start_time) = *cluster.first()?;
    let (_, end_time) = *cluster.last()?;
    let elapsed = end_time.saturating_sub(start_time);
    if elapsed < config.min_duration_ms {
        return None;
    }

    let members: Vec<LocationPoint> = cluster.iter().map(|(p, _)| *p).collect();
    let centroid = compute_center(&members);

    Some(StopEvent {
        lat: centroid.lat,
        lng: centroid.lng,
        start_time,
        end_time,
        duration: elapsed,
    })
}
