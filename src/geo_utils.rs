//! Geographic utilities: great-circle distance, track length, bounds.
//!
//! Distances here are in kilometres on a sphere of radius 6371 km, which is
//! what the dashboard reports to dispatchers.

use crate::{Bounds, LocationPoint};

/// Mean Earth radius used for all distance calculations.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres between two lat/lng pairs.
///
/// # Example
/// ```
/// use trip_tracker::haversine;
/// // Chennai to Bengaluru is roughly 290 km as the crow flies
/// let d = haversine(13.0827, 80.2707, 12.9716, 77.5946);
/// assert!((d - 290.0).abs() < 10.0);
/// ```
pub fn haversine(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// [`haversine`] over two points.
#[inline]
pub fn point_distance(a: &LocationPoint, b: &LocationPoint) -> f64 {
    haversine(a.lat, a.lng, b.lat, b.lng)
}

/// Sum of great-circle distances between consecutive points, in km.
/// Returns 0 for fewer than two points.
pub fn cumulative_distance(points: &[LocationPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| point_distance(&w[0], &w[1]))
        .sum()
}

/// Bounding box of a point set.
pub fn compute_bounds(points: &[LocationPoint]) -> Option<Bounds> {
    Bounds::from_points(points)
}

/// Arithmetic mean of coordinates. Returns (0, 0) for an empty slice.
pub fn compute_center(points: &[LocationPoint]) -> LocationPoint {
    if points.is_empty() {
        return LocationPoint::new(0.0, 0.0);
    }
    let n = points.len() as f64;
    let (lat_sum, lng_sum) = points
        .iter()
        .fold((0.0, 0.0), |(lat, lng), p| (lat + p.lat, lng + p.lng));
    LocationPoint::new(lat_sum / n, lng_sum / n)
}
