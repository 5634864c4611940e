//! # Trip Tracker
//!
//! Real-time trip location stream and geospatial analytics for fleet
//! dashboards.
//!
//! This library provides:
//! - A per-trip location stream client over a pluggable pub/sub transport
//! - Track reconciliation (dedupe, stale rejection, current location)
//! - Distance and speed statistics over the live track
//! - Radius-based dwell (stop) detection
//! - Pickup/delivery geocoding and planned-route resolution with fallback
//! - A camera state machine for auto-fit vs. user-driven viewports
//!
//! ## Features
//!
//! - **`http`** - Enable Nominatim geocoding and OSRM routing providers
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use trip_tracker::{detect_stops, LocationPoint, StopConfig};
//!
//! let t0 = 1_700_000_000_000;
//! let track = vec![
//!     LocationPoint::with_time(12.9000, 80.1000, t0),
//!     LocationPoint::with_time(12.9003, 80.1003, t0 + 60_000),
//!     LocationPoint::with_time(12.9005, 80.1005, t0 + 185_000),
//! ];
//!
//! let stops = detect_stops(&track, &StopConfig::default());
//! assert_eq!(stops.len(), 1);
//! assert_eq!(stops[0].duration, 185_000);
//! ```

use geo::{BoundingRect, MultiPoint, Point};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{Result, TrackerError};

// Configuration (serde structs with defaults, loadable from JSON)
pub mod config;
pub use config::{ResolverConfig, StopConfig, StreamConfig, TrackerConfig, ViewportConfig};

// Geographic utilities (haversine, cumulative distance, bounds)
pub mod geo_utils;
pub use geo_utils::{cumulative_distance, haversine};

// Distance/speed statistics
pub mod stats;
pub use stats::{compute_stats, TripStats};

// Track reconciliation
pub mod track;
pub use track::{AppendOutcome, RejectReason, TrackReconciler};

// Dwell detection
pub mod stops;
pub use stops::detect_stops;

// Real-time location stream
pub mod stream;
pub use stream::{
    ConnectionState, LocalTransport, LocationStreamClient, LocationTransport, Subscription,
    SubscriptionId, TransportEvent,
};

// Geocode + planned route pipeline
pub mod route;
pub use route::{
    DelayStep, Geocoder, Liveness, Pacer, ResolveStage, ResolverStatus, RouteProvider,
    RouteResolver, TokioPacer,
};

// Camera state machine
pub mod viewport;
pub use viewport::{CameraCommand, ViewportController, ViewportMode};

// Per-trip session owner
pub mod session;
pub use session::{EmptyState, RefreshTimer, RenderLayers, SessionUpdate, TripSession};

// HTTP providers for geocoding and routing
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{NominatimGeocoder, OsrmRouteProvider};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS fix belonging to a trip track.
///
/// # Example
/// ```
/// use trip_tracker::LocationPoint;
/// let point = LocationPoint::new(12.9716, 77.5946); // Bengaluru
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationPoint {
    pub lat: f64,
    pub lng: f64,
    /// Unix timestamp in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Ground speed in m/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Horizontal accuracy in meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl LocationPoint {
    /// Create a point without timestamp, speed or accuracy.
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            timestamp: None,
            speed: None,
            accuracy: None,
        }
    }

    /// Create a timestamped point.
    pub fn with_time(lat: f64, lng: f64, timestamp: i64) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..Self::new(lat, lng)
        }
    }

    /// Builder-style speed setter (m/s).
    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && self.lat >= -90.0
            && self.lat <= 90.0
            && self.lng >= -180.0
            && self.lng <= 180.0
    }

    /// `[lat, lng]` pair as handed to the rendering surface.
    pub fn lat_lng(&self) -> [f64; 2] {
        [self.lat, self.lng]
    }
}

/// Timestamp as it may arrive on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl WireTimestamp {
    /// Normalize to Unix milliseconds. Unparseable text yields `None`.
    pub fn to_millis(&self) -> Option<i64> {
        match self {
            WireTimestamp::Millis(ms) => Some(*ms),
            WireTimestamp::Fractional(ms) if ms.is_finite() => Some(ms.round() as i64),
            WireTimestamp::Fractional(_) => None,
            WireTimestamp::Text(text) => {
                if let Ok(ms) = text.parse::<i64>() {
                    return Some(ms);
                }
                chrono::DateTime::parse_from_rfc3339(text)
                    .ok()
                    .map(|dt| dt.timestamp_millis())
            }
        }
    }
}

/// Raw location event as delivered on a trip channel.
///
/// Every field is optional so that malformed events deserialize and can be
/// rejected by the reconciler instead of failing the whole stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    #[serde(default, alias = "latitude")]
    pub lat: Option<f64>,
    #[serde(default, alias = "longitude", alias = "lon")]
    pub lng: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl LocationUpdate {
    /// Convenience constructor for a well-formed timestamped update.
    pub fn new(lat: f64, lng: f64, timestamp: i64) -> Self {
        Self {
            lat: Some(lat),
            lng: Some(lng),
            timestamp: Some(WireTimestamp::Millis(timestamp)),
            speed: None,
            accuracy: None,
        }
    }

    /// Parse an event payload. Unknown fields are ignored.
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| TrackerError::MalformedPoint {
            reason: format!("invalid payload: {}", e),
        })
    }

    /// Convert to a track point, or explain why it cannot be one.
    pub fn to_point(&self) -> std::result::Result<LocationPoint, String> {
        let (lat, lng) = match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => (lat, lng),
            (None, _) => return Err("missing lat".to_string()),
            (_, None) => return Err("missing lng".to_string()),
        };
        let timestamp = self.timestamp.as_ref().and_then(WireTimestamp::to_millis);
        if let Some(ms) = timestamp {
            if chrono::DateTime::from_timestamp_millis(ms).is_none() {
                return Err(format!("timestamp out of range ({})", ms));
            }
        }
        let point = LocationPoint {
            lat,
            lng,
            timestamp,
            speed: self.speed.filter(|s| s.is_finite() && *s >= 0.0),
            accuracy: self.accuracy,
        };
        if !point.is_valid() {
            return Err(format!("coordinates out of range ({}, {})", lat, lng));
        }
        Ok(point)
    }
}

impl From<LocationPoint> for LocationUpdate {
    fn from(p: LocationPoint) -> Self {
        Self {
            lat: Some(p.lat),
            lng: Some(p.lng),
            timestamp: p.timestamp.map(WireTimestamp::Millis),
            speed: p.speed,
            accuracy: p.accuracy,
        }
    }
}

/// Pickup or delivery location. May start without coordinates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl Endpoint {
    /// Endpoint with known coordinates.
    pub fn at(lat: f64, lng: f64) -> Self {
        Self {
            lat: Some(lat),
            lng: Some(lng),
            ..Self::default()
        }
    }

    /// Coordinate-less endpoint described by its postal fields.
    pub fn place(city: &str, state: Option<&str>, address: Option<&str>) -> Self {
        Self {
            city: Some(city.to_string()),
            state: state.map(str::to_string),
            address: address.map(str::to_string),
            ..Self::default()
        }
    }

    /// Coordinates as a point, if both are known.
    pub fn coords(&self) -> Option<LocationPoint> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(LocationPoint::new(lat, lng)),
            _ => None,
        }
    }

    pub fn has_coords(&self) -> bool {
        self.coords().is_some()
    }

    /// Whether geocoding has anything to work with.
    pub fn is_geocodable(&self) -> bool {
        let non_empty = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.trim().is_empty());
        non_empty(&self.city) || non_empty(&self.address)
    }
}

/// A detected dwell interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopEvent {
    /// Centroid latitude
    pub lat: f64,
    /// Centroid longitude
    pub lng: f64,
    /// First fix of the dwell (Unix ms)
    pub start_time: i64,
    /// Last fix of the dwell (Unix ms)
    pub end_time: i64,
    /// `end_time - start_time` in milliseconds
    pub duration: i64,
}

/// Planned route between pickup and delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedRoute {
    /// Ordered `[lat, lng]` pairs
    pub polyline: Vec<[f64; 2]>,
    pub distance_meters: Option<f64>,
    pub duration_seconds: Option<f64>,
    /// True when this is the straight pickup→delivery line
    #[serde(default)]
    pub is_fallback: bool,
}

impl PlannedRoute {
    /// Straight two-point line used whenever routing fails.
    pub fn straight_line(pickup: &LocationPoint, delivery: &LocationPoint) -> Self {
        Self {
            polyline: vec![pickup.lat_lng(), delivery.lat_lng()],
            distance_meters: None,
            duration_seconds: None,
            is_fallback: true,
        }
    }
}

/// Trip phase signal consumed from the surrounding application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TripPhase {
    /// Trip not started yet
    #[default]
    Pre,
    /// Trip in progress
    Active,
    /// Trip finished
    Post,
}

impl TripPhase {
    /// Analytics (stats, stops) only make sense once the trip has started.
    pub fn has_analytics(&self) -> bool {
        matches!(self, TripPhase::Active | TripPhase::Post)
    }
}

/// Bounding box for a set of points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from points. `None` when the slice is empty.
    pub fn from_points(points: &[LocationPoint]) -> Option<Self> {
        let multi: MultiPoint<f64> = points.iter().map(|p| Point::new(p.lng, p.lat)).collect();
        let rect = multi.bounding_rect()?;
        Some(Self {
            min_lat: rect.min().y,
            max_lat: rect.max().y,
            min_lng: rect.min().x,
            max_lng: rect.max().x,
        })
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> LocationPoint {
        LocationPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    pub fn contains(&self, p: &LocationPoint) -> bool {
        p.lat >= self.min_lat
            && p.lat <= self.max_lat
            && p.lng >= self.min_lng
            && p.lng <= self.max_lng
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_validation() {
        assert!(LocationPoint::new(12.9716, 77.5946).is_valid());
        assert!(!LocationPoint::new(91.0, 0.0).is_valid());
        assert!(!LocationPoint::new(0.0, 181.0).is_valid());
        assert!(!LocationPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_update_parses_millis_and_rfc3339() {
        let ms = LocationUpdate::from_json(r#"{"lat":12.9,"lng":80.1,"timestamp":1700000000000}"#)
            .unwrap();
        assert_eq!(ms.to_point().unwrap().timestamp, Some(1_700_000_000_000));

        let text = LocationUpdate::from_json(
            r#"{"lat":12.9,"lng":80.1,"timestamp":"2023-11-14T22:13:20Z","speed":12.5}"#,
        )
        .unwrap();
        let point = text.to_point().unwrap();
        assert_eq!(point.timestamp, Some(1_700_000_000_000));
        assert_eq!(point.speed, Some(12.5));
    }

    #[test]
    fn test_update_accepts_latitude_longitude_aliases() {
        let update =
            LocationUpdate::from_json(r#"{"latitude":12.9,"longitude":80.1}"#).unwrap();
        let point = update.to_point().unwrap();
        assert_eq!(point.lat, 12.9);
        assert_eq!(point.lng, 80.1);
        assert_eq!(point.timestamp, None);
    }

    #[test]
    fn test_update_missing_coords_is_rejected() {
        let update = LocationUpdate::from_json(r#"{"lng":80.1,"timestamp":1}"#).unwrap();
        assert_eq!(update.to_point().unwrap_err(), "missing lat");

        let update = LocationUpdate::from_json(r#"{"lat":12.9}"#).unwrap();
        assert_eq!(update.to_point().unwrap_err(), "missing lng");
    }

    #[test]
    fn test_update_garbage_timestamp_becomes_none() {
        let update =
            LocationUpdate::from_json(r#"{"lat":1.0,"lng":2.0,"timestamp":"yesterday"}"#).unwrap();
        assert_eq!(update.to_point().unwrap().timestamp, None);
    }

    #[test]
    fn test_update_extreme_timestamp_is_rejected() {
        let early = LocationUpdate::from_json(
            r#"{"lat":12.9,"lng":80.1,"timestamp":-9223372036854775807}"#,
        )
        .unwrap();
        assert!(early.to_point().unwrap_err().starts_with("timestamp out of range"));

        let late = LocationUpdate::new(12.9, 80.1, i64::MAX);
        assert!(late.to_point().is_err());

        let mut track = TrackReconciler::default();
        assert!(!track.append(&early).is_accepted());
        assert!(!track.append(&late).is_accepted());
        assert!(track.is_empty());
    }

    #[test]
    fn test_endpoint_helpers() {
        let known = Endpoint::at(12.9, 80.1);
        assert!(known.has_coords());

        let place = Endpoint::place("Chennai", Some("Tamil Nadu"), None);
        assert!(!place.has_coords());
        assert!(place.is_geocodable());

        let blank = Endpoint {
            city: Some("  ".into()),
            ..Endpoint::default()
        };
        assert!(!blank.is_geocodable());
    }

    #[test]
    fn test_bounds_from_points() {
        let points = vec![
            LocationPoint::new(12.90, 80.10),
            LocationPoint::new(12.95, 80.05),
            LocationPoint::new(12.92, 80.20),
        ];
        let bounds = Bounds::from_points(&points).unwrap();
        assert_eq!(bounds.min_lat, 12.90);
        assert_eq!(bounds.max_lat, 12.95);
        assert_eq!(bounds.min_lng, 80.05);
        assert_eq!(bounds.max_lng, 80.20);
        assert!(bounds.contains(&bounds.center()));
        assert!(Bounds::from_points(&[]).is_none());
    }

    #[test]
    fn test_stop_event_serializes_camel_case() {
        let stop = StopEvent {
            lat: 1.0,
            lng: 2.0,
            start_time: 10,
            end_time: 20,
            duration: 10,
        };
        let json = serde_json::to_string(&stop).unwrap();
        assert!(json.contains("\"startTime\":10"));
        assert!(json.contains("\"endTime\":20"));
    }
}
