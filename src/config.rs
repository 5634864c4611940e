//! Configuration for the trip tracker.
//!
//! All structs deserialize from JSON with per-field defaults, so a config
//! file only needs to name the values it overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, TrackerError};

/// Stream subscription settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Prefix joined with the trip id to form the channel name.
    /// Default: "trip-location."
    pub channel_prefix: String,

    /// Buffered location events between the forwarding task and the session.
    /// Default: 256
    pub buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "trip-location.".to_string(),
            buffer_size: 256,
        }
    }
}

impl StreamConfig {
    pub fn channel_for(&self, trip_id: &str) -> String {
        format!("{}{}", self.channel_prefix, trip_id)
    }
}

/// Dwell detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopConfig {
    /// Minimum time inside the radius to count as a stop.
    /// Default: 180000 ms (3 minutes)
    pub min_duration_ms: i64,

    /// Cluster radius around the anchor fix.
    /// Default: 0.1 km (absorbs GPS jitter of a parked truck)
    pub radius_km: f64,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            min_duration_ms: 180_000,
            radius_km: 0.1,
        }
    }
}

/// Geocoding and routing pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Country name appended to the first query variant.
    /// Default: "India"
    pub country: String,

    /// ISO country code filter passed to the geocoder.
    /// Default: "in"
    pub country_code: String,

    /// Minimum spacing between consecutive geocoding calls.
    /// Default: 1100 ms (Nominatim allows 1 req/s)
    pub call_spacing_ms: u64,

    /// Automatic pipeline runs before only an explicit retry can restart it.
    /// Default: 1
    pub max_auto_attempts: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            country: "India".to_string(),
            country_code: "in".to_string(),
            call_spacing_ms: 1100,
            max_auto_attempts: 1,
        }
    }
}

impl ResolverConfig {
    pub fn call_spacing(&self) -> Duration {
        Duration::from_millis(self.call_spacing_ms)
    }
}

/// Camera behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    /// Padding in pixels around fitted bounds.
    /// Default: 50
    pub fit_padding: u32,

    /// Zoom used when recentering on the live marker.
    /// Default: 15
    pub fly_to_zoom: u8,

    /// History growth (points) after which a location update re-fits
    /// instead of panning.
    /// Default: 3
    pub refit_growth: usize,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            fit_padding: 50,
            fly_to_zoom: 15,
            refit_growth: 3,
        }
    }
}

/// Top-level configuration for a trip session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub stream: StreamConfig,
    pub stops: StopConfig,
    pub resolver: ResolverConfig,
    pub viewport: ViewportConfig,

    /// New points required before stats and stops are recomputed.
    /// Growth must strictly exceed this. Default: 3
    pub recompute_growth: usize,

    /// Whether the refresh hook fires while the trip is active.
    /// Default: true
    pub auto_refresh: bool,

    /// Refresh hook interval.
    /// Default: 30000 ms
    pub refresh_interval_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            stops: StopConfig::default(),
            resolver: ResolverConfig::default(),
            viewport: ViewportConfig::default(),
            recompute_growth: 3,
            auto_refresh: true,
            refresh_interval_ms: 30_000,
        }
    }
}

impl TrackerConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| TrackerError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| TrackerError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_json_str(&json)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if !(self.stops.radius_km.is_finite() && self.stops.radius_km > 0.0) {
            return Err(TrackerError::Config {
                message: format!("stops.radius_km must be positive, got {}", self.stops.radius_km),
            });
        }
        if self.stops.min_duration_ms < 0 {
            return Err(TrackerError::Config {
                message: "stops.min_duration_ms must not be negative".to_string(),
            });
        }
        if self.refresh_interval_ms == 0 {
            return Err(TrackerError::Config {
                message: "refresh_interval_ms must be non-zero".to_string(),
            });
        }
        if self.stream.buffer_size == 0 {
            return Err(TrackerError::Config {
                message: "stream.buffer_size must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.stops.min_duration_ms, 180_000);
        assert_eq!(config.stops.radius_km, 0.1);
        assert_eq!(config.resolver.call_spacing(), Duration::from_millis(1100));
        assert_eq!(config.stream.channel_for("42"), "trip-location.42");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            TrackerConfig::from_json_str(r#"{"stops":{"radius_km":0.25},"auto_refresh":false}"#)
                .unwrap();
        assert_eq!(config.stops.radius_km, 0.25);
        assert_eq!(config.stops.min_duration_ms, 180_000);
        assert!(!config.auto_refresh);
        assert_eq!(config.viewport.fit_padding, 50);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = TrackerConfig::from_json_str(r#"{"stops":{"radius_km":-1.0}}"#).unwrap_err();
        assert!(matches!(err, TrackerError::Config { .. }));

        let err = TrackerConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, TrackerError::Config { .. }));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        std::fs::write(&path, r#"{"resolver":{"country":"Kenya","country_code":"ke"}}"#).unwrap();

        let config = TrackerConfig::from_file(&path).unwrap();
        assert_eq!(config.resolver.country, "Kenya");
        assert_eq!(config.resolver.call_spacing_ms, 1100);

        let missing = TrackerConfig::from_file(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(TrackerError::Config { .. })));
    }
}
