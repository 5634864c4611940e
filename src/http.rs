//! HTTP providers for geocoding and driving routes.
//!
//! - [`NominatimGeocoder`]: free-text search against a Nominatim instance
//! - [`OsrmRouteProvider`]: driving route with GeoJSON geometry from OSRM
//!
//! Both share a pooled `reqwest` client with a request timeout and an
//! identifying User-Agent (Nominatim's usage policy requires one). A 429 is
//! retried with exponential backoff; any other non-2xx becomes
//! [`TrackerError::Http`].

use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::route::{Geocoder, RouteProvider, RouteResponse};
use crate::{LocationPoint, Result, TrackerError};

pub const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";
pub const DEFAULT_OSRM_URL: &str = "https://router.project-osrm.org";

const USER_AGENT: &str = concat!("trip-tracker/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 3;

fn build_client() -> Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| TrackerError::Http {
            message: format!("Failed to create HTTP client: {}", e),
            status_code: None,
        })
}

fn transport_error(e: reqwest::Error) -> TrackerError {
    TrackerError::Http {
        message: e.to_string(),
        status_code: e.status().map(|s| s.as_u16()),
    }
}

/// Send with 429 backoff (1s, 2s, 4s). Returns a 2xx response or an error.
async fn send_checked(request: RequestBuilder, label: &str) -> Result<Response> {
    let mut retries = 0;
    loop {
        let attempt = request.try_clone().ok_or_else(|| TrackerError::Http {
            message: "request body is not replayable".to_string(),
            status_code: None,
        })?;
        let resp = attempt.send().await.map_err(transport_error)?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS && retries < MAX_RETRIES {
            let backoff = Duration::from_millis(1000 << retries);
            retries += 1;
            warn!(
                "[{}] 429, retry {} after {:?}",
                label, retries, backoff
            );
            tokio::time::sleep(backoff).await;
            continue;
        }
        if !status.is_success() {
            return Err(TrackerError::Http {
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
                status_code: Some(status.as_u16()),
            });
        }
        return Ok(resp);
    }
}

// ============================================================================
// Nominatim
// ============================================================================

/// One search hit. Nominatim serializes coordinates as strings.
#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

impl NominatimPlace {
    fn to_point(&self) -> Option<LocationPoint> {
        let lat = self.lat.trim().parse::<f64>().ok()?;
        let lng = self.lon.trim().parse::<f64>().ok()?;
        let point = LocationPoint::new(lat, lng);
        point.is_valid().then_some(point)
    }
}

/// Geocoder backed by a Nominatim `/search` endpoint.
pub struct NominatimGeocoder {
    client: Client,
    base_url: String,
}

impl NominatimGeocoder {
    /// Geocoder against the public OpenStreetMap instance.
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_NOMINATIM_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn search_url(&self) -> String {
        format!("{}/search", self.base_url)
    }
}

impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str, country_code: &str) -> Result<Option<LocationPoint>> {
        let request = self.client.get(self.search_url()).query(&[
            ("format", "json"),
            ("limit", "1"),
            ("countrycodes", country_code),
            ("q", query),
        ]);
        let resp = send_checked(request, "NominatimGeocoder").await?;
        let places: Vec<NominatimPlace> = resp.json().await.map_err(transport_error)?;

        let point = places.first().and_then(NominatimPlace::to_point);
        debug!(
            "[NominatimGeocoder] '{}' -> {}",
            query,
            point.map_or("no match".to_string(), |p| format!("{:.5},{:.5}", p.lat, p.lng))
        );
        Ok(point)
    }
}

// ============================================================================
// OSRM
// ============================================================================

/// Route provider backed by an OSRM `/route/v1/driving` endpoint.
pub struct OsrmRouteProvider {
    client: Client,
    base_url: String,
}

impl OsrmRouteProvider {
    /// Provider against the public OSRM demo server.
    pub fn new() -> Result<Self> {
        Self::with_base_url(DEFAULT_OSRM_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Route URL; OSRM takes coordinates as `lng,lat`.
    pub fn route_url(&self, origin: &LocationPoint, destination: &LocationPoint) -> String {
        format!(
            "{}/route/v1/driving/{},{};{},{}?overview=full&geometries=geojson",
            self.base_url, origin.lng, origin.lat, destination.lng, destination.lat
        )
    }
}

impl RouteProvider for OsrmRouteProvider {
    async fn driving_route(
        &self,
        origin: &LocationPoint,
        destination: &LocationPoint,
    ) -> Result<RouteResponse> {
        let request = self.client.get(self.route_url(origin, destination));
        let resp = send_checked(request, "OsrmRouteProvider").await?;
        let body: RouteResponse = resp.json().await.map_err(transport_error)?;
        debug!(
            "[OsrmRouteProvider] code {} with {} routes",
            body.code,
            body.routes.len()
        );
        Ok(body)
    }
}
