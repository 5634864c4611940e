//! # Route Resolver
//!
//! Two-stage pipeline producing the planned pickup→delivery route:
//!
//! 1. **Geocode**: endpoints without coordinates are looked up from their
//!    postal fields, trying progressively looser queries. Calls go out one
//!    at a time, spaced by a [`Pacer`] to respect provider rate limits.
//! 2. **Route**: once both endpoints have coordinates, a driving route is
//!    fetched once for that pair. Any failure falls back to a straight line.
//!
//! ```text
//! NeedsGeocode ──geocoded──▶ NeedsRoute ──fetched/fallback──▶ Ready
//!      │
//!      └──all variants failed──▶ Failed ──retry()──▶ NeedsGeocode
//! ```
//!
//! Each await is followed by a [`Liveness`] check; a run that outlives its
//! session returns [`TrackerError::Cancelled`] and leaves state untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::{Endpoint, LocationPoint, PlannedRoute, ResolverConfig, Result, TrackerError};

// ============================================================================
// Provider seams
// ============================================================================

/// Free-text geocoding provider.
#[allow(async_fn_in_trait)]
pub trait Geocoder {
    /// Best match for `query` within `country_code`, if any.
    async fn geocode(&self, query: &str, country_code: &str) -> Result<Option<LocationPoint>>;
}

/// Driving-route provider.
#[allow(async_fn_in_trait)]
pub trait RouteProvider {
    async fn driving_route(
        &self,
        origin: &LocationPoint,
        destination: &LocationPoint,
    ) -> Result<RouteResponse>;
}

/// Routing response, OSRM-shaped. Coordinates are `[lng, lat]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteResponse {
    pub code: String,
    #[serde(default)]
    pub routes: Vec<ProviderRoute>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderRoute {
    #[serde(default)]
    pub geometry: RouteGeometry,
    /// Meters
    #[serde(default)]
    pub distance: Option<f64>,
    /// Seconds
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteGeometry {
    #[serde(default)]
    pub coordinates: Vec<[f64; 2]>,
}

impl RouteResponse {
    pub const OK: &'static str = "Ok";

    /// Convert the first route to a planned route, flipping `[lng, lat]`
    /// to `[lat, lng]`. `None` for a non-OK code or an empty geometry.
    pub fn into_planned(self) -> Option<PlannedRoute> {
        if self.code != Self::OK {
            return None;
        }
        let route = self.routes.into_iter().next()?;
        if route.geometry.coordinates.len() < 2 {
            return None;
        }
        Some(PlannedRoute {
            polyline: route
                .geometry
                .coordinates
                .iter()
                .map(|[lng, lat]| [*lat, *lng])
                .collect(),
            distance_meters: route.distance,
            duration_seconds: route.duration,
            is_fallback: false,
        })
    }
}

// ============================================================================
// Pacing
// ============================================================================

/// Named delay points between consecutive external calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelayStep {
    /// Before trying the next query variant for the same endpoint
    NextVariant,
    /// Before the first query for the other endpoint
    NextEndpoint,
    /// Before the first query of a later run (e.g. a manual retry)
    NextRun,
}

/// Waits between rate-limited calls.
#[allow(async_fn_in_trait)]
pub trait Pacer {
    async fn wait(&self, step: DelayStep);
}

/// Spaces calls on the tokio timer, measured from the previous release.
///
/// The first wait has no reference point and sleeps the full spacing.
#[derive(Debug)]
pub struct TokioPacer {
    spacing: Duration,
    last_release: Mutex<Option<Instant>>,
}

impl TokioPacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            last_release: Mutex::new(None),
        }
    }

    pub fn from_config(config: &ResolverConfig) -> Self {
        Self::new(config.call_spacing())
    }
}

impl Pacer for TokioPacer {
    async fn wait(&self, step: DelayStep) {
        let deadline = {
            let last = *self.last_release.lock().unwrap_or_else(|e| e.into_inner());
            last.unwrap_or_else(Instant::now) + self.spacing
        };
        let now = Instant::now();
        if deadline > now {
            debug!("[RouteResolver] Pacing {:?} for {:?}", step, deadline - now);
            tokio::time::sleep_until(deadline).await;
        }
        *self.last_release.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }
}

// ============================================================================
// Liveness
// ============================================================================

/// Shared flag that turns late async results into no-ops once cleared.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }

    fn check(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(TrackerError::Cancelled)
        }
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolveStage {
    NeedsGeocode,
    NeedsRoute,
    /// Planned route available (possibly the straight-line fallback)
    Ready,
    /// Geocoding exhausted; waits for an explicit retry
    Failed,
}

/// Display status of the planned-route overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolverStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    /// Straight-line fallback is shown
    RouteFailed,
    /// An endpoint could not be located
    GeocodeFailed,
}

impl ResolverStatus {
    /// Status line for the map overlay.
    pub fn label(&self) -> Option<&'static str> {
        match self {
            ResolverStatus::Idle | ResolverStatus::Ready => None,
            ResolverStatus::Loading => Some("Loading…"),
            ResolverStatus::RouteFailed => Some("Route loading failed"),
            ResolverStatus::GeocodeFailed => Some("Could not locate pickup or delivery"),
        }
    }

    pub fn can_retry(&self) -> bool {
        matches!(self, ResolverStatus::RouteFailed | ResolverStatus::GeocodeFailed)
    }
}

/// Which endpoint a geocode call is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Pickup,
    Delivery,
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointRole::Pickup => write!(f, "pickup"),
            EndpointRole::Delivery => write!(f, "delivery"),
        }
    }
}

/// Query variants for an endpoint, most specific first.
///
/// `"{city}, {state}, {country}"`, `"{address}, {city}, {state}"`, `"{city}"`;
/// blank fields are left out and duplicate queries are skipped.
pub fn query_variants(endpoint: &Endpoint, country: &str) -> Vec<String> {
    fn field(value: &Option<String>) -> Option<&str> {
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }
    fn join(parts: &[Option<&str>]) -> String {
        parts.iter().flatten().copied().collect::<Vec<_>>().join(", ")
    }

    let city = field(&endpoint.city);
    let state = field(&endpoint.state);
    let address = field(&endpoint.address);
    let country = Some(country.trim()).filter(|c| !c.is_empty());

    let mut candidates = Vec::with_capacity(3);
    if city.is_some() {
        candidates.push(join(&[city, state, country]));
    }
    if address.is_some() {
        candidates.push(join(&[address, city, state]));
    }
    if let Some(city) = city {
        candidates.push(city.to_string());
    }

    let mut variants: Vec<String> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !variants.contains(&candidate) {
            variants.push(candidate);
        }
    }
    variants
}

/// Resolves pickup/delivery coordinates and the planned route between them.
pub struct RouteResolver<G, R, P> {
    geocoder: G,
    router: R,
    pacer: P,
    config: ResolverConfig,

    pickup: Endpoint,
    delivery: Endpoint,

    stage: ResolveStage,
    /// Pipeline runs since creation or the last retry
    attempt: u32,
    /// Geocode calls over the resolver's lifetime; survives retries
    geocode_calls: u64,
    /// Endpoint pair the current route was fetched for
    route_latch: Option<(LocationPoint, LocationPoint)>,
    planned_route: Option<PlannedRoute>,
    last_error: Option<TrackerError>,
    status_tx: watch::Sender<ResolverStatus>,
}

impl<G: Geocoder, R: RouteProvider, P: Pacer> RouteResolver<G, R, P> {
    pub fn new(
        geocoder: G,
        router: R,
        pacer: P,
        config: ResolverConfig,
        pickup: Endpoint,
        delivery: Endpoint,
    ) -> Self {
        let (status_tx, _) = watch::channel(ResolverStatus::Idle);
        let mut resolver = Self {
            geocoder,
            router,
            pacer,
            config,
            pickup,
            delivery,
            stage: ResolveStage::NeedsGeocode,
            attempt: 0,
            geocode_calls: 0,
            route_latch: None,
            planned_route: None,
            last_error: None,
            status_tx,
        };
        resolver.stage = resolver.initial_stage();
        resolver
    }

    fn initial_stage(&self) -> ResolveStage {
        if self.pickup.has_coords() && self.delivery.has_coords() {
            ResolveStage::NeedsRoute
        } else {
            ResolveStage::NeedsGeocode
        }
    }

    pub fn stage(&self) -> ResolveStage {
        self.stage
    }

    pub fn status(&self) -> ResolverStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ResolverStatus> {
        self.status_tx.subscribe()
    }

    pub fn pickup(&self) -> &Endpoint {
        &self.pickup
    }

    pub fn delivery(&self) -> &Endpoint {
        &self.delivery
    }

    pub fn planned_route(&self) -> Option<&PlannedRoute> {
        self.planned_route.as_ref()
    }

    /// Set when the last run fell back or failed to geocode.
    pub fn last_error(&self) -> Option<&TrackerError> {
        self.last_error.as_ref()
    }

    pub fn route_error(&self) -> bool {
        matches!(self.last_error, Some(TrackerError::RouteFetch { .. }))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Replace the endpoints, e.g. after the load was edited. A changed
    /// coordinate pair resets the pipeline; the previous route stays on
    /// screen until the new one resolves.
    pub fn update_endpoints(&mut self, pickup: Endpoint, delivery: Endpoint) {
        if pickup == self.pickup && delivery == self.delivery {
            return;
        }
        self.pickup = pickup;
        self.delivery = delivery;
        let pair = self.pickup.coords().zip(self.delivery.coords());
        if pair.is_none() || pair != self.route_latch {
            self.reset();
        }
    }

    /// Run the pipeline once. A no-op returning the current stage once the
    /// automatic attempt budget is spent, or when the route is already
    /// resolved for the current endpoint pair.
    pub async fn run(&mut self, liveness: &Liveness) -> Result<ResolveStage> {
        liveness.check()?;
        if matches!(self.stage, ResolveStage::Ready | ResolveStage::Failed) {
            return Ok(self.stage);
        }
        if self.attempt >= self.config.max_auto_attempts {
            debug!(
                "[RouteResolver] Attempt budget spent ({}), waiting for retry",
                self.attempt
            );
            return Ok(self.stage);
        }
        self.attempt += 1;
        let previous = self.status_tx.send_replace(ResolverStatus::Loading);

        let result = self.drive(liveness).await;
        if let Err(TrackerError::Cancelled) = &result {
            info!("[RouteResolver] Run abandoned: session no longer live");
            // An abandoned run does not count against the budget
            self.attempt = self.attempt.saturating_sub(1);
            self.status_tx.send_replace(previous);
        }
        result
    }

    /// Reset the attempt counter and latches and rerun from geocoding.
    pub async fn retry(&mut self, liveness: &Liveness) -> Result<ResolveStage> {
        info!("[RouteResolver] Manual retry");
        self.reset();
        self.run(liveness).await
    }

    fn reset(&mut self) {
        self.attempt = 0;
        self.route_latch = None;
        self.last_error = None;
        self.stage = self.initial_stage();
        self.status_tx.send_replace(ResolverStatus::Idle);
    }

    async fn drive(&mut self, liveness: &Liveness) -> Result<ResolveStage> {
        if self.stage == ResolveStage::NeedsGeocode {
            self.geocode_endpoints(liveness).await?;
        }
        if self.stage == ResolveStage::NeedsRoute {
            self.fetch_route(liveness).await?;
        }
        Ok(self.stage)
    }

    async fn geocode_endpoints(&mut self, liveness: &Liveness) -> Result<()> {
        let mut calls_made = 0usize;
        let mut resolved: Vec<(EndpointRole, LocationPoint)> = Vec::new();
        let mut failed: Vec<(EndpointRole, usize)> = Vec::new();

        for role in [EndpointRole::Pickup, EndpointRole::Delivery] {
            let endpoint = match role {
                EndpointRole::Pickup => &self.pickup,
                EndpointRole::Delivery => &self.delivery,
            };
            if endpoint.has_coords() {
                continue;
            }
            let variants = query_variants(endpoint, &self.config.country);
            let mut found = None;

            for (i, query) in variants.iter().enumerate() {
                if self.geocode_calls > 0 {
                    let step = if calls_made == 0 {
                        DelayStep::NextRun
                    } else if i == 0 {
                        DelayStep::NextEndpoint
                    } else {
                        DelayStep::NextVariant
                    };
                    self.pacer.wait(step).await;
                    liveness.check()?;
                }
                calls_made += 1;
                self.geocode_calls += 1;

                let result = self
                    .geocoder
                    .geocode(query, &self.config.country_code)
                    .await;
                liveness.check()?;

                match result {
                    Ok(Some(point)) if point.is_valid() => {
                        debug!("[RouteResolver] {} resolved via '{}'", role, query);
                        found = Some(point);
                        break;
                    }
                    Ok(_) => debug!("[RouteResolver] No {} result for '{}'", role, query),
                    Err(e) => warn!("[RouteResolver] Geocode '{}' failed: {}", query, e),
                }
            }

            match found {
                Some(point) => resolved.push((role, point)),
                None => failed.push((role, variants.len())),
            }
        }

        // Coordinates land only once every lookup has finished
        for (role, point) in resolved {
            let endpoint = match role {
                EndpointRole::Pickup => &mut self.pickup,
                EndpointRole::Delivery => &mut self.delivery,
            };
            endpoint.lat = Some(point.lat);
            endpoint.lng = Some(point.lng);
        }

        if let Some(&(role, attempted)) = failed.first() {
            warn!(
                "[RouteResolver] Geocoding failed for {:?}",
                failed.iter().map(|(r, _)| *r).collect::<Vec<_>>()
            );
            self.last_error = Some(TrackerError::GeocodeFailure {
                endpoint: role.to_string(),
                attempted,
            });
            self.stage = ResolveStage::Failed;
            self.status_tx.send_replace(ResolverStatus::GeocodeFailed);
        } else {
            self.stage = ResolveStage::NeedsRoute;
        }
        Ok(())
    }

    async fn fetch_route(&mut self, liveness: &Liveness) -> Result<()> {
        let (Some(pickup), Some(delivery)) = (self.pickup.coords(), self.delivery.coords()) else {
            self.stage = ResolveStage::NeedsGeocode;
            return Ok(());
        };
        if self.route_latch == Some((pickup, delivery)) && self.planned_route.is_some() {
            self.stage = ResolveStage::Ready;
            return Ok(());
        }

        let response = self.router.driving_route(&pickup, &delivery).await;
        liveness.check()?;

        let failure = match response {
            Ok(resp) => {
                let code = resp.code.clone();
                match resp.into_planned() {
                    Some(route) => {
                        info!(
                            "[RouteResolver] Route: {} points, {:?} m",
                            route.polyline.len(),
                            route.distance_meters
                        );
                        self.planned_route = Some(route);
                        None
                    }
                    None => Some(format!("no route (code {})", code)),
                }
            }
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                self.last_error = None;
                self.status_tx.send_replace(ResolverStatus::Ready);
            }
            Some(message) => {
                warn!(
                    "[RouteResolver] Route fetch failed ({}), using straight line",
                    message
                );
                self.planned_route = Some(PlannedRoute::straight_line(&pickup, &delivery));
                self.last_error = Some(TrackerError::RouteFetch { message });
                self.status_tx.send_replace(ResolverStatus::RouteFailed);
            }
        }
        self.route_latch = Some((pickup, delivery));
        self.stage = ResolveStage::Ready;
        Ok(())
    }
}
