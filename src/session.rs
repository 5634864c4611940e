//! # Trip Session
//!
//! Single owner of one trip view's state. Everything that the dashboard used
//! to keep in scattered mutable cells lives here as plain fields:
//! the track, the derived analytics, the camera state machine, the route
//! pipeline with its latches, the phase, and the liveness flag.
//!
//! The session is driven through `&mut self`, so all computation for a trip
//! is sequential. Suspension points are limited to waiting on the stream and
//! on the route resolver.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::route::{
    Geocoder, Liveness, Pacer, ResolveStage, ResolverStatus, RouteProvider, RouteResolver,
    TokioPacer,
};
use crate::stream::{ConnectionState, LocationStreamClient, LocationTransport};
use crate::track::{AppendOutcome, TrackReconciler};
use crate::viewport::{CameraCommand, ViewportController, ViewportInputs, ViewportMode};
use crate::{
    compute_stats, detect_stops, LocationPoint, LocationUpdate, Result, StopEvent, TrackerConfig,
    TrackerError, TripPhase, TripStats,
};

/// Callback invoked by the refresh timer.
pub type RefreshCallback = Arc<dyn Fn() + Send + Sync>;

// ============================================================================
// Refresh timer
// ============================================================================

/// Fixed-interval timer driving an external refresh callback.
///
/// The first tick fires one full interval after start. Dropping the timer
/// stops it.
pub struct RefreshTimer {
    task: JoinHandle<()>,
}

impl RefreshTimer {
    /// Start on the current tokio runtime.
    pub fn start(period: Duration, callback: RefreshCallback) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| TrackerError::Config {
            message: format!("refresh timer needs a tokio runtime: {}", e),
        })?;
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                callback();
            }
        });
        Ok(Self { task })
    }

    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Output types
// ============================================================================

/// What a single event did to the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    /// Reconciler outcome, when the event was a location
    pub outcome: Option<AppendOutcome>,
    /// Camera command to forward to the map, if any
    pub camera: Option<CameraCommand>,
    /// Stats and stops were recomputed
    pub analytics_updated: bool,
}

impl SessionUpdate {
    fn camera_only(camera: Option<CameraCommand>) -> Self {
        Self {
            outcome: None,
            camera,
            analytics_updated: false,
        }
    }
}

/// Point lists for the rendering surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderLayers {
    pub planned_route: Vec<[f64; 2]>,
    pub planned_route_is_fallback: bool,
    pub actual_track: Vec<[f64; 2]>,
    pub stops: Vec<StopEvent>,
    pub pickup: Option<[f64; 2]>,
    pub delivery: Option<[f64; 2]>,
    pub live_marker: Option<[f64; 2]>,
}

/// Phase-appropriate placeholder when there is no track to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmptyState {
    NotStarted,
    WaitingForGps,
    NoTrackRecorded,
}

impl EmptyState {
    pub fn message(&self) -> &'static str {
        match self {
            EmptyState::NotStarted => "Trip has not started yet",
            EmptyState::WaitingForGps => "Waiting for GPS…",
            EmptyState::NoTrackRecorded => "No GPS track was recorded for this trip",
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// State of one trip view.
pub struct TripSession<T: LocationTransport, G, R, P = TokioPacer> {
    trip_id: String,
    config: TrackerConfig,
    phase: TripPhase,

    stream: LocationStreamClient<T>,
    track: TrackReconciler,
    stats: Option<TripStats>,
    stops: Vec<StopEvent>,
    viewport: ViewportController,
    resolver: RouteResolver<G, R, P>,

    liveness: Liveness,
    auto_refresh: bool,
    refresh_callback: Option<RefreshCallback>,
    refresh: Option<RefreshTimer>,
    disposed: bool,
}

impl<T: LocationTransport, G: Geocoder, R: RouteProvider, P: Pacer> TripSession<T, G, R, P> {
    pub fn new(
        trip_id: &str,
        transport: Arc<T>,
        resolver: RouteResolver<G, R, P>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            trip_id: trip_id.to_string(),
            stream: LocationStreamClient::new(transport, config.stream.clone()),
            track: TrackReconciler::new(config.recompute_growth),
            stats: None,
            stops: Vec::new(),
            viewport: ViewportController::new(config.viewport.clone()),
            resolver,
            liveness: Liveness::new(),
            auto_refresh: config.auto_refresh,
            refresh_callback: None,
            refresh: None,
            disposed: false,
            phase: TripPhase::Pre,
            config,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn trip_id(&self) -> &str {
        &self.trip_id
    }

    pub fn phase(&self) -> TripPhase {
        self.phase
    }

    pub fn history(&self) -> &[LocationPoint] {
        self.track.history()
    }

    pub fn current_location(&self) -> Option<&LocationPoint> {
        self.track.current_location()
    }

    pub fn stats(&self) -> Option<&TripStats> {
        self.stats.as_ref()
    }

    pub fn stops(&self) -> &[StopEvent] {
        &self.stops
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.stream.status()
    }

    pub fn route_status(&self) -> ResolverStatus {
        self.resolver.status()
    }

    pub fn route_stage(&self) -> ResolveStage {
        self.resolver.stage()
    }

    pub fn viewport_mode(&self) -> ViewportMode {
        self.viewport.mode()
    }

    pub fn resolver(&self) -> &RouteResolver<G, R, P> {
        &self.resolver
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh.is_some()
    }

    /// Handle that cancels the route run in flight from another task.
    ///
    /// The next `resolve_route` or `retry_route` runs under a fresh flag, so
    /// an old handle never blocks later runs. Only `dispose` is final.
    pub fn cancel_handle(&self) -> Liveness {
        self.liveness.clone()
    }

    fn renew_liveness(&mut self) {
        if !self.disposed && !self.liveness.is_live() {
            debug!("[TripSession] Previous route run was cancelled, renewing");
            self.liveness = Liveness::new();
        }
    }

    // ------------------------------------------------------------------------
    // Phase and lifecycle
    // ------------------------------------------------------------------------

    /// Apply the trip phase signal.
    pub fn set_phase(&mut self, phase: TripPhase) -> SessionUpdate {
        if self.disposed || phase == self.phase {
            return SessionUpdate::camera_only(None);
        }
        let previous = self.phase;
        self.phase = phase;
        info!(
            "[TripSession] Trip {} phase {:?} -> {:?}",
            self.trip_id, previous, phase
        );

        if previous == TripPhase::Active {
            self.stream.disable();
            self.stop_refresh();
            // Abandon in-flight route work, keep a fresh flag for later runs
            self.liveness.kill();
            self.liveness = Liveness::new();
        }

        if phase == TripPhase::Active {
            if let Err(e) = self.stream.enable(&self.trip_id, true) {
                warn!("[TripSession] Live tracking unavailable: {}", e);
            }
            self.sync_refresh();
        }

        let analytics_updated = if phase.has_analytics() {
            self.track.request_recompute();
            self.maybe_recompute()
        } else {
            self.stats = None;
            self.stops.clear();
            false
        };

        SessionUpdate {
            outcome: None,
            camera: None,
            analytics_updated,
        }
    }

    /// Resubscribe after a dropped or failed connection. Returns `true` when
    /// a new subscription was made; a no-op outside the Active phase or while
    /// the current subscription is still up.
    pub fn reconnect(&mut self) -> Result<bool> {
        if self.disposed || self.phase != TripPhase::Active {
            return Ok(false);
        }
        if self.stream.is_subscribed() && self.stream.status() != ConnectionState::Disconnected {
            return Ok(false);
        }
        info!("[TripSession] Reconnecting trip {}", self.trip_id);
        self.stream.disable();
        self.stream.enable(&self.trip_id, true)
    }

    /// Install the external refresh callback.
    pub fn set_refresh_callback(&mut self, callback: RefreshCallback) {
        self.refresh_callback = Some(callback);
        self.stop_refresh();
        self.sync_refresh();
    }

    /// Toggle the refresh hook.
    pub fn set_auto_refresh(&mut self, enabled: bool) {
        self.auto_refresh = enabled;
        self.sync_refresh();
    }

    fn sync_refresh(&mut self) {
        let wanted = !self.disposed && self.auto_refresh && self.phase == TripPhase::Active;
        if !wanted {
            self.stop_refresh();
            return;
        }
        if self.refresh.is_some() {
            return;
        }
        let Some(callback) = self.refresh_callback.clone() else {
            return;
        };
        match RefreshTimer::start(self.config.refresh_interval(), callback) {
            Ok(timer) => {
                debug!(
                    "[TripSession] Refresh every {:?}",
                    self.config.refresh_interval()
                );
                self.refresh = Some(timer);
            }
            Err(e) => warn!("[TripSession] {}", e),
        }
    }

    fn stop_refresh(&mut self) {
        if let Some(timer) = self.refresh.take() {
            timer.stop();
        }
    }

    // ------------------------------------------------------------------------
    // Location ingest
    // ------------------------------------------------------------------------

    /// Load stored breadcrumbs, e.g. when the view opens mid-trip.
    pub fn seed_history(&mut self, updates: &[LocationUpdate]) -> SessionUpdate {
        if self.disposed {
            return SessionUpdate::camera_only(None);
        }
        self.track.seed(updates);
        let camera = self
            .viewport
            .on_data(&viewport_inputs(&self.track, &self.resolver));
        SessionUpdate {
            outcome: None,
            camera,
            analytics_updated: self.maybe_recompute(),
        }
    }

    /// Reconcile one location event.
    pub fn handle_update(&mut self, update: &LocationUpdate) -> SessionUpdate {
        if self.disposed {
            return SessionUpdate::camera_only(None);
        }
        let outcome = self.track.append(update);
        if !outcome.is_accepted() {
            return SessionUpdate {
                outcome: Some(outcome),
                camera: None,
                analytics_updated: false,
            };
        }

        let camera = self
            .viewport
            .on_location(&viewport_inputs(&self.track, &self.resolver), self.phase);
        SessionUpdate {
            outcome: Some(outcome),
            camera,
            analytics_updated: self.maybe_recompute(),
        }
    }

    /// Wait for the next streamed location and apply it. `None` once the
    /// stream is not subscribed.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        let update = self.stream.recv().await?;
        Some(self.handle_update(&update))
    }

    /// Apply every location already buffered, without waiting.
    pub fn drain_updates(&mut self) -> Vec<SessionUpdate> {
        let mut applied = Vec::new();
        while let Some(update) = self.stream.try_recv() {
            applied.push(self.handle_update(&update));
        }
        applied
    }

    fn maybe_recompute(&mut self) -> bool {
        if !self.phase.has_analytics() || !self.track.needs_recompute() {
            return false;
        }
        let history = self.track.history();
        self.stats = compute_stats(history);
        self.stops = detect_stops(history, &self.config.stops);
        self.track.mark_computed();
        debug!(
            "[TripSession] Analytics over {} points: {} stops",
            self.track.len(),
            self.stops.len()
        );
        true
    }

    // ------------------------------------------------------------------------
    // Planned route
    // ------------------------------------------------------------------------

    /// Run the geocode/route pipeline.
    pub async fn resolve_route(&mut self) -> SessionUpdate {
        if self.disposed {
            return SessionUpdate::camera_only(None);
        }
        self.renew_liveness();
        let result = self.resolver.run(&self.liveness).await;
        self.after_route(result)
    }

    /// User-triggered retry after a geocode or route failure.
    pub async fn retry_route(&mut self) -> SessionUpdate {
        if self.disposed {
            return SessionUpdate::camera_only(None);
        }
        self.renew_liveness();
        let result = self.resolver.retry(&self.liveness).await;
        self.after_route(result)
    }

    fn after_route(&mut self, result: Result<ResolveStage>) -> SessionUpdate {
        match result {
            Ok(stage) => {
                debug!("[TripSession] Route stage {:?}", stage);
                let camera = self
                    .viewport
                    .on_data(&viewport_inputs(&self.track, &self.resolver));
                SessionUpdate::camera_only(camera)
            }
            Err(e) => {
                debug!("[TripSession] Route run ended: {}", e);
                SessionUpdate::camera_only(None)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Camera
    // ------------------------------------------------------------------------

    pub fn on_user_drag(&mut self) {
        self.viewport.on_user_drag();
    }

    pub fn recenter(&mut self) -> Option<CameraCommand> {
        self.viewport
            .recenter(&viewport_inputs(&self.track, &self.resolver))
    }

    // ------------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------------

    pub fn render_layers(&self) -> RenderLayers {
        let route = self.resolver.planned_route();
        RenderLayers {
            planned_route: route.map(|r| r.polyline.clone()).unwrap_or_default(),
            planned_route_is_fallback: route.is_some_and(|r| r.is_fallback),
            actual_track: self
                .track
                .history()
                .iter()
                .map(LocationPoint::lat_lng)
                .collect(),
            stops: self.stops.clone(),
            pickup: self.resolver.pickup().coords().map(|p| p.lat_lng()),
            delivery: self.resolver.delivery().coords().map(|p| p.lat_lng()),
            live_marker: self.track.current_location().map(LocationPoint::lat_lng),
        }
    }

    /// Placeholder to show instead of the track, if any.
    pub fn empty_state(&self) -> Option<EmptyState> {
        if self.track.current_location().is_some() {
            return None;
        }
        Some(match self.phase {
            TripPhase::Pre => EmptyState::NotStarted,
            TripPhase::Active => EmptyState::WaitingForGps,
            TripPhase::Post => EmptyState::NoTrackRecorded,
        })
    }
}

impl<T: LocationTransport, G, R, P> TripSession<T, G, R, P> {
    /// Tear down: unsubscribe, stop the timer, cancel route work.
    /// Idempotent; also runs on drop.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.liveness.kill();
        self.stream.disable();
        if let Some(timer) = self.refresh.take() {
            timer.stop();
        }
        info!("[TripSession] Trip {} disposed", self.trip_id);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl<T: LocationTransport, G, R, P> Drop for TripSession<T, G, R, P> {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn viewport_inputs<'a, G: Geocoder, R: RouteProvider, P: Pacer>(
    track: &'a TrackReconciler,
    resolver: &'a RouteResolver<G, R, P>,
) -> ViewportInputs<'a> {
    ViewportInputs {
        current: track.current_location(),
        history: track.history(),
        pickup: resolver.pickup().coords(),
        delivery: resolver.delivery().coords(),
        planned_route: resolver.planned_route(),
    }
}
