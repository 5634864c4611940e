//! # Viewport Controller
//!
//! Decides what the map camera does as data arrives.
//!
//! ```text
//!            drag                     recenter
//! AutoFit ─────────▶ UserControlled ──────────▶ AutoFit
//!   │ first data: fit bounds
//!   │ new location (active trip): pan, or re-fit after enough growth
//! ```
//!
//! Once the user takes over, nothing moves the camera until they recenter.

use serde::{Deserialize, Serialize};

use crate::{Bounds, LocationPoint, PlannedRoute, TripPhase, ViewportConfig};

/// Who owns the camera.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewportMode {
    #[default]
    AutoFit,
    UserControlled,
}

/// Command for the rendering surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CameraCommand {
    FitBounds {
        points: Vec<[f64; 2]>,
        bounds: Bounds,
        padding: u32,
    },
    PanTo {
        point: [f64; 2],
    },
    FlyTo {
        point: [f64; 2],
        zoom: u8,
    },
}

/// Everything the camera may need to show.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewportInputs<'a> {
    pub current: Option<&'a LocationPoint>,
    pub history: &'a [LocationPoint],
    pub pickup: Option<LocationPoint>,
    pub delivery: Option<LocationPoint>,
    pub planned_route: Option<&'a PlannedRoute>,
}

impl ViewportInputs<'_> {
    /// All renderable points: endpoints, planned route, track, live marker.
    pub fn renderable_points(&self) -> Vec<LocationPoint> {
        let mut points: Vec<LocationPoint> = Vec::with_capacity(
            self.history.len() + self.planned_route.map_or(0, |r| r.polyline.len()) + 3,
        );
        points.extend(self.pickup);
        points.extend(self.delivery);
        if let Some(route) = self.planned_route {
            points.extend(route.polyline.iter().map(|[lat, lng]| LocationPoint::new(*lat, *lng)));
        }
        points.extend_from_slice(self.history);
        points.extend(self.current.copied());
        points
    }
}

/// Camera state machine.
#[derive(Debug, Clone)]
pub struct ViewportController {
    mode: ViewportMode,
    has_fitted_once: bool,
    /// History length at the last fit
    last_fit_point_count: usize,
    config: ViewportConfig,
}

impl Default for ViewportController {
    fn default() -> Self {
        Self::new(ViewportConfig::default())
    }
}

impl ViewportController {
    pub fn new(config: ViewportConfig) -> Self {
        Self {
            mode: ViewportMode::AutoFit,
            has_fitted_once: false,
            last_fit_point_count: 0,
            config,
        }
    }

    pub fn mode(&self) -> ViewportMode {
        self.mode
    }

    pub fn has_fitted_once(&self) -> bool {
        self.has_fitted_once
    }

    pub fn last_fit_point_count(&self) -> usize {
        self.last_fit_point_count
    }

    /// New data of any kind (endpoints, planned route, history). Produces the
    /// initial fit the first time anything is renderable.
    pub fn on_data(&mut self, inputs: &ViewportInputs<'_>) -> Option<CameraCommand> {
        if self.has_fitted_once || self.mode != ViewportMode::AutoFit {
            return None;
        }
        self.fit(inputs)
    }

    /// A new current location arrived.
    pub fn on_location(
        &mut self,
        inputs: &ViewportInputs<'_>,
        phase: TripPhase,
    ) -> Option<CameraCommand> {
        if self.mode != ViewportMode::AutoFit {
            return None;
        }
        if !self.has_fitted_once {
            return self.fit(inputs);
        }
        if phase != TripPhase::Active {
            return None;
        }

        let growth = inputs.history.len().saturating_sub(self.last_fit_point_count);
        if growth > self.config.refit_growth {
            return self.fit(inputs);
        }
        inputs
            .current
            .map(|p| CameraCommand::PanTo { point: p.lat_lng() })
    }

    /// User dragged or panned the map.
    pub fn on_user_drag(&mut self) {
        self.mode = ViewportMode::UserControlled;
    }

    /// Explicit recenter: back to auto-fit from any state.
    pub fn recenter(&mut self, inputs: &ViewportInputs<'_>) -> Option<CameraCommand> {
        self.mode = ViewportMode::AutoFit;
        match inputs.current {
            Some(current) => {
                self.has_fitted_once = true;
                self.last_fit_point_count = inputs.history.len();
                Some(CameraCommand::FlyTo {
                    point: current.lat_lng(),
                    zoom: self.config.fly_to_zoom,
                })
            }
            None => self.fit(inputs),
        }
    }

    fn fit(&mut self, inputs: &ViewportInputs<'_>) -> Option<CameraCommand> {
        let points = inputs.renderable_points();
        let bounds = Bounds::from_points(&points)?;
        self.has_fitted_once = true;
        self.last_fit_point_count = inputs.history.len();
        Some(CameraCommand::FitBounds {
            points: points.iter().map(LocationPoint::lat_lng).collect(),
            bounds,
            padding: self.config.fit_padding,
        })
    }
}
