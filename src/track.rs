//! # Track Reconciler
//!
//! Turns the at-least-once, possibly unordered location stream into an
//! ordered, append-only track.
//!
//! Rules applied to each incoming update:
//! - Missing or out-of-range coordinates: dropped (`MalformedPoint`)
//! - Same timestamp as the newest point: replaces it
//! - Older than the newest timestamped point: dropped (`Stale`)
//! - Anything else: appended
//!
//! The current-location pointer moves on every accepted point, while the
//! recompute gate only opens after meaningful growth.

use log::debug;

use crate::{LocationPoint, LocationUpdate};

/// Why an update did not enter the track.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Missing or invalid lat/lng
    MalformedPoint(String),
    /// Timestamp older than the newest one already recorded
    Stale { timestamp: i64, newest: i64 },
}

/// Result of [`TrackReconciler::append`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended,
    /// Replaced the last entry (duplicate timestamp)
    Replaced,
    Rejected(RejectReason),
}

impl AppendOutcome {
    /// Whether the current location moved.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, AppendOutcome::Rejected(_))
    }
}

/// Ordered track history for one trip.
#[derive(Debug, Clone)]
pub struct TrackReconciler {
    history: Vec<LocationPoint>,
    current: Option<LocationPoint>,
    newest_timestamp: Option<i64>,
    /// History length at the last analytics pass
    last_computed_len: usize,
    /// Growth that must be exceeded before recomputing
    recompute_growth: usize,
    force_recompute: bool,
}

impl Default for TrackReconciler {
    fn default() -> Self {
        Self::new(3)
    }
}

impl TrackReconciler {
    /// Create an empty track. Recomputation is signalled once more than
    /// `recompute_growth` points have been added since the last pass.
    pub fn new(recompute_growth: usize) -> Self {
        Self {
            history: Vec::new(),
            current: None,
            newest_timestamp: None,
            last_computed_len: 0,
            recompute_growth,
            force_recompute: false,
        }
    }

    /// Reconcile a single update into the track.
    pub fn append(&mut self, update: &LocationUpdate) -> AppendOutcome {
        let point = match update.to_point() {
            Ok(p) => p,
            Err(reason) => {
                debug!("[TrackReconciler] Dropping malformed point: {}", reason);
                return AppendOutcome::Rejected(RejectReason::MalformedPoint(reason));
            }
        };
        self.append_point(point)
    }

    /// Reconcile an already-parsed point.
    pub fn append_point(&mut self, point: LocationPoint) -> AppendOutcome {
        if !point.is_valid() {
            let reason = format!("coordinates out of range ({}, {})", point.lat, point.lng);
            debug!("[TrackReconciler] Dropping malformed point: {}", reason);
            return AppendOutcome::Rejected(RejectReason::MalformedPoint(reason));
        }

        let outcome = match (point.timestamp, self.newest_timestamp) {
            (Some(ts), Some(newest)) if ts < newest => {
                debug!(
                    "[TrackReconciler] Dropping stale point at {} (newest {})",
                    ts, newest
                );
                return AppendOutcome::Rejected(RejectReason::Stale {
                    timestamp: ts,
                    newest,
                });
            }
            // Last write wins per timestamp, even across untimed entries
            (Some(ts), Some(newest)) if ts == newest => {
                match self.history.iter().rposition(|p| p.timestamp == Some(ts)) {
                    Some(i) => {
                        self.history[i] = point;
                        AppendOutcome::Replaced
                    }
                    None => {
                        self.history.push(point);
                        AppendOutcome::Appended
                    }
                }
            }
            _ => {
                self.history.push(point);
                AppendOutcome::Appended
            }
        };

        if let Some(ts) = point.timestamp {
            self.newest_timestamp = Some(self.newest_timestamp.map_or(ts, |n| n.max(ts)));
        }
        self.current = Some(point);
        outcome
    }

    /// Bulk-load stored history. Applies the same rules as [`append`]
    /// and forces the next recompute. Returns how many points were accepted.
    ///
    /// [`append`]: TrackReconciler::append
    pub fn seed(&mut self, updates: &[LocationUpdate]) -> usize {
        let accepted = updates
            .iter()
            .filter(|u| self.append(u).is_accepted())
            .count();
        debug!(
            "[TrackReconciler] Seeded {}/{} points",
            accepted,
            updates.len()
        );
        self.force_recompute = true;
        accepted
    }

    pub fn history(&self) -> &[LocationPoint] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Newest accepted point.
    pub fn current_location(&self) -> Option<&LocationPoint> {
        self.current.as_ref()
    }

    /// Points added since the last analytics pass.
    pub fn growth_since_compute(&self) -> usize {
        self.history.len().saturating_sub(self.last_computed_len)
    }

    /// Whether downstream analytics should rerun.
    pub fn needs_recompute(&self) -> bool {
        self.force_recompute || self.growth_since_compute() > self.recompute_growth
    }

    /// Record that analytics were just computed over the full history.
    pub fn mark_computed(&mut self) {
        self.last_computed_len = self.history.len();
        self.force_recompute = false;
    }

    /// Force the next [`needs_recompute`] to return true.
    ///
    /// [`needs_recompute`]: TrackReconciler::needs_recompute
    pub fn request_recompute(&mut self) {
        self.force_recompute = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(lat: f64, lng: f64, ts: i64) -> LocationUpdate {
        LocationUpdate::new(lat, lng, ts)
    }

    #[test]
    fn test_appends_in_order() {
        let mut track = TrackReconciler::default();
        assert_eq!(track.append(&update(12.90, 80.10, 1_000)), AppendOutcome::Appended);
        assert_eq!(track.append(&update(12.91, 80.11, 2_000)), AppendOutcome::Appended);
        assert_eq!(track.len(), 2);
        assert_eq!(track.current_location().unwrap().lat, 12.91);
    }

    #[test]
    fn test_equal_timestamp_replaces_last() {
        let mut track = TrackReconciler::default();
        track.append(&update(12.90, 80.10, 1_000));
        track.append(&update(12.91, 80.11, 2_000));
        assert_eq!(track.append(&update(12.92, 80.12, 2_000)), AppendOutcome::Replaced);
        assert_eq!(track.len(), 2);
        assert_eq!(track.history()[1].lat, 12.92);
        assert_eq!(track.current_location().unwrap().lat, 12.92);
    }

    #[test]
    fn test_malformed_point_dropped() {
        let mut track = TrackReconciler::default();
        let missing_lat = LocationUpdate {
            lng: Some(80.1),
            ..LocationUpdate::default()
        };
        assert!(matches!(
            track.append(&missing_lat),
            AppendOutcome::Rejected(RejectReason::MalformedPoint(_))
        ));
        assert!(matches!(
            track.append(&update(95.0, 80.1, 1)),
            AppendOutcome::Rejected(RejectReason::MalformedPoint(_))
        ));
        assert!(track.is_empty());
        assert!(track.current_location().is_none());
    }

    #[test]
    fn test_stale_point_rejected() {
        let mut track = TrackReconciler::default();
        track.append(&update(12.90, 80.10, 5_000));
        track.append(&update(12.91, 80.11, 6_000));
        let outcome = track.append(&update(12.80, 80.00, 4_000));
        assert_eq!(
            outcome,
            AppendOutcome::Rejected(RejectReason::Stale {
                timestamp: 4_000,
                newest: 6_000
            })
        );
        assert_eq!(track.len(), 2);
        assert_eq!(track.current_location().unwrap().lat, 12.91);
    }

    #[test]
    fn test_untimed_points_are_appended() {
        let mut track = TrackReconciler::default();
        track.append(&update(12.90, 80.10, 5_000));
        let untimed = LocationUpdate {
            lat: Some(12.95),
            lng: Some(80.15),
            ..LocationUpdate::default()
        };
        assert_eq!(track.append(&untimed), AppendOutcome::Appended);
        // Ordering still enforced against the newest timestamp
        assert!(!track.append(&update(12.9, 80.1, 4_000)).is_accepted());
        assert_eq!(track.append(&update(12.9, 80.1, 7_000)), AppendOutcome::Appended);
        assert_eq!(track.len(), 3);
    }

    #[test]
    fn test_equal_timestamp_replaces_across_untimed_entry() {
        let mut track = TrackReconciler::default();
        track.append(&update(12.90, 80.10, 5_000));
        track.append(&LocationUpdate {
            lat: Some(12.95),
            lng: Some(80.15),
            ..LocationUpdate::default()
        });
        assert_eq!(track.append(&update(12.93, 80.13, 5_000)), AppendOutcome::Replaced);

        assert_eq!(track.len(), 2);
        assert_eq!(track.history()[0].lat, 12.93);
        assert_eq!(track.history()[1].timestamp, None);
        let timed_5000 = track
            .history()
            .iter()
            .filter(|p| p.timestamp == Some(5_000))
            .count();
        assert_eq!(timed_5000, 1);
    }

    #[test]
    fn test_recompute_gate_needs_more_than_three_points() {
        let mut track = TrackReconciler::default();
        for i in 0..3 {
            track.append(&update(12.9, 80.1 + i as f64 * 0.001, i * 1_000));
            assert!(!track.needs_recompute());
        }
        track.append(&update(12.9, 80.2, 10_000));
        assert!(track.needs_recompute());

        track.mark_computed();
        assert!(!track.needs_recompute());
        assert_eq!(track.growth_since_compute(), 0);

        // Replacements do not count as growth
        track.append(&update(12.9, 80.3, 10_000));
        assert_eq!(track.growth_since_compute(), 0);
    }

    #[test]
    fn test_seed_forces_recompute() {
        let mut track = TrackReconciler::default();
        let accepted = track.seed(&[
            update(12.90, 80.10, 1_000),
            LocationUpdate::default(),
            update(12.91, 80.11, 2_000),
        ]);
        assert_eq!(accepted, 2);
        assert!(track.needs_recompute());
        track.mark_computed();
        assert!(!track.needs_recompute());
    }
}
