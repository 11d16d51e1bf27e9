//! # Spiderfy
//!
//! Spreads visually overlapping markers onto a small circle around their
//! common center so each one can be tapped.
//!
//! Overlap is decided in kilometers: the pixel thresholds in
//! [`SpiderfyConfig`] are converted at the current region's scale by the
//! caller (see [`crate::geo_utils::pixels_to_km`]).
//!
//! Opening a spider always emits two transitions, [`SpiderfyTransition::Cleared`]
//! followed by [`SpiderfyTransition::Opened`], so a renderer drops the old
//! layout before drawing the new one.

use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::geo_utils::{average_geolocation, haversine_km};
use crate::{ClusterError, ClusterNode, LatLng, MapPoint, Result};

/// Angle of the first spread position (radians, measured from north).
pub const START_ANGLE: f64 = PI / 4.0;

/// Approximate meters per degree used to place spread positions.
pub const METERS_PER_DEGREE: f64 = 111_300.0;

/// Pixel tunables for spiderfying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpiderfyConfig {
    /// Markers closer than this (in pixels) overlap.
    /// Default: 15
    pub overlap_threshold_px: f64,

    /// Base spacing (in pixels) between spread markers.
    /// Default: 30
    pub spread_px: f64,
}

impl Default for SpiderfyConfig {
    fn default() -> Self {
        Self {
            overlap_threshold_px: 15.0,
            spread_px: 30.0,
        }
    }
}

impl SpiderfyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.overlap_threshold_px.is_finite() && self.overlap_threshold_px >= 0.0) {
            return Err(ClusterError::config(format!(
                "overlap_threshold_px ({}) must be a non-negative number",
                self.overlap_threshold_px
            )));
        }
        if !(self.spread_px.is_finite() && self.spread_px > 0.0) {
            return Err(ClusterError::config(format!(
                "spread_px ({}) must be a positive number",
                self.spread_px
            )));
        }
        Ok(())
    }
}

/// A point moved to its spread position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpiderfiedPoint {
    pub point: Arc<MapPoint>,
    /// Spread position
    pub location: LatLng,
    /// Shared center of the spider
    pub origin: LatLng,
}

/// Leg from the spider center to one spread position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpiderLine {
    /// `line-<point id>`
    pub id: String,
    pub origin: LatLng,
    pub location: LatLng,
}

/// The open spider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpiderfyState {
    pub points: HashMap<String, SpiderfiedPoint>,
    /// Zoom level of the region when the spider opened
    pub zoom_level: Option<i32>,
    /// One leg per point, in layout order
    pub lines: Vec<SpiderLine>,
}

impl SpiderfyState {
    pub fn get(&self, point_id: &str) -> Option<&SpiderfiedPoint> {
        self.points.get(point_id)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Observable change of the spider state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SpiderfyTransition {
    /// No spider is open
    Cleared,
    /// A spider opened with this state
    Opened(SpiderfyState),
}

/// Holds the single active spider and its transitions.
#[derive(Debug, Default)]
pub struct Spiderfier {
    config: SpiderfyConfig,
    state: Option<SpiderfyState>,
}

impl Spiderfier {
    pub fn new(config: SpiderfyConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    pub fn config(&self) -> &SpiderfyConfig {
        &self.config
    }

    pub fn state(&self) -> Option<&SpiderfyState> {
        self.state.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    /// The spread version of a point, if it is part of the open spider.
    pub fn spiderfied(&self, point_id: &str) -> Option<&SpiderfiedPoint> {
        self.state.as_ref().and_then(|s| s.get(point_id))
    }

    /// Whether two locations are within `threshold_km` of each other.
    pub fn is_overlapped(a: &LatLng, b: &LatLng, threshold_km: f64) -> bool {
        haversine_km(a, b) <= threshold_km
    }

    /// Leaf points among `nodes` that overlap `tapped`.
    ///
    /// Clusters never take part. The result keeps render order, is
    /// de-duplicated by point id and includes the tapped point itself when it
    /// is rendered.
    pub fn overlapping_points(
        tapped: &MapPoint,
        nodes: &[ClusterNode],
        threshold_km: f64,
    ) -> Vec<Arc<MapPoint>> {
        let mut seen = HashSet::new();
        nodes
            .iter()
            .filter_map(ClusterNode::as_leaf)
            .filter(|f| Self::is_overlapped(&f.point.location, &tapped.location, threshold_km))
            .filter(|f| seen.insert(f.point.id.clone()))
            .map(|f| Arc::clone(&f.point))
            .collect()
    }

    /// Circular layout around the points' common center.
    ///
    /// Position `i` sits at angle `START_ANGLE + i * 2π / n` on a circle whose
    /// circumference is `spread_km * (2 + n)`.
    pub fn layout(points: &[Arc<MapPoint>], spread_km: f64) -> Vec<SpiderfiedPoint> {
        let locations: Vec<LatLng> = points.iter().map(|p| p.location).collect();
        let Some(center) = average_geolocation(&locations) else {
            return Vec::new();
        };

        let count = points.len() as f64;
        let angle_step = (2.0 * PI) / count;
        let circumference_m = spread_km * 1000.0 * (2.0 + count);
        let leg = circumference_m / (2.0 * PI) / METERS_PER_DEGREE;

        points
            .iter()
            .enumerate()
            .map(|(i, point)| {
                let angle = START_ANGLE + i as f64 * angle_step;
                SpiderfiedPoint {
                    point: Arc::clone(point),
                    location: LatLng::new(
                        center.latitude + leg * angle.cos(),
                        center.longitude + leg * angle.sin(),
                    ),
                    origin: center,
                }
            })
            .collect()
    }

    /// Open a spider for `points`, replacing any open one.
    ///
    /// Fewer than two points collapse instead.
    pub fn explode(
        &mut self,
        points: Vec<Arc<MapPoint>>,
        spread_km: f64,
        zoom_level: Option<i32>,
    ) -> Vec<SpiderfyTransition> {
        if points.len() < 2 {
            return self.collapse();
        }

        let spread = Self::layout(&points, spread_km);
        let lines = spread
            .iter()
            .map(|p| SpiderLine {
                id: format!("line-{}", p.point.id),
                origin: p.origin,
                location: p.location,
            })
            .collect();
        let state = SpiderfyState {
            points: spread
                .into_iter()
                .map(|p| (p.point.id.clone(), p))
                .collect(),
            zoom_level,
            lines,
        };

        debug!(
            "[Spiderfier] Opened spider with {} points at zoom {:?}",
            state.len(),
            zoom_level
        );
        self.state = Some(state.clone());
        vec![SpiderfyTransition::Cleared, SpiderfyTransition::Opened(state)]
    }

    /// Close any open spider.
    pub fn collapse(&mut self) -> Vec<SpiderfyTransition> {
        if self.state.take().is_some() {
            debug!("[Spiderfier] Collapsed spider");
        }
        vec![SpiderfyTransition::Cleared]
    }

    /// Whether the zoom moved by at least one level since the spider opened.
    pub fn should_collapse(&self, current_zoom: Option<i32>) -> bool {
        match (self.state.as_ref().and_then(|s| s.zoom_level), current_zoom) {
            (Some(opened), Some(current)) => (opened - current).abs() >= 1,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClusterIndex, IndexOptions};

    fn shared(id: &str, lat: f64, lng: f64) -> Arc<MapPoint> {
        Arc::new(MapPoint::new(id, LatLng::new(lat, lng)))
    }

    fn leaves(points: Vec<MapPoint>) -> Vec<ClusterNode> {
        let index = ClusterIndex::build(IndexOptions::default(), 40.0, points);
        let world = crate::BoundingBox::new(-180.0, -85.0, 180.0, 85.0);
        index.get_clusters(&world, 25.0)
    }

    #[test]
    fn test_config_validation() {
        assert!(SpiderfyConfig::default().validate().is_ok());
        let bad = SpiderfyConfig {
            spread_px: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_coincident_points_spread_evenly() {
        let points = vec![
            shared("a", 48.8566, 2.3522),
            shared("b", 48.8566, 2.3522),
            shared("c", 48.8566, 2.3522),
        ];
        let spread = Spiderfier::layout(&points, 0.05);
        assert_eq!(spread.len(), 3);

        let center = spread[0].origin;
        assert!((center.latitude - 48.8566).abs() < 1e-9);
        assert!((center.longitude - 2.3522).abs() < 1e-9);

        let expected_leg = 0.05 * 1000.0 * 5.0 / (2.0 * PI) / METERS_PER_DEGREE;
        let angles: Vec<f64> = spread
            .iter()
            .map(|p| {
                let dlat = p.location.latitude - center.latitude;
                let dlng = p.location.longitude - center.longitude;
                assert!((dlat.hypot(dlng) - expected_leg).abs() < 1e-12);
                dlng.atan2(dlat)
            })
            .collect();

        for pair in angles.windows(2) {
            let step = (pair[1] - pair[0]).rem_euclid(2.0 * PI);
            assert!((step - 2.0 * PI / 3.0).abs() < 1e-9, "step was {}", step);
        }
        assert!((angles[0] - START_ANGLE).abs() < 1e-9);
    }

    #[test]
    fn test_distant_points_do_not_overlap() {
        // 5 km apart; at 4 px per km the 15 px threshold is 3.75 km
        let a = MapPoint::new("a", LatLng::new(0.0, 0.0));
        let b = MapPoint::new("b", LatLng::new(0.0, 0.044966));
        let threshold_km = 15.0 / 4.0;

        let nodes = leaves(vec![a.clone(), b]);
        let overlapping = Spiderfier::overlapping_points(&a, &nodes, threshold_km);
        assert_eq!(overlapping.len(), 1);

        let mut spiderfier = Spiderfier::default();
        let transitions = spiderfier.explode(overlapping, 30.0 / 4.0, Some(10));
        assert_eq!(transitions, vec![SpiderfyTransition::Cleared]);
        assert!(!spiderfier.is_active());
    }

    #[test]
    fn test_overlapping_points_skip_clusters_and_duplicates() {
        let a = MapPoint::new("a", LatLng::new(10.0, 10.0));
        let b = MapPoint::new("b", LatLng::new(10.0, 10.00001));
        let mut nodes = leaves(vec![a.clone(), b]);
        nodes.extend(leaves(vec![a.clone()]));

        let grouped = ClusterIndex::build(
            IndexOptions::default(),
            40.0,
            vec![a.clone(), MapPoint::new("z", LatLng::new(10.0, 10.0))],
        );
        let world = crate::BoundingBox::new(-180.0, -85.0, 180.0, 85.0);
        nodes.extend(grouped.get_clusters(&world, 1.0));

        let ids: Vec<String> = Spiderfier::overlapping_points(&a, &nodes, 0.1)
            .iter()
            .map(|p| p.id.clone())
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_explode_emits_clear_then_open() {
        let mut spiderfier = Spiderfier::default();
        let points = vec![shared("a", 1.0, 1.0), shared("b", 1.0, 1.0)];
        let transitions = spiderfier.explode(points, 0.1, Some(12));

        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0], SpiderfyTransition::Cleared);
        match &transitions[1] {
            SpiderfyTransition::Opened(state) => {
                assert_eq!(state.len(), 2);
                assert_eq!(state.zoom_level, Some(12));
                let ids: Vec<&str> = state.lines.iter().map(|l| l.id.as_str()).collect();
                assert_eq!(ids, vec!["line-a", "line-b"]);
            }
            other => panic!("expected Opened, got {:?}", other),
        }
        assert!(spiderfier.spiderfied("a").is_some());
        assert!(spiderfier.spiderfied("c").is_none());
    }

    #[test]
    fn test_collapse_on_zoom_change() {
        let mut spiderfier = Spiderfier::default();
        assert!(!spiderfier.should_collapse(Some(3)));

        spiderfier.explode(vec![shared("a", 1.0, 1.0), shared("b", 1.0, 1.0)], 0.1, Some(12));
        assert!(!spiderfier.should_collapse(Some(12)));
        assert!(spiderfier.should_collapse(Some(13)));
        assert!(spiderfier.should_collapse(Some(10)));
        assert!(!spiderfier.should_collapse(None));

        assert_eq!(spiderfier.collapse(), vec![SpiderfyTransition::Cleared]);
        assert!(spiderfier.state().is_none());
    }

    #[test]
    fn test_transition_json() {
        let json = serde_json::to_value(SpiderfyTransition::Cleared).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "cleared" }));
    }
}
