//! Region -> cluster set queries.
//!
//! Owns the current [`ClusterIndex`] behind an `Arc` that is replaced on
//! every rebuild. Wide regions use the index's minimum zoom instead of a
//! fitted one, and very wide regions are throttled entirely.

use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::geo_utils::{fit_zoom, region_to_bounding_box};
use crate::{
    ClusterError, ClusterIndex, ClusterNode, IndexOptions, MapPoint, Region, Result, ScreenSize,
};

/// Longitude-span thresholds for viewport queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ViewportConfig {
    /// Regions at least this wide (degrees of longitude) query at `min_zoom`.
    /// Default: 40
    pub fit_zoom_threshold: f64,

    /// Regions wider than this are not re-queried at all.
    /// Default: 80
    pub throttle_threshold: f64,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            fit_zoom_threshold: 40.0,
            throttle_threshold: 80.0,
        }
    }
}

impl ViewportConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("fit_zoom_threshold", self.fit_zoom_threshold),
            ("throttle_threshold", self.throttle_threshold),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ClusterError::config(format!(
                    "{} ({}) must be a positive number of degrees",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Turns map regions into cluster sets against a replaceable index.
#[derive(Debug)]
pub struct ViewportClusterer {
    options: IndexOptions,
    config: ViewportConfig,
    index: Arc<ClusterIndex>,
}

impl ViewportClusterer {
    /// Create a clusterer over an empty index.
    pub fn new(options: IndexOptions, config: ViewportConfig) -> Self {
        let radius = options.effective_radius(0.0);
        let index = Arc::new(ClusterIndex::empty(options.clone(), radius));
        Self {
            options,
            config,
            index,
        }
    }

    /// The current index. Clones stay valid across rebuilds.
    pub fn index(&self) -> Arc<ClusterIndex> {
        Arc::clone(&self.index)
    }

    pub fn config(&self) -> &ViewportConfig {
        &self.config
    }

    /// Build a new index for `points` and make it current.
    ///
    /// The radius is derived from the screen width at build time.
    pub fn rebuild(&mut self, points: Vec<MapPoint>, screen: &ScreenSize) -> Arc<ClusterIndex> {
        let radius = self.options.effective_radius(screen.width);
        let index = Arc::new(ClusterIndex::build(self.options.clone(), radius, points));
        self.index = Arc::clone(&index);
        index
    }

    /// Zoom used to query the index for this region.
    pub fn effective_zoom(&self, region: &Region, screen: &ScreenSize) -> f64 {
        if region.longitude_delta >= self.config.fit_zoom_threshold {
            self.options.min_zoom as f64
        } else {
            fit_zoom(&region_to_bounding_box(region), screen)
        }
    }

    /// Whether the region is too wide to re-query.
    ///
    /// A span that is not a number is throttled as well.
    pub fn is_throttled(&self, region: &Region) -> bool {
        !(region.longitude_delta <= self.config.throttle_threshold)
    }

    /// Cluster set for the region, or `None` when the region is throttled
    /// and the previous render state should be kept.
    pub fn query(&self, region: &Region, screen: &ScreenSize) -> Option<Vec<ClusterNode>> {
        if self.is_throttled(region) {
            debug!(
                "[Viewport] Throttled region with longitude span {}",
                region.longitude_delta
            );
            return None;
        }
        Some(self.query_unthrottled(region, screen))
    }

    /// Cluster set for the region regardless of its width.
    pub fn query_unthrottled(&self, region: &Region, screen: &ScreenSize) -> Vec<ClusterNode> {
        let bbox = region_to_bounding_box(region);
        let zoom = self.effective_zoom(region, screen);
        self.index.get_clusters(&bbox, zoom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LatLng;

    const SCREEN: ScreenSize = ScreenSize {
        width: 400.0,
        height: 800.0,
    };

    fn city_points() -> Vec<MapPoint> {
        (0..20)
            .map(|i| {
                let lat = 51.50 + (i % 5) as f64 * 0.002;
                let lng = -0.12 + (i / 5) as f64 * 0.002;
                MapPoint::new(format!("p{}", i), LatLng::new(lat, lng))
            })
            .collect()
    }

    fn clusterer() -> ViewportClusterer {
        let mut clusterer =
            ViewportClusterer::new(IndexOptions::default(), ViewportConfig::default());
        clusterer.rebuild(city_points(), &SCREEN);
        clusterer
    }

    #[test]
    fn test_config_validation() {
        assert!(ViewportConfig::default().validate().is_ok());
        let bad = ViewportConfig {
            throttle_threshold: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_wide_region_uses_min_zoom() {
        let clusterer = clusterer();
        let region = Region::new(40.0, 0.0, 30.0, 40.0);
        assert_eq!(clusterer.effective_zoom(&region, &SCREEN), 1.0);
    }

    #[test]
    fn test_narrow_region_uses_fitted_zoom() {
        let clusterer = clusterer();
        let region = Region::new(51.5, -0.12, 0.01, 0.01);
        let zoom = clusterer.effective_zoom(&region, &SCREEN);
        assert!(zoom > 10.0 && zoom <= 20.0, "zoom was {}", zoom);
    }

    #[test]
    fn test_throttle_boundary() {
        let clusterer = clusterer();
        assert!(clusterer.query(&Region::new(0.0, 0.0, 60.0, 80.0), &SCREEN).is_some());
        assert!(clusterer.query(&Region::new(0.0, 0.0, 60.0, 90.0), &SCREEN).is_none());

        let nodes = clusterer.query_unthrottled(&Region::new(0.0, 0.0, 60.0, 90.0), &SCREEN);
        assert_eq!(nodes.iter().map(|n| n.leaf_count()).sum::<usize>(), 20);
    }

    #[test]
    fn test_nan_span_is_throttled() {
        let clusterer = clusterer();
        let region = Region::new(51.5, -0.12, 0.05, f64::NAN);
        assert!(clusterer.is_throttled(&region));
        assert!(clusterer.query(&region, &SCREEN).is_none());
        assert!(!clusterer.is_throttled(&Region::new(51.5, -0.12, 0.05, -10.0)));
    }

    #[test]
    fn test_min_zoom_query_covers_all_points() {
        let clusterer = clusterer();
        let region = Region::new(51.5, -0.12, 45.0, 45.0);
        let nodes = clusterer.query(&region, &SCREEN).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].leaf_count(), 20);
    }

    #[test]
    fn test_rebuild_swaps_index() {
        let mut clusterer = clusterer();
        let old = clusterer.index();
        assert_eq!(old.len(), 20);
        assert!((old.radius() - 18.0).abs() < 1e-9);

        let fresh = clusterer.rebuild(city_points().into_iter().take(3).collect(), &SCREEN);
        assert!(Arc::ptr_eq(&fresh, &clusterer.index()));
        assert_ne!(old.generation(), fresh.generation());
        assert_eq!(old.len(), 20);
        assert_eq!(fresh.len(), 3);
    }
}
