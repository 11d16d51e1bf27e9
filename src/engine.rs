//! # Map Engine
//!
//! Stateful clustering engine that keeps the dataset, the current region and
//! the open spider in Rust. The host forwards map events and renders the
//! frames it gets back.
//!
//! ## Architecture
//!
//! The engine is a state machine with three inputs:
//! - `dataset_changed`: full index rebuild, re-query, spider collapse
//! - `region_changed`: re-query (unless throttled), zoom-driven collapse
//! - `marker_tapped`: overlap detection, then explode or collapse
//!
//! Every transition produces an immutable [`MapFrame`] shared through an
//! `Arc`; an unchanged frame is returned as the same `Arc`.
//!
//! Mobile code talks to a process-wide singleton through thin JSON FFI calls.

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::geo_utils::{bounding_box_to_region, pixels_to_km, zoom_level_from_region};
use crate::{
    BoundingBox, Cluster, ClusterConfig, ClusterId, ClusterIndex, ClusterNode, LatLng, MapPoint,
    Region, Result, ScreenSize, SpiderLine, Spiderfier, SpiderfyState, SpiderfyTransition,
    ViewportClusterer,
};

// ============================================================================
// Frame Types
// ============================================================================

/// One item the host should draw.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Renderable {
    Cluster(Cluster),
    Marker {
        point: Arc<MapPoint>,
        /// Where to draw the marker (the spread position when spiderfied)
        location: LatLng,
        /// Spider center, for spiderfied markers
        origin: Option<LatLng>,
        is_spiderfied: bool,
    },
}

impl Renderable {
    fn marker(point: &Arc<MapPoint>) -> Self {
        Renderable::Marker {
            point: Arc::clone(point),
            location: point.location,
            origin: None,
            is_spiderfied: false,
        }
    }

    /// Number of dataset points this item stands for.
    pub fn leaf_count(&self) -> usize {
        match self {
            Renderable::Cluster(c) => c.point_count,
            Renderable::Marker { .. } => 1,
        }
    }

    pub fn location(&self) -> LatLng {
        match self {
            Renderable::Cluster(c) => c.location,
            Renderable::Marker { location, .. } => *location,
        }
    }

    /// Point id for markers, `None` for clusters.
    pub fn point_id(&self) -> Option<&str> {
        match self {
            Renderable::Cluster(_) => None,
            Renderable::Marker { point, .. } => Some(point.id.as_str()),
        }
    }
}

/// Everything the host renders for the current state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapFrame {
    pub renderables: Vec<Renderable>,
    pub spider_lines: Vec<SpiderLine>,
}

/// Result of a region change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionOutcome {
    pub frame: Arc<MapFrame>,
    /// The index was queried for the new region
    pub requeried: bool,
    /// The number of renderables changed (hosts may animate the layout)
    pub clusters_changed: bool,
    /// An open spider was collapsed
    pub collapsed: bool,
}

/// Result of a marker tap.
#[derive(Debug, Clone, Serialize)]
pub struct TapOutcome {
    pub transitions: Vec<SpiderfyTransition>,
    pub frame: Arc<MapFrame>,
}

/// Result of pressing a cluster: its leaves and a region fitting them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterActivation {
    pub cluster_id: ClusterId,
    pub leaves: Vec<Arc<MapPoint>>,
    pub region: Region,
}

// ============================================================================
// Map Engine
// ============================================================================

/// The clustering state machine.
#[derive(Debug)]
pub struct MapEngine {
    config: ClusterConfig,
    screen: ScreenSize,
    region: Option<Region>,
    viewport: ViewportClusterer,
    spiderfier: Spiderfier,
    /// Result of the last cluster query
    nodes: Vec<ClusterNode>,
    frame: Arc<MapFrame>,
}

impl Default for MapEngine {
    fn default() -> Self {
        Self::from_validated(ClusterConfig::default(), ScreenSize::default())
    }
}

impl MapEngine {
    /// Create an engine with an empty dataset.
    pub fn new(config: ClusterConfig, screen: ScreenSize) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_validated(config, screen))
    }

    fn from_validated(config: ClusterConfig, screen: ScreenSize) -> Self {
        Self {
            viewport: ViewportClusterer::new(config.index.clone(), config.viewport.clone()),
            spiderfier: Spiderfier::new(config.spiderfy.clone()),
            config,
            screen,
            region: None,
            nodes: Vec::new(),
            frame: Arc::new(MapFrame::default()),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Last region that was queried.
    pub fn region(&self) -> Option<&Region> {
        self.region.as_ref()
    }

    pub fn screen(&self) -> &ScreenSize {
        &self.screen
    }

    pub fn frame(&self) -> Arc<MapFrame> {
        Arc::clone(&self.frame)
    }

    pub fn index(&self) -> Arc<ClusterIndex> {
        self.viewport.index()
    }

    pub fn spiderfy_state(&self) -> Option<&SpiderfyState> {
        self.spiderfier.state()
    }

    /// Set the region without producing a frame (initial camera position).
    pub fn set_region(&mut self, region: Region) {
        self.region = Some(region);
    }

    /// Replace the dataset.
    ///
    /// Rebuilds the index, re-queries the current region without the
    /// throttle and collapses any open spider.
    pub fn dataset_changed(&mut self, points: Vec<MapPoint>) -> Arc<MapFrame> {
        let count = points.len();
        self.viewport.rebuild(points, &self.screen);
        self.nodes = match &self.region {
            Some(region) => self.viewport.query_unthrottled(region, &self.screen),
            None => Vec::new(),
        };
        self.spiderfier.collapse();
        self.frame = Arc::new(self.compose());

        info!(
            "[MapEngine] Dataset changed: {} points, {} renderables",
            count,
            self.frame.renderables.len()
        );
        self.frame()
    }

    /// React to a settled camera.
    ///
    /// Regions wider than the throttle threshold keep the previous frame and
    /// stored region. An open spider collapses once the zoom level moved by
    /// one or more since it opened. Regions with non-finite fields are
    /// ignored.
    pub fn region_changed(&mut self, region: Region, screen: ScreenSize) -> RegionOutcome {
        if !region.is_finite() {
            warn!("[MapEngine] Ignoring malformed region {:?}", region);
            return RegionOutcome {
                frame: self.frame(),
                requeried: false,
                clusters_changed: false,
                collapsed: false,
            };
        }

        self.screen = screen;
        let previous_len = self.frame.renderables.len();

        let requeried = match self.viewport.query(&region, &self.screen) {
            Some(nodes) => {
                self.nodes = nodes;
                self.region = Some(region);
                true
            }
            None => false,
        };

        let collapsed = self
            .spiderfier
            .should_collapse(zoom_level_from_region(Some(&region)));
        if collapsed {
            self.spiderfier.collapse();
        }

        if requeried || collapsed {
            self.frame = Arc::new(self.compose());
        }

        let clusters_changed = self.frame.renderables.len() != previous_len;
        debug!(
            "[MapEngine] Region changed: requeried={} collapsed={} renderables={}",
            requeried,
            collapsed,
            self.frame.renderables.len()
        );

        RegionOutcome {
            frame: self.frame(),
            requeried,
            clusters_changed,
            collapsed,
        }
    }

    /// React to a tap on a single marker.
    ///
    /// Tapping a spread marker closes the spider. Otherwise the rendered
    /// markers overlapping the tapped one explode into a spider; a marker
    /// without overlaps closes any open spider.
    pub fn marker_tapped(&mut self, point_id: &str) -> TapOutcome {
        if !self.config.clustering_enabled {
            return TapOutcome {
                transitions: Vec::new(),
                frame: self.frame(),
            };
        }

        let transitions = if self.spiderfier.spiderfied(point_id).is_some() {
            self.spiderfier.collapse()
        } else {
            match self.overlap_for(point_id) {
                Some((overlapping, spread_km, zoom)) if overlapping.len() > 1 => {
                    self.spiderfier.explode(overlapping, spread_km, zoom)
                }
                _ => self.spiderfier.collapse(),
            }
        };

        self.frame = Arc::new(self.compose());
        TapOutcome {
            transitions,
            frame: self.frame(),
        }
    }

    /// Overlapping markers for a tap, plus the spread distance and zoom.
    fn overlap_for(&self, point_id: &str) -> Option<(Vec<Arc<MapPoint>>, f64, Option<i32>)> {
        let region = self.region.as_ref()?;
        let tapped = self
            .nodes
            .iter()
            .filter_map(ClusterNode::as_leaf)
            .find(|f| f.point.id == point_id)?;

        let spiderfy = self.spiderfier.config();
        let threshold_km = pixels_to_km(spiderfy.overlap_threshold_px, region, &self.screen)?;
        let spread_km = pixels_to_km(spiderfy.spread_px, region, &self.screen)?;

        let overlapping = Spiderfier::overlapping_points(&tapped.point, &self.nodes, threshold_km);
        Some((overlapping, spread_km, zoom_level_from_region(Some(region))))
    }

    /// Leaves of a pressed cluster and a padded region fitting them.
    ///
    /// `None` for stale or unknown cluster ids.
    pub fn cluster_pressed(&self, cluster_id: &ClusterId) -> Option<ClusterActivation> {
        let leaves = self.get_leaves(cluster_id, self.config.cluster_press_max_children);
        let locations: Vec<LatLng> = leaves.iter().map(|p| p.location).collect();
        let bbox = BoundingBox::from_locations(&locations)?;

        Some(ClusterActivation {
            cluster_id: *cluster_id,
            region: bounding_box_to_region(&self.pad(bbox)),
            leaves,
        })
    }

    /// Up to `limit` leaves of a cluster in dataset order.
    pub fn get_leaves(&self, cluster_id: &ClusterId, limit: usize) -> Vec<Arc<MapPoint>> {
        self.viewport
            .index()
            .get_leaves(cluster_id, limit, 0)
            .into_iter()
            .map(|f| f.point)
            .collect()
    }

    /// Drop the dataset, region and spider; configuration is kept.
    pub fn clear(&mut self) {
        self.viewport.rebuild(Vec::new(), &self.screen);
        self.spiderfier.collapse();
        self.region = None;
        self.nodes.clear();
        self.frame = Arc::new(MapFrame::default());
        info!("[MapEngine] Cleared");
    }

    /// Grow `bbox` so the edge padding (in pixels) surrounds it on screen.
    fn pad(&self, bbox: BoundingBox) -> BoundingBox {
        let padding = &self.config.edge_padding;
        let inner_width = self.screen.width - padding.left - padding.right;
        let inner_height = self.screen.height - padding.top - padding.bottom;

        let lng_per_px = if inner_width > 0.0 {
            (bbox.east - bbox.west) / inner_width
        } else {
            0.0
        };
        let lat_per_px = if inner_height > 0.0 {
            (bbox.north - bbox.south) / inner_height
        } else {
            0.0
        };

        BoundingBox::new(
            bbox.west - padding.left * lng_per_px,
            (bbox.south - padding.bottom * lat_per_px).max(-90.0),
            bbox.east + padding.right * lng_per_px,
            (bbox.north + padding.top * lat_per_px).min(90.0),
        )
    }

    fn compose(&self) -> MapFrame {
        if !self.config.clustering_enabled {
            return MapFrame {
                renderables: self.index().points().iter().map(Renderable::marker).collect(),
                spider_lines: Vec::new(),
            };
        }

        let renderables = self
            .nodes
            .iter()
            .map(|node| match node {
                ClusterNode::Cluster(cluster) => Renderable::Cluster(cluster.clone()),
                ClusterNode::Leaf(feature) => match self.spiderfier.spiderfied(&feature.point.id) {
                    Some(spread) => Renderable::Marker {
                        point: Arc::clone(&spread.point),
                        location: spread.location,
                        origin: Some(spread.origin),
                        is_spiderfied: true,
                    },
                    None => Renderable::marker(&feature.point),
                },
            })
            .collect();

        MapFrame {
            renderables,
            spider_lines: self
                .spiderfier
                .state()
                .map(|s| s.lines.clone())
                .unwrap_or_default(),
        }
    }
}

// ============================================================================
// Global Singleton
// ============================================================================

/// Global engine instance.
///
/// This singleton allows FFI calls to access a shared engine without
/// passing state back and forth across the FFI boundary.
pub static ENGINE: Lazy<Mutex<MapEngine>> = Lazy::new(|| Mutex::new(MapEngine::default()));

/// Run `f` with the global engine locked.
///
/// A poisoned lock is recovered; the engine state is replaced wholesale by
/// every transition, so it is never left half-updated.
pub fn with_engine<F, R>(f: F) -> R
where
    F: FnOnce(&mut MapEngine) -> R,
{
    let mut engine = ENGINE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut engine)
}

// ============================================================================
// FFI Exports
// ============================================================================

#[cfg(feature = "ffi")]
pub mod engine_ffi {
    use super::*;
    use log::{info, warn};

    fn to_json<T: Serialize>(value: &T, fallback: &str) -> String {
        serde_json::to_string(value).unwrap_or_else(|e| {
            warn!("[MapEngine] Failed to serialize response: {}", e);
            fallback.to_string()
        })
    }

    /// Initialize the engine with a JSON configuration (empty for defaults).
    /// Returns false when the configuration is invalid.
    #[uniffi::export]
    pub fn engine_init(config_json: String, width: f64, height: f64) -> bool {
        crate::init_logging();

        let config = if config_json.trim().is_empty() {
            Ok(ClusterConfig::default())
        } else {
            serde_json::from_str::<ClusterConfig>(&config_json).map_err(crate::ClusterError::from)
        };

        match config.and_then(|c| MapEngine::new(c, ScreenSize::new(width, height))) {
            Ok(engine) => {
                with_engine(|e| *e = engine);
                info!("[MapEngine] Initialized ({}x{})", width, height);
                true
            }
            Err(e) => {
                warn!("[MapEngine] Init failed: {}", e);
                false
            }
        }
    }

    /// Replace the dataset from a JSON array of points.
    /// Returns the new frame as JSON.
    #[uniffi::export]
    pub fn engine_set_dataset_json(points_json: String) -> String {
        let points: Vec<MapPoint> = match serde_json::from_str(&points_json) {
            Ok(points) => points,
            Err(e) => {
                warn!("[MapEngine] Invalid dataset JSON: {}", e);
                return "{}".to_string();
            }
        };
        let frame = with_engine(|e| e.dataset_changed(points));
        to_json(&*frame, "{}")
    }

    /// Handle a settled camera.
    /// Returns: {"frame": {...}, "requeried": bool, "clustersChanged": bool, "collapsed": bool}
    #[uniffi::export]
    pub fn engine_on_region_change(
        latitude: f64,
        longitude: f64,
        latitude_delta: f64,
        longitude_delta: f64,
        width: f64,
        height: f64,
    ) -> String {
        let region = Region::new(latitude, longitude, latitude_delta, longitude_delta);
        let outcome = with_engine(|e| e.region_changed(region, ScreenSize::new(width, height)));
        to_json(&outcome, "{}")
    }

    /// Handle a marker tap.
    /// Returns: {"transitions": [...], "frame": {...}}
    #[uniffi::export]
    pub fn engine_on_marker_tap(point_id: String) -> String {
        let outcome = with_engine(|e| e.marker_tapped(&point_id));
        to_json(&outcome, "{}")
    }

    /// Handle a cluster press.
    /// Returns: {"clusterId": {...}, "leaves": [...], "region": {...}}, or "null" for stale ids.
    #[uniffi::export]
    pub fn engine_on_cluster_press(generation: u64, cluster_id: u64) -> String {
        let Some(id) = ClusterId::from_host(generation, cluster_id) else {
            warn!("[MapEngine] Cluster id {} out of range", cluster_id);
            return "null".to_string();
        };
        let activation = with_engine(|e| e.cluster_pressed(&id));
        to_json(&activation, "null")
    }

    /// Get up to `limit` leaves of a cluster as a JSON array of points.
    #[uniffi::export]
    pub fn engine_get_leaves_json(generation: u64, cluster_id: u64, limit: u32) -> String {
        let Some(id) = ClusterId::from_host(generation, cluster_id) else {
            warn!("[MapEngine] Cluster id {} out of range", cluster_id);
            return "[]".to_string();
        };
        let leaves = with_engine(|e| e.get_leaves(&id, limit as usize));
        to_json(&leaves, "[]")
    }

    /// Clear all engine state.
    #[uniffi::export]
    pub fn engine_clear() {
        with_engine(|e| e.clear());
    }
}

// ============================================================================
// Tests
// ============================================================================
