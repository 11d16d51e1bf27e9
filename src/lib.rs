//! # Marker Cluster
//!
//! Viewport-driven marker clustering and spiderfy layout for interactive maps.
//!
//! This library provides:
//! - A multi-resolution cluster index over geographic points
//! - Viewport queries that turn a map region into clusters and markers
//! - Spiderfying: spreading overlapping markers onto a small circle
//! - A stateful engine that drives all of the above from host events
//!
//! ## Features
//!
//! - **`parallel`** - Project large datasets on rayon during index builds
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use marker_cluster::{ClusterConfig, LatLng, MapEngine, MapPoint, Region, ScreenSize};
//!
//! let mut engine = MapEngine::new(ClusterConfig::default(), ScreenSize::new(400.0, 800.0))?;
//!
//! let points = vec![
//!     MapPoint::new("a", LatLng::new(51.5074, -0.1278)),
//!     MapPoint::new("b", LatLng::new(51.5075, -0.1279)),
//!     MapPoint::new("c", LatLng::new(48.8566, 2.3522)),
//! ];
//! engine.dataset_changed(points);
//!
//! let region = Region::new(50.0, 1.0, 4.0, 4.0);
//! let outcome = engine.region_changed(region, ScreenSize::new(400.0, 800.0));
//! let leaves: usize = outcome.frame.renderables.iter().map(|r| r.leaf_count()).sum();
//! assert_eq!(leaves, 3);
//! # Ok::<(), marker_cluster::ClusterError>(())
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{ClusterError, Result};

// Geographic utilities (distance, regions, bounding boxes, viewport fitting)
pub mod geo_utils;
pub use geo_utils::DistanceUnit;

// Multi-zoom cluster index
pub mod index;
pub use index::{Cluster, ClusterId, ClusterIndex, ClusterNode, Feature, IndexOptions};

// Region -> cluster set queries
pub mod viewport;
pub use viewport::{ViewportClusterer, ViewportConfig};

// Overlap detection and circular layout
pub mod spiderfy;
pub use spiderfy::{
    SpiderLine, SpiderfiedPoint, Spiderfier, SpiderfyConfig, SpiderfyState, SpiderfyTransition,
};

// Stateful map engine (singleton with dataset, region and spiderfy state)
pub mod engine;
pub use engine::{
    with_engine, ClusterActivation, MapEngine, MapFrame, RegionOutcome, Renderable, TapOutcome,
    ENGINE,
};

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("MarkerClusterRust"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A WGS84 coordinate with latitude and longitude in degrees.
///
/// # Example
/// ```
/// use marker_cluster::LatLng;
/// let point = LatLng::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLng {
    /// Create a new coordinate.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A point of interest supplied by the host.
///
/// Every field other than `id` and `location` is kept verbatim in `payload`
/// and flattened back out when serialized, so hosts get their own objects
/// back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPoint {
    /// Stable identity used for de-duplication and keying
    pub id: String,
    pub location: LatLng,
    /// Caller fields, opaque to the engine
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl MapPoint {
    /// Create a point without payload.
    pub fn new(id: impl Into<String>, location: LatLng) -> Self {
        Self {
            id: id.into(),
            location,
            payload: serde_json::Map::new(),
        }
    }

    /// Attach a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Check that the point can be placed on the map.
    pub fn validate(&self) -> Result<()> {
        if self.location.is_valid() {
            Ok(())
        } else {
            Err(ClusterError::InvalidPoint {
                id: self.id.clone(),
                message: format!(
                    "location ({}, {}) is not a valid WGS84 coordinate",
                    self.location.latitude, self.location.longitude
                ),
            })
        }
    }
}

/// The visible map viewport: center plus angular span.
///
/// Serialized in camelCase (`latitudeDelta`) to match map SDK regions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub latitude: f64,
    pub longitude: f64,
    pub latitude_delta: f64,
    pub longitude_delta: f64,
}

impl Region {
    pub fn new(latitude: f64, longitude: f64, latitude_delta: f64, longitude_delta: f64) -> Self {
        Self {
            latitude,
            longitude,
            latitude_delta,
            longitude_delta,
        }
    }

    /// Whether every field is a finite number.
    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude_delta.is_finite()
            && self.longitude_delta.is_finite()
    }

    /// Center of the region.
    pub fn center(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }

    /// Integer zoom level derived from the longitude span.
    pub fn zoom_level(&self) -> Option<i32> {
        geo_utils::zoom_level_from_region(Some(self))
    }
}

/// West-South-East-North extent in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Build from a `[west, south, east, north]` array.
    pub fn from_array(wsen: [f64; 4]) -> Self {
        Self::new(wsen[0], wsen[1], wsen[2], wsen[3])
    }

    /// The `[west, south, east, north]` array form.
    pub fn to_array(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }

    pub fn south_west(&self) -> LatLng {
        LatLng::new(self.south, self.west)
    }

    pub fn north_east(&self) -> LatLng {
        LatLng::new(self.north, self.east)
    }

    /// Smallest box enclosing all locations, `None` for empty input.
    pub fn from_locations(locations: &[LatLng]) -> Option<Self> {
        use geo::BoundingRect;

        let multi: geo::MultiPoint<f64> = locations
            .iter()
            .map(|l| geo::Point::new(l.longitude, l.latitude))
            .collect();
        let rect = multi.bounding_rect()?;
        Some(Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y))
    }
}

/// Screen dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: f64,
    pub height: f64,
}

impl ScreenSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// Length of the screen diagonal in pixels.
    pub fn diagonal(&self) -> f64 {
        self.width.hypot(self.height)
    }
}

/// Padding in pixels kept around points when fitting a region to them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgePadding {
    pub top: f64,
    pub left: f64,
    pub right: f64,
    pub bottom: f64,
}

impl Default for EdgePadding {
    fn default() -> Self {
        Self {
            top: 10.0,
            left: 10.0,
            right: 10.0,
            bottom: 10.0,
        }
    }
}

/// Configuration for the map engine.
///
/// Every field has a default, so hosts can send partial JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster index parameters (extent, zoom range, radius).
    pub index: IndexOptions,

    /// Viewport fitting and throttling thresholds.
    pub viewport: ViewportConfig,

    /// Overlap threshold and spread distance for spiderfying.
    pub spiderfy: SpiderfyConfig,

    /// When false, every point is rendered as a marker and taps are ignored.
    /// Default: true
    pub clustering_enabled: bool,

    /// Maximum leaves returned when a cluster is pressed.
    /// Default: 100
    pub cluster_press_max_children: usize,

    /// Padding applied when fitting a region around a pressed cluster.
    /// Default: 10px on every side
    pub edge_padding: EdgePadding,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            index: IndexOptions::default(),
            viewport: ViewportConfig::default(),
            spiderfy: SpiderfyConfig::default(),
            clustering_enabled: true,
            cluster_press_max_children: 100,
            edge_padding: EdgePadding::default(),
        }
    }
}

impl ClusterConfig {
    /// Validate every section of the configuration.
    pub fn validate(&self) -> Result<()> {
        self.index.validate()?;
        self.viewport.validate()?;
        self.spiderfy.validate()?;
        if self.cluster_press_max_children == 0 {
            return Err(ClusterError::config(
                "cluster_press_max_children must be at least 1",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
