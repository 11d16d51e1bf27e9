//! # Cluster Index
//!
//! Hierarchical point clustering across zoom levels.
//!
//! Points are projected to spherical mercator and stored in one R-tree per
//! zoom level. Clustering runs greedily from the leaf level (`max_zoom + 1`)
//! down to `min_zoom`: every node absorbs its not-yet-visited neighbours
//! within `radius / (extent * 2^zoom)` and the merged node is placed at the
//! count-weighted mean of its members.
//!
//! An index is immutable once built. A new dataset means a new index with a
//! new generation number; [`ClusterId`]s from older generations are answered
//! with empty results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use rstar::{primitives::GeomWithData, RTree, AABB};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::geo_utils::{lat_y, lng_x, x_lng, y_lat};
use crate::{BoundingBox, ClusterError, LatLng, MapPoint, Result};

/// Highest supported `max_zoom` (cluster ids reserve 5 bits for the level).
pub const MAX_ZOOM_LIMIT: u8 = 30;

/// Radius in pixels used when neither an explicit radius nor a usable screen
/// width is available.
pub const DEFAULT_RADIUS: f64 = 40.0;

/// Share of the screen width used as the default cluster radius.
pub const SCREEN_WIDTH_RADIUS_RATIO: f64 = 0.045;

const ZOOM_BITS: usize = 5;
const ZOOM_MASK: usize = (1 << ZOOM_BITS) - 1;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Options
// ============================================================================

/// Configuration for the cluster index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IndexOptions {
    /// Tile extent; the radius is relative to it.
    /// Default: 512
    pub extent: f64,

    /// Lowest zoom level that gets clusters.
    /// Default: 1
    pub min_zoom: u8,

    /// Highest zoom level that gets clusters. Above it every point is a leaf.
    /// Default: 20
    pub max_zoom: u8,

    /// Cluster radius in pixels. `None` means 4.5% of the screen width.
    pub radius: Option<f64>,

    /// Minimum number of points that form a cluster.
    /// Default: 2
    pub min_points: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            extent: 512.0,
            min_zoom: 1,
            max_zoom: 20,
            radius: None,
            min_points: 2,
        }
    }
}

impl IndexOptions {
    /// Check option ranges.
    pub fn validate(&self) -> Result<()> {
        if self.min_zoom > self.max_zoom {
            return Err(ClusterError::config(format!(
                "min_zoom ({}) must be <= max_zoom ({})",
                self.min_zoom, self.max_zoom
            )));
        }
        if self.max_zoom > MAX_ZOOM_LIMIT {
            return Err(ClusterError::config(format!(
                "max_zoom ({}) must be <= {}",
                self.max_zoom, MAX_ZOOM_LIMIT
            )));
        }
        if !(self.extent.is_finite() && self.extent > 0.0) {
            return Err(ClusterError::config(format!(
                "extent ({}) must be a positive number",
                self.extent
            )));
        }
        if let Some(radius) = self.radius {
            if !(radius.is_finite() && radius >= 0.0) {
                return Err(ClusterError::config(format!(
                    "radius ({}) must be a non-negative number",
                    radius
                )));
            }
        }
        if self.min_points < 2 {
            return Err(ClusterError::config("min_points must be at least 2"));
        }
        Ok(())
    }

    /// Cluster radius in pixels for a screen of the given width.
    ///
    /// Ties cluster density to the device screen: without an explicit radius
    /// it is 4.5% of the width.
    pub fn effective_radius(&self, screen_width: f64) -> f64 {
        match self.radius {
            Some(radius) => radius,
            None => {
                let radius = screen_width * SCREEN_WIDTH_RADIUS_RATIO;
                if radius.is_finite() && radius > 0.0 {
                    radius
                } else {
                    DEFAULT_RADIUS
                }
            }
        }
    }
}

// ============================================================================
// Public Node Types
// ============================================================================

/// Identifier of a cluster within one index build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId {
    /// Build that produced this id
    pub generation: u64,
    /// Id within the build
    pub value: usize,
}

impl ClusterId {
    /// Id from host integers; `None` when the value does not fit this platform.
    pub fn from_host(generation: u64, value: u64) -> Option<Self> {
        let value = usize::try_from(value).ok()?;
        Some(Self { generation, value })
    }
}

/// A single original point as stored in the index.
#[derive(Debug, Clone)]
pub struct Feature {
    pub point: Arc<MapPoint>,
    /// Position of the point in the ingested dataset
    pub index: usize,
}

impl Feature {
    /// Leaves never aggregate other points.
    pub fn point_count(&self) -> usize {
        0
    }

    pub fn location(&self) -> LatLng {
        self.point.location
    }
}

/// A synthetic aggregate of nearby points.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub id: ClusterId,
    /// Count-weighted center of the members
    pub location: LatLng,
    /// Number of leaves under this cluster
    pub point_count: usize,
    /// Short label, e.g. "999", "1.2k", "15k"
    pub point_count_abbreviated: String,
}

/// An entry of a cluster query: a cluster or a single point.
#[derive(Debug, Clone)]
pub enum ClusterNode {
    Cluster(Cluster),
    Leaf(Feature),
}

impl ClusterNode {
    /// Aggregated point count (0 for leaves).
    pub fn point_count(&self) -> usize {
        match self {
            ClusterNode::Cluster(c) => c.point_count,
            ClusterNode::Leaf(f) => f.point_count(),
        }
    }

    /// Number of original points represented by this node.
    pub fn leaf_count(&self) -> usize {
        match self {
            ClusterNode::Cluster(c) => c.point_count,
            ClusterNode::Leaf(_) => 1,
        }
    }

    pub fn location(&self) -> LatLng {
        match self {
            ClusterNode::Cluster(c) => c.location,
            ClusterNode::Leaf(f) => f.location(),
        }
    }

    pub fn as_leaf(&self) -> Option<&Feature> {
        match self {
            ClusterNode::Leaf(f) => Some(f),
            ClusterNode::Cluster(_) => None,
        }
    }
}

// ============================================================================
// Internal Levels
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum NodeKind {
    /// Index into the dataset
    Leaf(usize),
    /// Raw cluster id
    Cluster(usize),
}

#[derive(Debug, Clone, Copy)]
struct Node {
    x: f64,
    y: f64,
    kind: NodeKind,
    parent: Option<usize>,
    num_points: usize,
    visited: bool,
}

impl Node {
    fn leaf(index: usize, location: &LatLng) -> Self {
        Self {
            x: lng_x(location.longitude),
            y: lat_y(location.latitude),
            kind: NodeKind::Leaf(index),
            parent: None,
            num_points: 1,
            visited: false,
        }
    }

    /// Copy of this node for the next (coarser) level.
    fn carried(&self) -> Self {
        Self {
            parent: None,
            visited: false,
            ..*self
        }
    }
}

type Entry = GeomWithData<[f64; 2], usize>;

/// Nodes of one zoom level plus an R-tree over their positions.
#[derive(Debug, Default)]
struct Level {
    nodes: Vec<Node>,
    tree: RTree<Entry>,
}

impl Level {
    fn new(nodes: Vec<Node>) -> Self {
        let entries: Vec<Entry> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| GeomWithData::new([n.x, n.y], i))
            .collect();
        Self {
            nodes,
            tree: RTree::bulk_load(entries),
        }
    }

    /// Node indexes within `radius` of (x, y), ascending.
    fn within(&self, x: f64, y: f64, radius: f64) -> Vec<usize> {
        let mut ids: Vec<usize> = self
            .tree
            .locate_within_distance([x, y], radius * radius)
            .map(|e| e.data)
            .collect();
        ids.sort_unstable();
        ids
    }
}

// ============================================================================
// Cluster Index
// ============================================================================

/// Immutable multi-zoom cluster index over one dataset.
///
/// # Example
/// ```
/// use marker_cluster::{BoundingBox, ClusterIndex, IndexOptions, LatLng, MapPoint};
///
/// let points = vec![
///     MapPoint::new("a", LatLng::new(51.5074, -0.1278)),
///     MapPoint::new("b", LatLng::new(51.5076, -0.1280)),
/// ];
/// let index = ClusterIndex::build(IndexOptions::default(), 40.0, points);
///
/// let world = BoundingBox::new(-180.0, -85.0, 180.0, 85.0);
/// let nodes = index.get_clusters(&world, 2.0);
/// assert_eq!(nodes.len(), 1);
/// assert_eq!(nodes[0].point_count(), 2);
/// ```
#[derive(Debug)]
pub struct ClusterIndex {
    options: IndexOptions,
    radius: f64,
    generation: u64,
    points: Vec<Arc<MapPoint>>,
    /// Indexed by zoom; `levels[max_zoom + 1]` holds the leaves
    levels: Vec<Level>,
}

impl ClusterIndex {
    /// An index without points.
    pub fn empty(options: IndexOptions, radius: f64) -> Self {
        Self::build(options, radius, Vec::new())
    }

    /// Build an index over a full dataset.
    ///
    /// Points without a valid WGS84 location are skipped. The options are
    /// expected to be validated; zooms beyond [`MAX_ZOOM_LIMIT`] are capped.
    pub fn build(options: IndexOptions, radius: f64, points: Vec<MapPoint>) -> Self {
        let start = Instant::now();
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let total = points.len();

        let points: Vec<Arc<MapPoint>> = points
            .into_iter()
            .filter_map(|point| match point.validate() {
                Ok(()) => Some(Arc::new(point)),
                Err(e) => {
                    debug!("[ClusterIndex] {}", e);
                    None
                }
            })
            .collect();

        if points.len() < total {
            warn!(
                "[ClusterIndex] Skipped {} of {} points with invalid locations",
                total - points.len(),
                total
            );
        }

        let max_zoom = options.max_zoom.min(MAX_ZOOM_LIMIT);
        let min_zoom = options.min_zoom.min(max_zoom);
        let leaf_level = max_zoom as usize + 1;

        let mut levels: Vec<Level> = (0..=leaf_level).map(|_| Level::default()).collect();
        levels[leaf_level] = Level::new(project_leaves(&points));

        // Cluster points on max zoom, then cluster the results on the previous zoom, etc.
        for zoom in (min_zoom..=max_zoom).rev() {
            let next = cluster_level(
                &mut levels[zoom as usize + 1],
                zoom,
                radius,
                &options,
                points.len(),
            );
            levels[zoom as usize] = Level::new(next);
        }

        info!(
            "[ClusterIndex] Built generation {} with {} points across zooms {}..={} in {:?}",
            generation,
            points.len(),
            min_zoom,
            max_zoom,
            start.elapsed()
        );

        Self {
            options: IndexOptions {
                min_zoom,
                max_zoom,
                ..options
            },
            radius,
            generation,
            points,
            levels,
        }
    }

    /// Build generation; ids from other generations are rejected.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Cluster radius in pixels this index was built with.
    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Indexed points in insertion order.
    pub fn points(&self) -> &[Arc<MapPoint>] {
        &self.points
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Clusters and leaves inside `bbox` at `zoom`.
    ///
    /// The zoom is floored and clamped to `[min_zoom, max_zoom + 1]`, where
    /// `max_zoom + 1` is the unclustered leaf level. Longitudes are
    /// normalized; a box crossing the antimeridian is queried as two halves.
    pub fn get_clusters(&self, bbox: &BoundingBox, zoom: f64) -> Vec<ClusterNode> {
        let mut min_lng = (((bbox.west + 180.0) % 360.0 + 360.0) % 360.0) - 180.0;
        let min_lat = bbox.south.clamp(-90.0, 90.0);
        let mut max_lng = if bbox.east == 180.0 {
            180.0
        } else {
            (((bbox.east + 180.0) % 360.0 + 360.0) % 360.0) - 180.0
        };
        let max_lat = bbox.north.clamp(-90.0, 90.0);

        if bbox.east - bbox.west >= 360.0 {
            min_lng = -180.0;
            max_lng = 180.0;
        } else if min_lng > max_lng {
            let mut eastern =
                self.get_clusters(&BoundingBox::new(min_lng, min_lat, 180.0, max_lat), zoom);
            let western =
                self.get_clusters(&BoundingBox::new(-180.0, min_lat, max_lng, max_lat), zoom);
            eastern.extend(western);
            return eastern;
        }

        let level = &self.levels[self.limit_zoom(zoom)];
        let envelope = AABB::from_corners(
            [lng_x(min_lng), lat_y(max_lat)],
            [lng_x(max_lng), lat_y(min_lat)],
        );

        let mut ids: Vec<usize> = level
            .tree
            .locate_in_envelope(&envelope)
            .map(|e| e.data)
            .collect();
        ids.sort_unstable();

        ids.into_iter()
            .map(|i| self.to_cluster_node(&level.nodes[i]))
            .collect()
    }

    /// Direct children of a cluster (clusters one zoom deeper, or leaves).
    ///
    /// Empty for ids that are unknown or belong to another build.
    pub fn get_children(&self, cluster_id: &ClusterId) -> Vec<ClusterNode> {
        if !self.owns(cluster_id) {
            return Vec::new();
        }
        self.children(cluster_id.value)
            .iter()
            .map(|node| self.to_cluster_node(node))
            .collect()
    }

    /// Leaves under a cluster in dataset insertion order.
    ///
    /// Skips `offset` leaves and returns at most `limit`. Empty for ids that
    /// are unknown or belong to another build.
    pub fn get_leaves(&self, cluster_id: &ClusterId, limit: usize, offset: usize) -> Vec<Feature> {
        if !self.owns(cluster_id) {
            return Vec::new();
        }

        let mut indexes = Vec::new();
        self.collect_leaves(cluster_id.value, &mut indexes);
        indexes.sort_unstable();

        indexes
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|index| Feature {
                point: Arc::clone(&self.points[index]),
                index,
            })
            .collect()
    }

    /// Zoom level at which a cluster splits into more than one node.
    pub fn get_cluster_expansion_zoom(&self, cluster_id: &ClusterId) -> Option<u8> {
        if !self.owns(cluster_id) {
            return None;
        }
        let (origin_level, _) = self.decode(cluster_id.value)?;

        let mut raw_id = cluster_id.value;
        let mut expansion_zoom = origin_level - 1;
        while expansion_zoom <= self.options.max_zoom as usize {
            let children = self.children(raw_id);
            expansion_zoom += 1;
            if children.len() != 1 {
                break;
            }
            match children[0].kind {
                NodeKind::Cluster(id) => raw_id = id,
                NodeKind::Leaf(_) => break,
            }
        }

        Some(expansion_zoom as u8)
    }

    fn limit_zoom(&self, zoom: f64) -> usize {
        let min = self.options.min_zoom as f64;
        let max = self.options.max_zoom as f64 + 1.0;
        let zoom = if zoom.is_nan() { min } else { zoom.floor() };
        zoom.max(min).min(max) as usize
    }

    fn owns(&self, cluster_id: &ClusterId) -> bool {
        if cluster_id.generation != self.generation {
            debug!(
                "[ClusterIndex] Ignoring cluster id {} from generation {} (current {})",
                cluster_id.value, cluster_id.generation, self.generation
            );
            return false;
        }
        self.decode(cluster_id.value).is_some()
    }

    /// Split a raw cluster id into (origin level, origin node index).
    fn decode(&self, raw_id: usize) -> Option<(usize, usize)> {
        let offset = raw_id.checked_sub(self.points.len())?;
        let level = offset & ZOOM_MASK;
        let origin = offset >> ZOOM_BITS;
        if level == 0 || level >= self.levels.len() || origin >= self.levels[level].nodes.len() {
            return None;
        }
        Some((level, origin))
    }

    fn children(&self, raw_id: usize) -> Vec<Node> {
        let Some((level_index, origin)) = self.decode(raw_id) else {
            return Vec::new();
        };
        let level = &self.levels[level_index];
        let radius =
            self.radius / (self.options.extent * 2f64.powi(level_index as i32 - 1));
        let center = level.nodes[origin];

        level
            .within(center.x, center.y, radius)
            .into_iter()
            .map(|i| level.nodes[i])
            .filter(|node| node.parent == Some(raw_id))
            .collect()
    }

    fn collect_leaves(&self, raw_id: usize, out: &mut Vec<usize>) {
        for child in self.children(raw_id) {
            match child.kind {
                NodeKind::Leaf(index) => out.push(index),
                NodeKind::Cluster(id) => self.collect_leaves(id, out),
            }
        }
    }

    fn to_cluster_node(&self, node: &Node) -> ClusterNode {
        match node.kind {
            NodeKind::Leaf(index) => ClusterNode::Leaf(Feature {
                point: Arc::clone(&self.points[index]),
                index,
            }),
            NodeKind::Cluster(id) => ClusterNode::Cluster(Cluster {
                id: ClusterId {
                    generation: self.generation,
                    value: id,
                },
                location: LatLng::new(y_lat(node.y), x_lng(node.x)),
                point_count: node.num_points,
                point_count_abbreviated: abbreviate_count(node.num_points),
            }),
        }
    }
}

/// Project points into leaf nodes.
fn project_leaves(points: &[Arc<MapPoint>]) -> Vec<Node> {
    #[cfg(feature = "parallel")]
    let nodes: Vec<Node> = points
        .par_iter()
        .enumerate()
        .map(|(i, p)| Node::leaf(i, &p.location))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let nodes: Vec<Node> = points
        .iter()
        .enumerate()
        .map(|(i, p)| Node::leaf(i, &p.location))
        .collect();

    nodes
}

/// Cluster the nodes of `level` (one zoom deeper than `zoom`).
///
/// Marks the nodes of `level` as visited and records their parent ids;
/// returns the nodes of the coarser level.
fn cluster_level(
    level: &mut Level,
    zoom: u8,
    radius: f64,
    options: &IndexOptions,
    point_total: usize,
) -> Vec<Node> {
    let r = radius / (options.extent * 2f64.powi(zoom as i32));
    let mut next = Vec::new();

    for i in 0..level.nodes.len() {
        if level.nodes[i].visited {
            continue;
        }
        level.nodes[i].visited = true;

        let origin = level.nodes[i];
        let neighbors = level.within(origin.x, origin.y, r);

        let num_points = origin.num_points
            + neighbors
                .iter()
                .map(|&n| &level.nodes[n])
                .filter(|node| !node.visited)
                .map(|node| node.num_points)
                .sum::<usize>();

        if num_points > origin.num_points && num_points >= options.min_points {
            // Encode both the origin node index and its level in the id
            let id = (i << ZOOM_BITS) + (zoom as usize + 1) + point_total;
            let mut wx = origin.x * origin.num_points as f64;
            let mut wy = origin.y * origin.num_points as f64;

            for n in neighbors {
                let node = &mut level.nodes[n];
                if node.visited {
                    continue;
                }
                node.visited = true;
                wx += node.x * node.num_points as f64;
                wy += node.y * node.num_points as f64;
                node.parent = Some(id);
            }
            level.nodes[i].parent = Some(id);

            next.push(Node {
                x: wx / num_points as f64,
                y: wy / num_points as f64,
                kind: NodeKind::Cluster(id),
                parent: None,
                num_points,
                visited: false,
            });
        } else {
            next.push(origin.carried());

            // Too few to cluster: neighbours carry over individually
            for n in neighbors {
                let node = &mut level.nodes[n];
                if node.visited {
                    continue;
                }
                node.visited = true;
                next.push(node.carried());
            }
        }
    }

    next
}

/// Short human-readable count: "999", "1.2k", "15k".
pub fn abbreviate_count(count: usize) -> String {
    if count >= 10_000 {
        format!("{}k", (count as f64 / 1000.0).round())
    } else if count >= 1000 {
        format!("{}k", (count as f64 / 100.0).round() / 10.0)
    } else {
        count.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
