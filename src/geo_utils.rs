//! # Geographic Utilities
//!
//! Pure geographic computations behind clustering and spiderfying.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two coordinates |
//! | [`region_to_bounding_box`] | Map region to WSEN bounding box |
//! | [`bounding_box_to_region`] | WSEN bounding box to map region |
//! | [`average_geolocation`] | Spherical centroid of a set of coordinates |
//! | [`zoom_level_from_region`] | Integer zoom level from a region's longitude span |
//! | [`pixels_to_km`] | Screen pixels to kilometers at a region's scale |
//! | [`fit_zoom`] | Zoom level that fits a bounding box on a screen |
//!
//! ## Example
//!
//! ```rust
//! use marker_cluster::{geo_utils, DistanceUnit, LatLng, Region};
//!
//! let london = LatLng::new(51.5074, -0.1278);
//! let paris = LatLng::new(48.8566, 2.3522);
//!
//! let km = geo_utils::haversine_distance(&london, &paris, DistanceUnit::Kilometers);
//! assert!((km - 343.5).abs() < 2.0);
//!
//! let region = Region::new(51.5, -0.12, 0.05, 0.05);
//! let bbox = geo_utils::region_to_bounding_box(&region);
//! assert!(bbox.west < region.longitude && region.longitude < bbox.east);
//! ```
//!
//! ## Coordinate System
//!
//! All functions expect WGS84 coordinates in degrees. The spherical-mercator
//! helpers map coordinates into the unit square used by the cluster index.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{BoundingBox, LatLng, Region, ScreenSize};

/// Mean Earth radius used by the haversine formula, in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometers per statute mile.
pub const KM_PER_MILE: f64 = 1.60934;

/// Tile size in pixels assumed by viewport fitting.
pub const TILE_SIZE: f64 = 256.0;

/// Upper zoom bound for viewport fitting.
pub const VIEWPORT_MAX_ZOOM: f64 = 20.0;

/// Unit for [`haversine_distance`] results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceUnit {
    #[default]
    Kilometers,
    Miles,
}

#[inline]
fn to_rad(degrees: f64) -> f64 {
    (degrees * PI) / 180.0
}

#[inline]
fn to_deg(radians: f64) -> f64 {
    (radians * 180.0) / PI
}

// =============================================================================
// Distance Functions
// =============================================================================

/// Calculate the great-circle distance between two coordinates.
///
/// Uses the standard haversine formula on a sphere of radius 6371 km
/// (`sin`, `cos`, `atan2`, `sqrt`), so overlap thresholds computed from it
/// are reproducible across platforms.
///
/// # Example
///
/// ```rust
/// use marker_cluster::{geo_utils, DistanceUnit, LatLng};
///
/// let a = LatLng::new(40.7128, -74.0060);
/// let b = LatLng::new(34.0522, -118.2437);
/// let km = geo_utils::haversine_distance(&a, &b, DistanceUnit::Kilometers);
/// let miles = geo_utils::haversine_distance(&a, &b, DistanceUnit::Miles);
/// assert!((km / miles - 1.60934).abs() < 1e-9);
/// ```
pub fn haversine_distance(a: &LatLng, b: &LatLng, unit: DistanceUnit) -> f64 {
    let d_lat = to_rad(b.latitude - a.latitude);
    let d_lat_sin = (d_lat / 2.0).sin();
    let d_lon = to_rad(b.longitude - a.longitude);
    let d_lon_sin = (d_lon / 2.0).sin();

    let h = (d_lat_sin * d_lat_sin)
        + (to_rad(a.latitude).cos() * to_rad(b.latitude).cos() * d_lon_sin * d_lon_sin);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    let distance = EARTH_RADIUS_KM * c;

    match unit {
        DistanceUnit::Kilometers => distance,
        DistanceUnit::Miles => distance / KM_PER_MILE,
    }
}

/// Haversine distance in kilometers.
#[inline]
pub fn haversine_km(a: &LatLng, b: &LatLng) -> f64 {
    haversine_distance(a, b, DistanceUnit::Kilometers)
}

// =============================================================================
// Region / Bounding Box Conversion
// =============================================================================

/// Compute the WSEN bounding box of a region.
///
/// A negative longitude span is treated as an antimeridian crossing and
/// wrapped by 360 degrees. Spans of 360 degrees or more are passed through
/// untouched.
pub fn region_to_bounding_box(region: &Region) -> BoundingBox {
    let lng_delta = if region.longitude_delta < 0.0 {
        region.longitude_delta + 360.0
    } else {
        region.longitude_delta
    };

    BoundingBox::new(
        region.longitude - lng_delta,
        region.latitude - region.latitude_delta,
        region.longitude + lng_delta,
        region.latitude + region.latitude_delta,
    )
}

/// Calculate the region centered on a bounding box.
///
/// The center is the spherical midpoint of the south-west and north-east
/// corners; deltas are the corner differences.
pub fn bounding_box_to_region(bbox: &BoundingBox) -> Region {
    let min_lon = to_rad(bbox.west);
    let max_lon = to_rad(bbox.east);
    let min_lat = to_rad(bbox.south);
    let max_lat = to_rad(bbox.north);

    let d_lon = max_lon - min_lon;
    let d_lat = max_lat - min_lat;

    let x = max_lat.cos() * d_lon.cos();
    let y = max_lat.cos() * d_lon.sin();

    let lat_rad = (min_lat.sin() + max_lat.sin())
        .atan2(((min_lat.cos() + x) * (min_lat.cos() + x) + y * y).sqrt());
    let lon_rad = min_lon + y.atan2(min_lat.cos() + x);

    Region {
        latitude: to_deg(lat_rad),
        longitude: to_deg(lon_rad),
        latitude_delta: to_deg(d_lat),
        longitude_delta: to_deg(d_lon),
    }
}

// =============================================================================
// Center/Centroid Functions
// =============================================================================

/// Calculate the center of multiple coordinates on the sphere.
///
/// Each coordinate becomes a unit vector; the vectors are averaged and the
/// mean converted back to latitude/longitude. Unlike arithmetic averaging
/// this is correct across the antimeridian.
///
/// A single coordinate is returned unchanged. Returns `None` for empty input.
pub fn average_geolocation(coords: &[LatLng]) -> Option<LatLng> {
    match coords {
        [] => return None,
        [single] => return Some(*single),
        _ => {}
    }

    let mut x = 0.0;
    let mut y = 0.0;
    let mut z = 0.0;

    for coord in coords {
        let latitude = to_rad(coord.latitude);
        let longitude = to_rad(coord.longitude);

        x += latitude.cos() * longitude.cos();
        y += latitude.cos() * longitude.sin();
        z += latitude.sin();
    }

    let total = coords.len() as f64;
    x /= total;
    y /= total;
    z /= total;

    let central_longitude = y.atan2(x);
    let central_square_root = (x * x + y * y).sqrt();
    let central_latitude = z.atan2(central_square_root);

    Some(LatLng::new(to_deg(central_latitude), to_deg(central_longitude)))
}

// =============================================================================
// Zoom and Scale
// =============================================================================

/// Integer zoom level for a region: `round(log2(360 / longitude_delta))`.
///
/// Returns `None` when the region is absent or its longitude span is not a
/// positive finite number; callers treat that as "no zoom information".
pub fn zoom_level_from_region(region: Option<&Region>) -> Option<i32> {
    let region = region?;
    let delta = region.longitude_delta;
    if !delta.is_finite() || delta <= 0.0 {
        return None;
    }

    let level = (360.0 / delta).log2();
    // Half-up rounding, matching map SDK conventions for x.5 levels
    let rounded = (level + 0.5).floor();
    if rounded.is_finite() {
        Some(rounded as i32)
    } else {
        None
    }
}

/// Convert a pixel distance to kilometers at the region's scale.
///
/// The scale is the haversine length of the region's bounding-box diagonal
/// divided by the screen diagonal. Returns `None` for a zero-sized screen.
pub fn pixels_to_km(pixels: f64, region: &Region, screen: &ScreenSize) -> Option<f64> {
    let diagonal_px = screen.diagonal();
    if !(diagonal_px > 0.0) {
        return None;
    }

    let bbox = region_to_bounding_box(region);
    let diagonal_km = haversine_km(&bbox.south_west(), &bbox.north_east());
    Some(pixels * (diagonal_km / diagonal_px))
}

/// Convert kilometers to screen pixels at the region's scale.
pub fn km_to_pixels(km: f64, region: &Region, screen: &ScreenSize) -> Option<f64> {
    let km_per_pixel = pixels_to_km(1.0, region, screen)?;
    if km_per_pixel > 0.0 {
        Some(km / km_per_pixel)
    } else {
        None
    }
}

/// Spherical-mercator pixel position at an integer zoom level.
fn mercator_px(longitude: f64, latitude: f64, zoom: f64) -> (f64, f64) {
    let size = TILE_SIZE * 2f64.powf(zoom);
    let half = size / 2.0;
    let px_per_degree = size / 360.0;
    let px_per_radian = size / (2.0 * PI);

    let f = to_rad(latitude).sin().clamp(-0.9999, 0.9999);
    let x = (half + longitude * px_per_degree).round();
    let y = (half + 0.5 * ((1.0 + f) / (1.0 - f)).ln() * -px_per_radian).round();

    (x.min(size), y.min(size))
}

/// Largest integer zoom at which `bbox` fits on a screen of the given size.
///
/// Both corners are projected at the maximum zoom; the zoom is reduced by
/// the log2 of whichever of the width or height overflows the screen most.
/// The result is clamped to `[0, VIEWPORT_MAX_ZOOM]`.
pub fn fit_zoom(bbox: &BoundingBox, screen: &ScreenSize) -> f64 {
    let base = VIEWPORT_MAX_ZOOM;
    let (left, bottom) = mercator_px(bbox.west, bbox.south, base);
    let (right, top) = mercator_px(bbox.east, bbox.north, base);

    let width = right - left;
    let height = bottom - top;

    let by_width = base - (width / screen.width).log2();
    let by_height = base - (height / screen.height).log2();
    let adjusted = by_width.min(by_height).floor();

    // max/min rather than clamp: NaN from a degenerate box falls to 0
    adjusted.max(0.0).min(VIEWPORT_MAX_ZOOM)
}

// =============================================================================
// Spherical Mercator (unit square)
// =============================================================================

/// Longitude to mercator x in `[0, 1]`.
#[inline]
pub fn lng_x(lng: f64) -> f64 {
    lng / 360.0 + 0.5
}

/// Latitude to mercator y in `[0, 1]` (north is 0), clamped at the poles.
#[inline]
pub fn lat_y(lat: f64) -> f64 {
    let sin = to_rad(lat).sin();
    let y = 0.5 - (0.25 * ((1.0 + sin) / (1.0 - sin)).ln()) / PI;
    y.clamp(0.0, 1.0)
}

/// Mercator x back to longitude.
#[inline]
pub fn x_lng(x: f64) -> f64 {
    (x - 0.5) * 360.0
}

/// Mercator y back to latitude.
#[inline]
pub fn y_lat(y: f64) -> f64 {
    let y2 = ((180.0 - y * 360.0) * PI) / 180.0;
    (360.0 * y2.exp().atan()) / PI - 90.0
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    #[test]
    fn test_haversine_same_point() {
        let p = LatLng::new(51.5074, -0.1278);
        assert_eq!(haversine_km(&p, &p), 0.0);
    }

    #[test]
    fn test_haversine_symmetric() {
        let pairs = [
            (LatLng::new(51.5074, -0.1278), LatLng::new(48.8566, 2.3522)),
            (LatLng::new(-33.8688, 151.2093), LatLng::new(35.6762, 139.6503)),
            (LatLng::new(0.0, 179.9), LatLng::new(0.0, -179.9)),
        ];
        for (a, b) in pairs {
            assert_eq!(haversine_km(&a, &b), haversine_km(&b, &a));
        }
    }

    #[test]
    fn test_haversine_matches_geo_crate() {
        use geo::{Distance, Haversine, Point};

        let london = LatLng::new(51.5074, -0.1278);
        let paris = LatLng::new(48.8566, 2.3522);
        let ours = haversine_km(&london, &paris);
        let theirs = Haversine::distance(
            Point::new(london.longitude, london.latitude),
            Point::new(paris.longitude, paris.latitude),
        ) / 1000.0;
        // geo uses a 6371.0088 km radius
        assert!(approx_eq(ours, theirs, 0.01), "{} vs {}", ours, theirs);
    }

    #[test]
    fn test_haversine_miles() {
        let a = LatLng::new(0.0, 0.0);
        let b = LatLng::new(0.0, 1.0);
        let km = haversine_distance(&a, &b, DistanceUnit::Kilometers);
        let miles = haversine_distance(&a, &b, DistanceUnit::Miles);
        assert!(approx_eq(km, 111.195, 0.01));
        assert!(approx_eq(miles, km / KM_PER_MILE, 1e-12));
    }

    #[test]
    fn test_region_to_bounding_box() {
        let region = Region::new(10.0, 20.0, 1.0, 2.0);
        let bbox = region_to_bounding_box(&region);
        assert_eq!(bbox.to_array(), [18.0, 9.0, 22.0, 11.0]);
    }

    #[test]
    fn test_region_to_bounding_box_negative_delta_wraps() {
        let region = Region::new(0.0, 179.0, 1.0, -358.0);
        let bbox = region_to_bounding_box(&region);
        assert!(approx_eq(bbox.west, 177.0, 1e-9));
        assert!(approx_eq(bbox.east, 181.0, 1e-9));
    }

    #[test]
    fn test_bounding_box_round_trip_center() {
        // Corners of an equator-centred box are point-symmetric about the
        // center, so the spherical midpoint recovers it exactly.
        for i in 0..90 {
            let lng_delta = i as f64 * 0.999;
            let region = Region::new(0.0, -73.0 + i as f64, 4.0, lng_delta);
            let back = bounding_box_to_region(&region_to_bounding_box(&region));
            assert!(
                approx_eq(back.latitude, region.latitude, 1e-6),
                "lat {} vs {}",
                back.latitude,
                region.latitude
            );
            assert!(
                approx_eq(back.longitude, region.longitude, 1e-6),
                "lng {} vs {} (delta {})",
                back.longitude,
                region.longitude,
                lng_delta
            );
        }
    }

    #[test]
    fn test_bounding_box_round_trip_city_region() {
        // Away from the equator the great-circle midpoint drifts poleward by
        // a second-order amount; negligible at street scale.
        let region = Region::new(51.5, -0.12, 0.005, 0.005);
        let back = bounding_box_to_region(&region_to_bounding_box(&region));
        assert!(approx_eq(back.latitude, region.latitude, 1e-6));
        assert!(approx_eq(back.longitude, region.longitude, 1e-6));
        assert!(approx_eq(back.latitude_delta, 0.01, 1e-9));
        assert!(approx_eq(back.longitude_delta, 0.01, 1e-9));
    }

    #[test]
    fn test_average_geolocation_singleton_identity() {
        let p = LatLng::new(-12.3456, 98.7654);
        assert_eq!(average_geolocation(&[p]), Some(p));
        assert_eq!(average_geolocation(&[]), None);
    }

    #[test]
    fn test_average_geolocation_antimeridian() {
        let center = average_geolocation(&[LatLng::new(0.0, 179.0), LatLng::new(0.0, -179.0)])
            .unwrap();
        assert!(approx_eq(center.longitude.abs(), 180.0, 1e-9));
        assert!(approx_eq(center.latitude, 0.0, 1e-9));
    }

    #[test]
    fn test_average_geolocation_small_area() {
        let center = average_geolocation(&[LatLng::new(51.50, -0.10), LatLng::new(51.52, -0.12)])
            .unwrap();
        assert!(approx_eq(center.latitude, 51.51, 0.001));
        assert!(approx_eq(center.longitude, -0.11, 0.001));
    }

    #[test]
    fn test_zoom_level_from_region() {
        assert_eq!(zoom_level_from_region(Some(&Region::new(0.0, 0.0, 1.0, 360.0))), Some(0));
        assert_eq!(zoom_level_from_region(Some(&Region::new(0.0, 0.0, 1.0, 45.0))), Some(3));
        assert_eq!(zoom_level_from_region(Some(&Region::new(0.0, 0.0, 1.0, 0.01))), Some(15));
        assert_eq!(zoom_level_from_region(None), None);
        assert_eq!(zoom_level_from_region(Some(&Region::new(0.0, 0.0, 1.0, 0.0))), None);
        assert_eq!(
            zoom_level_from_region(Some(&Region::new(0.0, 0.0, 1.0, f64::NAN))),
            None
        );
    }

    #[test]
    fn test_pixels_to_km_round_trip() {
        let region = Region::new(51.5, -0.12, 0.05, 0.05);
        let screen = ScreenSize::new(400.0, 800.0);
        let km = pixels_to_km(15.0, &region, &screen).unwrap();
        assert!(km > 0.0);
        let px = km_to_pixels(km, &region, &screen).unwrap();
        assert!(approx_eq(px, 15.0, 1e-9));
        assert_eq!(pixels_to_km(15.0, &region, &ScreenSize::default()), None);
    }

    #[test]
    fn test_fit_zoom() {
        let screen = ScreenSize::new(400.0, 800.0);
        // Whole world does not fit above zoom 0 on a phone screen
        let world = BoundingBox::new(-180.0, -85.0, 180.0, 85.0);
        assert_eq!(fit_zoom(&world, &screen), 0.0);

        // A city-sized box lands on a city zoom
        let city = BoundingBox::new(-0.2, 51.45, -0.05, 51.55);
        let zoom = fit_zoom(&city, &screen);
        assert!((10.0..=13.0).contains(&zoom), "zoom {}", zoom);

        // A degenerate box is capped at the maximum zoom
        let point = BoundingBox::new(2.0, 48.0, 2.0, 48.0);
        assert_eq!(fit_zoom(&point, &screen), VIEWPORT_MAX_ZOOM);
    }

    #[test]
    fn test_mercator_round_trip() {
        for (lng, lat) in [(0.0, 0.0), (-122.4, 37.8), (151.2, -33.9)] {
            assert!(approx_eq(x_lng(lng_x(lng)), lng, 1e-9));
            assert!(approx_eq(y_lat(lat_y(lat)), lat, 1e-9));
        }
        assert_eq!(lat_y(90.0), 0.0);
        assert_eq!(lat_y(-90.0), 1.0);
    }
}
