//! Great-circle distance between positions and street polylines.
//!
//! All distances are in meters on a sphere with the mean Earth radius. The
//! same haversine formula backs both the point-to-line distance used for visit
//! detection and the trip distance integrated by [`crate::trip`].

use crate::error::{CoverageError, Result};
use crate::network::StreetSegment;
use crate::position::Position;
use geo::Coord;

/// Mean Earth radius in meters (IUGG)
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Default visit threshold, roughly the GPS accuracy envelope
pub const DEFAULT_VISIT_THRESHOLD_M: f64 = 20.0;

/// Haversine distance between two coordinates (x = lng, y = lat) in meters
pub fn haversine_distance(a: Coord<f64>, b: Coord<f64>) -> f64 {
    angular_distance(a, b) * EARTH_RADIUS_M
}

/// Central angle between two coordinates in radians
fn angular_distance(a: Coord<f64>, b: Coord<f64>) -> f64 {
    let lat1 = a.y.to_radians();
    let lat2 = b.y.to_radians();
    let d_lat = lat2 - lat1;
    let d_lon = (b.x - a.x).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * h.sqrt().atan2((1.0 - h).max(0.0).sqrt())
}

/// Initial bearing from `a` to `b` in radians
fn initial_bearing(a: Coord<f64>, b: Coord<f64>) -> f64 {
    let lat1 = a.y.to_radians();
    let lat2 = b.y.to_radians();
    let d_lon = (b.x - a.x).to_radians();

    let y = d_lon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lon.cos();
    y.atan2(x)
}

/// Distance from `p` to the great-circle arc `start -> end` in meters
///
/// # Algorithm
/// 1. Angular distance and bearing from `start` to `p` and `end`
/// 2. If `p` projects behind `start`, distance to `start`
/// 3. If the along-track distance exceeds the arc, distance to `end`
/// 4. Otherwise the absolute cross-track distance
pub fn point_to_arc_distance(p: Coord<f64>, start: Coord<f64>, end: Coord<f64>) -> f64 {
    let d13 = angular_distance(start, p);
    let d12 = angular_distance(start, end);

    if d13 == 0.0 {
        return 0.0;
    }
    if d12 == 0.0 {
        return d13 * EARTH_RADIUS_M;
    }

    let delta = initial_bearing(start, p) - initial_bearing(start, end);

    if delta.cos() < 0.0 {
        return d13 * EARTH_RADIUS_M;
    }

    let d_xt = (d13.sin() * delta.sin()).clamp(-1.0, 1.0).asin();
    let d_at = (d13.cos() / d_xt.cos()).clamp(-1.0, 1.0).acos();

    if d_at > d12 {
        return haversine_distance(p, end);
    }

    d_xt.abs() * EARTH_RADIUS_M
}

/// Minimum distance from a point to a polyline given as coordinates
///
/// Returns `None` for fewer than 2 coordinates.
pub fn distance_to_polyline(p: Coord<f64>, coords: &[Coord<f64>]) -> Option<f64> {
    if coords.len() < 2 {
        return None;
    }

    let min = coords
        .windows(2)
        .map(|pair| point_to_arc_distance(p, pair[0], pair[1]))
        .fold(f64::INFINITY, f64::min);

    Some(min)
}

/// Shortest distance from a position to a street segment in meters
///
/// # Errors
/// `InvalidGeometry` if the segment has fewer than 2 coordinates.
pub fn distance_to_segment(point: &Position, segment: &StreetSegment) -> Result<f64> {
    distance_to_polyline(point.coord(), &segment.geometry.0).ok_or_else(|| {
        CoverageError::InvalidGeometry {
            segment_id: segment.id.clone(),
            point_count: segment.point_count(),
        }
    })
}

/// `distance_to_segment(point, segment) <= threshold_m`
pub fn is_within_threshold(
    point: &Position,
    segment: &StreetSegment,
    threshold_m: f64,
) -> Result<bool> {
    Ok(distance_to_segment(point, segment)? <= threshold_m)
}
