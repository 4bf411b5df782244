use super::StreetSegment;
use crate::proximity::EARTH_RADIUS_M;
use geo::{BoundingRect, Coord, LineString};
use rstar::{RTree, RTreeObject, AABB};

/// Padding added to every segment envelope, in degrees (~1m), for rounding
const ENVELOPE_PAD_DEG: f64 = 1e-5;

/// Extra margin applied to the query radius before converting to degrees
const QUERY_MARGIN: f64 = 1.05;

/// Arcs reaching past this latitude get a full-width envelope
const POLAR_LAT_DEG: f64 = 89.0;

/// Position of a segment in the tracker's segment list, with its envelope
#[derive(Clone, Debug)]
pub struct IndexedSegment {
    pub position: usize,
    pub envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// R-Tree over segment bounding boxes, used to prefilter visit candidates
///
/// # Guarantees
/// Every segment whose polyline lies within `radius_m` of the query point is
/// returned by [`SegmentIndex::candidates_near`]. Extra candidates are allowed;
/// callers still run the exact distance test on each.
///
/// Envelopes include the poleward bulge of each great-circle arc, and query
/// boxes crossing ±180° are split in two.
///
/// # Usage
/// ```
/// use street_coverage_rs::network::{RoadClass, SegmentIndex, StreetSegment};
///
/// let segments = vec![StreetSegment::from_lat_lng(
///     "way/1",
///     &[(40.0, -73.0), (40.001, -73.0)],
///     RoadClass::Residential,
/// )];
/// let index = SegmentIndex::from_segments(&segments);
///
/// assert_eq!(index.candidates_near(40.0005, -73.0, 20.0), vec![0]);
/// ```
pub struct SegmentIndex {
    tree: RTree<IndexedSegment>,
    segment_count: usize,
}

impl SegmentIndex {
    /// Index segments by their position in `segments`
    pub fn from_segments(segments: &[StreetSegment]) -> Self {
        let entries: Vec<IndexedSegment> = segments
            .iter()
            .enumerate()
            .filter_map(|(position, segment)| {
                compute_envelope(&segment.geometry)
                    .map(|envelope| IndexedSegment { position, envelope })
            })
            .collect();

        let segment_count = entries.len();

        SegmentIndex {
            tree: RTree::bulk_load(entries),
            segment_count,
        }
    }

    /// Positions of segments whose envelope comes within `radius_m` of the point,
    /// in ascending order
    pub fn candidates_near(&self, lat: f64, lng: f64, radius_m: f64) -> Vec<usize> {
        let mut positions: Vec<usize> = query_envelopes(lat, lng, radius_m)
            .iter()
            .flat_map(|envelope| self.tree.locate_in_envelope_intersecting(envelope))
            .map(|entry| entry.position)
            .collect();

        positions.sort_unstable();
        positions.dedup();
        positions
    }

    /// Total segments in the index
    pub fn segment_count(&self) -> usize {
        self.segment_count
    }
}

/// Degree boxes that together contain every point within `radius_m` of (lat, lng)
///
/// One box normally, two when the longitude span crosses ±180°.
fn query_envelopes(lat: f64, lng: f64, radius_m: f64) -> Vec<AABB<[f64; 2]>> {
    let d_lat = (radius_m * QUERY_MARGIN / EARTH_RADIUS_M).to_degrees();
    let south = lat - d_lat;
    let north = lat + d_lat;

    // Longitude degrees shrink towards the poles; size for the worst latitude in the box
    let max_abs_lat = lat.abs() + d_lat;
    let d_lng = if max_abs_lat >= POLAR_LAT_DEG {
        180.0
    } else {
        d_lat / max_abs_lat.to_radians().cos()
    };

    let west = lng - d_lng;
    let east = lng + d_lng;
    let full_width = || vec![AABB::from_corners([-180.0, south], [180.0, north])];

    if d_lng >= 180.0 {
        full_width()
    } else if west < -180.0 {
        vec![
            AABB::from_corners([-180.0, south], [east, north]),
            AABB::from_corners([west + 360.0, south], [180.0, north]),
        ]
    } else if east > 180.0 {
        vec![
            AABB::from_corners([west, south], [180.0, north]),
            AABB::from_corners([-180.0, south], [east - 360.0, north]),
        ]
    } else {
        vec![AABB::from_corners([west, south], [east, north])]
    }
}

type Vec3 = [f64; 3];

fn to_unit_vector(c: Coord<f64>) -> Vec3 {
    let (lat, lng) = (c.y.to_radians(), c.x.to_radians());
    [lat.cos() * lng.cos(), lat.cos() * lng.sin(), lat.sin()]
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn normalize(v: Vec3) -> Option<Vec3> {
    let len = dot(v, v).sqrt();
    if len < 1e-15 {
        None
    } else {
        Some([v[0] / len, v[1] / len, v[2] / len])
    }
}

/// Lowest and highest latitude (degrees) reached by the minor great-circle arc a → b
///
/// The arc's latitude extremes are its endpoints unless the great circle's
/// northern or southern vertex falls inside the arc.
fn arc_latitude_range(a: Coord<f64>, b: Coord<f64>) -> (f64, f64) {
    let mut min_lat = a.y.min(b.y);
    let mut max_lat = a.y.max(b.y);

    let (va, vb) = (to_unit_vector(a), to_unit_vector(b));
    // Coincident or antipodal endpoints, or an arc along the equator
    let Some(n) = normalize(cross(va, vb)) else {
        return (min_lat, max_lat);
    };
    let Some(vertex) = normalize([-n[2] * n[0], -n[2] * n[1], 1.0 - n[2] * n[2]]) else {
        return (min_lat, max_lat);
    };

    for candidate in [vertex, [-vertex[0], -vertex[1], -vertex[2]]] {
        let on_arc = dot(cross(va, candidate), n) >= 0.0 && dot(cross(candidate, vb), n) >= 0.0;
        if on_arc {
            let lat = candidate[2].clamp(-1.0, 1.0).asin().to_degrees();
            min_lat = min_lat.min(lat);
            max_lat = max_lat.max(lat);
        }
    }

    (min_lat, max_lat)
}

/// Padded bounding box of a polyline's great-circle arcs, `None` when empty
fn compute_envelope(line: &LineString<f64>) -> Option<AABB<[f64; 2]>> {
    let rect = line.bounding_rect()?;
    let (mut min_lng, mut max_lng) = (rect.min().x, rect.max().x);
    let (mut min_lat, mut max_lat) = (rect.min().y, rect.max().y);

    let mut wraps = false;
    for arc in line.0.windows(2) {
        let (low, high) = arc_latitude_range(arc[0], arc[1]);
        min_lat = min_lat.min(low);
        max_lat = max_lat.max(high);
        // Shorter way round crosses ±180°
        wraps |= (arc[1].x - arc[0].x).abs() > 180.0;
    }

    // Minor arcs are monotonic in longitude except near a pole
    if wraps || max_lat.abs().max(min_lat.abs()) >= POLAR_LAT_DEG {
        min_lng = -180.0;
        max_lng = 180.0;
    }

    Some(AABB::from_corners(
        [min_lng - ENVELOPE_PAD_DEG, min_lat - ENVELOPE_PAD_DEG],
        [max_lng + ENVELOPE_PAD_DEG, max_lat + ENVELOPE_PAD_DEG],
    ))
}
