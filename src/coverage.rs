use crate::config::TrackerConfig;
use crate::error::{lock_poisoned, CoverageError, Result};
use crate::network::{SegmentIndex, StreetSegment};
use crate::position::Position;
use crate::proximity::distance_to_segment;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Mutex;

/// Streets of the loaded area plus the current navigation target
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoverageState {
    segments: Vec<StreetSegment>,
    target: Option<usize>,
}

/// Visited / total street counts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CoverageProgress {
    pub visited: usize,
    pub total: usize,
    /// Rounded to the nearest whole percent, 0 when no streets are loaded
    pub percent: u32,
}

impl CoverageState {
    pub fn segments(&self) -> &[StreetSegment] {
        &self.segments
    }

    pub fn segment(&self, id: &str) -> Option<&StreetSegment> {
        self.segments.iter().find(|s| s.id == id)
    }

    /// Nearest unvisited segment as of the last position update
    pub fn target(&self) -> Option<&StreetSegment> {
        self.target.map(|i| &self.segments[i])
    }

    /// First coordinate of the target as (lat, lng), the destination handed to directions
    pub fn target_anchor(&self) -> Option<(f64, f64)> {
        self.target()
            .and_then(|seg| seg.geometry.0.first())
            .map(|c| (c.y, c.x))
    }

    pub fn visited_count(&self) -> usize {
        self.segments.iter().filter(|s| s.visited).count()
    }

    pub fn total_count(&self) -> usize {
        self.segments.len()
    }

    pub fn progress(&self) -> CoverageProgress {
        let visited = self.visited_count();
        let total = self.total_count();
        let percent = if total > 0 {
            (visited as f64 / total as f64 * 100.0).round() as u32
        } else {
            0
        };
        CoverageProgress { visited, total, percent }
    }

    /// Every loaded street has been visited
    pub fn is_complete(&self) -> bool {
        !self.segments.is_empty() && self.segments.iter().all(|s| s.visited)
    }
}

struct TrackerInner {
    state: CoverageState,
    index: Option<SegmentIndex>,
}

/// Stateful coverage core: marks streets visited and picks the next target
///
/// # Architecture
/// - Owns the segment list of one loaded area behind a single mutex
/// - Each position update scans unvisited segments (R-tree prefiltered for
///   large areas), marks every one within the visit threshold, then selects
///   the nearest remaining unvisited segment as target
/// - Readers get cloned snapshots via [`CoverageTracker::state`]
///
/// # Usage
/// ```
/// use street_coverage_rs::config::TrackerConfig;
/// use street_coverage_rs::coverage::CoverageTracker;
/// use street_coverage_rs::network::{RoadClass, StreetSegment};
/// use street_coverage_rs::position::Position;
///
/// let tracker = CoverageTracker::new(TrackerConfig::default());
/// tracker.load_area(vec![StreetSegment::from_lat_lng(
///     "way/1",
///     &[(40.758, -73.986), (40.759, -73.985)],
///     RoadClass::Residential,
/// )])?;
///
/// tracker.update_position(&Position::new(40.7585, -73.9855))?;
/// assert_eq!(tracker.progress()?.visited, 1);
/// # Ok::<(), street_coverage_rs::CoverageError>(())
/// ```
pub struct CoverageTracker {
    inner: Mutex<TrackerInner>,
    config: TrackerConfig,
}

impl CoverageTracker {
    pub fn new(config: TrackerConfig) -> Self {
        CoverageTracker {
            inner: Mutex::new(TrackerInner {
                state: CoverageState::default(),
                index: None,
            }),
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Replace the whole segment set and clear the target
    ///
    /// The spatial index is built before the lock is taken, so concurrent
    /// readers only ever see the old set or the new one.
    ///
    /// # Errors
    /// `InvalidGeometry` if any segment has fewer than 2 coordinates; the
    /// current area is kept in that case.
    pub fn load_area(&self, segments: Vec<StreetSegment>) -> Result<()> {
        validate_geometry(&segments)?;
        let index = self.build_index(&segments);
        let count = segments.len();

        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("coverage"))?;
        inner.state = CoverageState { segments, target: None };
        inner.index = index;
        drop(inner);

        log::info!("Loaded area with {} street segments", count);
        Ok(())
    }

    /// Replace the segment set, keeping `visited` for ids present in both areas
    pub fn merge_area(&self, mut segments: Vec<StreetSegment>) -> Result<()> {
        validate_geometry(&segments)?;

        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("coverage"))?;
        let visited_ids: HashSet<&str> = inner
            .state
            .segments
            .iter()
            .filter(|s| s.visited)
            .map(|s| s.id.as_str())
            .collect();

        let mut retained = 0usize;
        for segment in segments.iter_mut() {
            if visited_ids.contains(segment.id.as_str()) {
                segment.visited = true;
                retained += 1;
            }
        }

        let index = self.build_index(&segments);
        let count = segments.len();
        inner.state = CoverageState { segments, target: None };
        inner.index = index;
        drop(inner);

        log::info!(
            "Merged area with {} street segments ({} already visited)",
            count,
            retained
        );
        Ok(())
    }

    /// Process one position sample
    ///
    /// Marks every unvisited segment within the visit threshold, then selects
    /// the nearest unvisited segment (first in load order on ties) as target.
    ///
    /// # Errors
    /// `InvalidPosition` for non-finite or out-of-range coordinates; state is
    /// left untouched.
    pub fn update_position(&self, point: &Position) -> Result<()> {
        self.apply_position(point).map(|_| ())
    }

    /// [`Self::update_position`], returning how many segments became visited
    pub(crate) fn apply_position(&self, point: &Position) -> Result<usize> {
        point.validate()?;
        let threshold = self.config.threshold_for(point.accuracy);

        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("coverage"))?;
        let TrackerInner { state, index } = &mut *inner;

        let candidates: Vec<usize> = match index {
            Some(index) => index.candidates_near(point.lat, point.lng, threshold),
            None => (0..state.segments.len()).collect(),
        };

        // Decide everything before mutating so an error leaves state unchanged
        let mut newly_visited = Vec::new();
        for position in candidates {
            let segment = &state.segments[position];
            if segment.visited {
                continue;
            }
            if distance_to_segment(point, segment)? <= threshold {
                newly_visited.push(position);
            }
        }

        let target = nearest_unvisited_excluding(point, &state.segments, &newly_visited)?;

        for &position in &newly_visited {
            state.segments[position].visited = true;
            log::debug!("Visited {}", state.segments[position].id);
        }
        state.target = target;

        if !newly_visited.is_empty() && target.is_none() {
            log::info!("All {} streets in area covered", state.segments.len());
        }

        Ok(newly_visited.len())
    }

    /// Snapshot of segments and target
    pub fn state(&self) -> Result<CoverageState> {
        let inner = self.inner.lock().map_err(|_| lock_poisoned("coverage"))?;
        Ok(inner.state.clone())
    }

    pub fn progress(&self) -> Result<CoverageProgress> {
        let inner = self.inner.lock().map_err(|_| lock_poisoned("coverage"))?;
        Ok(inner.state.progress())
    }

    pub fn target_id(&self) -> Result<Option<String>> {
        let inner = self.inner.lock().map_err(|_| lock_poisoned("coverage"))?;
        Ok(inner.state.target().map(|s| s.id.clone()))
    }

    /// Drop the navigation target, e.g. when a drive ends
    pub fn clear_target(&self) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("coverage"))?;
        inner.state.target = None;
        Ok(())
    }

    fn build_index(&self, segments: &[StreetSegment]) -> Option<SegmentIndex> {
        if segments.len() >= self.config.spatial_index_min_segments {
            Some(SegmentIndex::from_segments(segments))
        } else {
            None
        }
    }
}

/// Position of the unvisited segment closest to `point`; first wins on ties
pub fn nearest_unvisited(point: &Position, segments: &[StreetSegment]) -> Result<Option<usize>> {
    nearest_unvisited_excluding(point, segments, &[])
}

fn nearest_unvisited_excluding(
    point: &Position,
    segments: &[StreetSegment],
    excluded: &[usize],
) -> Result<Option<usize>> {
    let mut nearest: Option<usize> = None;
    let mut min_distance = f64::INFINITY;

    for (position, segment) in segments.iter().enumerate() {
        if segment.visited || excluded.contains(&position) {
            continue;
        }
        let dist = distance_to_segment(point, segment)?;
        if dist < min_distance {
            min_distance = dist;
            nearest = Some(position);
        }
    }

    Ok(nearest)
}

fn validate_geometry(segments: &[StreetSegment]) -> Result<()> {
    match segments.iter().find(|s| s.point_count() < 2) {
        Some(bad) => Err(CoverageError::InvalidGeometry {
            segment_id: bad.id.clone(),
            point_count: bad.point_count(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::RoadClass;
    use crate::proximity::EARTH_RADIUS_M;

    /// Latitude offset in degrees for a distance in meters
    fn north(meters: f64) -> f64 {
        (meters / EARTH_RADIUS_M).to_degrees()
    }

    fn street(id: &str, points: &[(f64, f64)]) -> StreetSegment {
        StreetSegment::from_lat_lng(id, points, RoadClass::Residential)
    }

    fn scenario_tracker() -> CoverageTracker {
        let tracker = CoverageTracker::new(TrackerConfig::default());
        tracker
            .load_area(vec![
                street("way/1", &[(40.758, -73.986), (40.759, -73.985)]),
                street("way/2", &[(40.760, -73.986), (40.761, -73.985)]),
                street("way/3", &[(40.770, -73.970), (40.771, -73.970)]),
            ])
            .unwrap();
        tracker
    }

    fn visited_ids(state: &CoverageState) -> Vec<String> {
        state
            .segments()
            .iter()
            .filter(|s| s.visited)
            .map(|s| s.id.clone())
            .collect()
    }

    #[test]
    fn test_visit_and_target() {
        let tracker = scenario_tracker();
        tracker.update_position(&Position::new(40.7585, -73.9855)).unwrap();

        let state = tracker.state().unwrap();
        assert_eq!(visited_ids(&state), vec!["way/1"]);
        assert_eq!(state.target().unwrap().id, "way/2");
        assert_eq!(state.target_anchor(), Some((40.760, -73.986)));
    }

    #[test]
    fn test_target_uses_post_update_set() {
        let tracker = scenario_tracker();
        tracker.update_position(&Position::new(40.758, -73.986)).unwrap();

        // way/1 was both nearest and just visited; it must never be the target
        let state = tracker.state().unwrap();
        let target = state.target().unwrap();
        assert_ne!(target.id, "way/1");
        assert!(!target.visited);
    }

    #[test]
    fn test_nearest_target_selection() {
        let a = street("way/a", &[(north(50.0), -0.001), (north(50.0), 0.001)]);
        let b = street("way/b", &[(north(10.0), -0.001), (north(10.0), 0.001)]);
        let segments = vec![a, b];

        assert_eq!(nearest_unvisited(&Position::new(0.0, 0.0), &segments).unwrap(), Some(1));

        // Threshold below both distances so neither is visited
        let config = TrackerConfig {
            visit_threshold_m: 5.0,
            ..TrackerConfig::default()
        };
        let tracker = CoverageTracker::new(config);
        tracker.load_area(segments).unwrap();
        tracker.update_position(&Position::new(0.0, 0.0)).unwrap();

        let state = tracker.state().unwrap();
        assert_eq!(state.visited_count(), 0);
        assert_eq!(state.target().unwrap().id, "way/b");
    }

    #[test]
    fn test_tie_broken_by_load_order() {
        // Overlapping ways (e.g. a dual-tagged street) are exactly equidistant
        let points = [(north(40.0), -0.001), (north(40.0), 0.001)];
        let segments = vec![street("way/first", &points), street("way/second", &points)];
        let origin = Position::new(0.0, 0.0);

        let picked = nearest_unvisited(&origin, &segments).unwrap().unwrap();
        assert_eq!(segments[picked].id, "way/first");

        let reversed: Vec<StreetSegment> = segments.into_iter().rev().collect();
        let picked = nearest_unvisited(&origin, &reversed).unwrap().unwrap();
        assert_eq!(reversed[picked].id, "way/second");
    }

    #[test]
    fn test_intersection_marks_all_matches() {
        let tracker = CoverageTracker::new(TrackerConfig::default());
        tracker
            .load_area(vec![
                street("way/ew", &[(0.0, -0.001), (0.0, 0.001)]),
                street("way/ns", &[(-0.001, 0.0), (0.001, 0.0)]),
                street("way/far", &[(0.01, 0.01), (0.011, 0.01)]),
            ])
            .unwrap();

        tracker.update_position(&Position::new(0.0, 0.0)).unwrap();
        let state = tracker.state().unwrap();
        assert_eq!(visited_ids(&state), vec!["way/ew", "way/ns"]);
        assert_eq!(state.target().unwrap().id, "way/far");
    }

    #[test]
    fn test_idempotent_visiting() {
        let tracker = scenario_tracker();
        let point = Position::new(40.7585, -73.9855);

        tracker.update_position(&point).unwrap();
        let first = tracker.state().unwrap();

        tracker.update_position(&point).unwrap();
        let second = tracker.state().unwrap();

        assert_eq!(first, second);
        assert_eq!(tracker.apply_position(&point).unwrap(), 0);
    }

    #[test]
    fn test_monotonic_coverage_and_target_invariant() {
        let tracker = scenario_tracker();
        let path = [
            (40.7570, -73.9870),
            (40.7585, -73.9855),
            (40.7595, -73.9850),
            (40.7605, -73.9855),
            (40.7500, -73.9500),
            (40.7705, -73.9700),
        ];

        let mut last_visited = 0;
        for (lat, lng) in path {
            tracker.update_position(&Position::new(lat, lng)).unwrap();
            let state = tracker.state().unwrap();

            assert!(state.visited_count() >= last_visited);
            last_visited = state.visited_count();

            match state.target() {
                Some(target) => assert!(!target.visited),
                None => assert!(state.is_complete()),
            }
        }

        let state = tracker.state().unwrap();
        assert!(state.is_complete());
        assert!(state.target().is_none());
        assert_eq!(state.progress().percent, 100);
    }

    #[test]
    fn test_invalid_position_leaves_state_unchanged() {
        let tracker = scenario_tracker();
        tracker.update_position(&Position::new(40.7585, -73.9855)).unwrap();
        let before = tracker.state().unwrap();

        let result = tracker.update_position(&Position::new(200.0, 0.0));
        assert!(matches!(result, Err(CoverageError::InvalidPosition { .. })));

        let result = tracker.update_position(&Position::new(40.0, f64::NAN));
        assert!(matches!(result, Err(CoverageError::InvalidPosition { .. })));

        assert_eq!(tracker.state().unwrap(), before);
    }

    #[test]
    fn test_load_area_rejects_degenerate_segments() {
        let tracker = scenario_tracker();
        let result = tracker.load_area(vec![
            street("way/ok", &[(1.0, 1.0), (1.001, 1.0)]),
            street("way/bad", &[(1.0, 1.0)]),
        ]);

        assert_eq!(
            result.unwrap_err(),
            CoverageError::InvalidGeometry {
                segment_id: "way/bad".to_string(),
                point_count: 1,
            }
        );
        // Previous area still loaded
        assert_eq!(tracker.progress().unwrap().total, 3);
    }

    #[test]
    fn test_load_area_replaces_and_clears_target() {
        let tracker = scenario_tracker();
        tracker.update_position(&Position::new(40.7585, -73.9855)).unwrap();
        assert!(tracker.state().unwrap().target().is_some());

        tracker
            .load_area(vec![street("way/1", &[(40.758, -73.986), (40.759, -73.985)])])
            .unwrap();

        let state = tracker.state().unwrap();
        assert!(state.target().is_none());
        assert_eq!(state.visited_count(), 0);
        assert_eq!(state.total_count(), 1);
    }

    #[test]
    fn test_merge_area_keeps_common_visits() {
        let tracker = scenario_tracker();
        tracker.update_position(&Position::new(40.7585, -73.9855)).unwrap();

        tracker
            .merge_area(vec![
                street("way/1", &[(40.758, -73.986), (40.759, -73.985)]),
                street("way/4", &[(40.780, -73.986), (40.781, -73.985)]),
            ])
            .unwrap();

        let state = tracker.state().unwrap();
        assert_eq!(visited_ids(&state), vec!["way/1"]);
        assert!(!state.segment("way/4").unwrap().visited);
        assert!(state.target().is_none());
        assert!(state.segment("way/2").is_none());
    }

    #[test]
    fn test_empty_area() {
        let tracker = CoverageTracker::new(TrackerConfig::default());
        tracker.load_area(Vec::new()).unwrap();
        tracker.update_position(&Position::new(10.0, 10.0)).unwrap();

        let state = tracker.state().unwrap();
        assert!(state.target().is_none());
        assert!(!state.is_complete());
        assert_eq!(
            state.progress(),
            CoverageProgress {
                visited: 0,
                total: 0,
                percent: 0
            }
        );
    }

    #[test]
    fn test_accuracy_scaled_threshold() {
        let seg = street("way/1", &[(north(30.0), -0.001), (north(30.0), 0.001)]);
        let point = Position::new(0.0, 0.0).with_accuracy(40.0);

        let plain = CoverageTracker::new(TrackerConfig::default());
        plain.load_area(vec![seg.clone()]).unwrap();
        plain.update_position(&point).unwrap();
        assert_eq!(plain.progress().unwrap().visited, 0);

        let scaled = CoverageTracker::new(TrackerConfig {
            accuracy_scaling: true,
            ..TrackerConfig::default()
        });
        scaled.load_area(vec![seg]).unwrap();
        scaled.update_position(&point).unwrap();
        assert_eq!(scaled.progress().unwrap().visited, 1);
    }

    #[test]
    fn test_indexed_matches_full_scan() {
        let mut segments = Vec::new();
        for row in 0..12 {
            for col in 0..12 {
                let lat = 51.5 + row as f64 * 0.0004;
                let lng = -0.12 + col as f64 * 0.0007;
                segments.push(street(
                    &format!("way/h{}_{}", row, col),
                    &[(lat, lng), (lat, lng + 0.0006)],
                ));
                segments.push(street(
                    &format!("way/v{}_{}", row, col),
                    &[(lat, lng), (lat + 0.0003, lng)],
                ));
            }
        }

        let full = CoverageTracker::new(TrackerConfig {
            spatial_index_min_segments: usize::MAX,
            ..TrackerConfig::default()
        });
        let indexed = CoverageTracker::new(TrackerConfig {
            spatial_index_min_segments: 1,
            ..TrackerConfig::default()
        });
        full.load_area(segments.clone()).unwrap();
        indexed.load_area(segments).unwrap();

        for step in 0..80 {
            let t = step as f64 / 80.0;
            let lat = 51.4995 + t * 0.005 + (t * 17.0).sin() * 0.0004;
            let lng = -0.1205 + t * 0.008;
            let point = Position::new(lat, lng);

            full.update_position(&point).unwrap();
            indexed.update_position(&point).unwrap();

            let a = full.state().unwrap();
            let b = indexed.state().unwrap();
            assert_eq!(visited_ids(&a), visited_ids(&b), "diverged at step {}", step);
            assert_eq!(a.target().map(|s| &s.id), b.target().map(|s| &s.id));
        }

        assert!(full.progress().unwrap().visited > 10);
    }

    /// Visited ids after one update, full scan vs. R-tree prefilter
    fn visited_both_ways(
        segments: Vec<StreetSegment>,
        point: &Position,
    ) -> (Vec<String>, Vec<String>) {
        let full = CoverageTracker::new(TrackerConfig {
            spatial_index_min_segments: usize::MAX,
            ..TrackerConfig::default()
        });
        let indexed = CoverageTracker::new(TrackerConfig {
            spatial_index_min_segments: 1,
            ..TrackerConfig::default()
        });
        full.load_area(segments.clone()).unwrap();
        indexed.load_area(segments).unwrap();
        full.update_position(point).unwrap();
        indexed.update_position(point).unwrap();

        (
            visited_ids(&full.state().unwrap()),
            visited_ids(&indexed.state().unwrap()),
        )
    }

    #[test]
    fn test_indexed_matches_full_scan_on_long_arc() {
        // The great circle bulges ~9.5m north of lat 60 at the arc's middle
        let segments = vec![street("way/long", &[(60.0, 10.0), (60.0, 10.3)])];
        let point = Position::new(60.0 + north(25.0), 10.15);

        let (full, indexed) = visited_both_ways(segments, &point);
        assert_eq!(full, vec!["way/long".to_string()]);
        assert_eq!(indexed, full);
    }

    #[test]
    fn test_indexed_matches_full_scan_across_antimeridian() {
        let segments = vec![street("way/dateline", &[(0.0, -179.99995), (0.0, -179.9999)])];
        let point = Position::new(0.0, 179.99999);

        let (full, indexed) = visited_both_ways(segments, &point);
        assert_eq!(full, vec!["way/dateline".to_string()]);
        assert_eq!(indexed, full);
    }

    #[test]
    fn test_unvalidated_threshold_cap_does_not_panic() {
        let tracker = CoverageTracker::new(TrackerConfig {
            visit_threshold_m: 60.0,
            accuracy_scaling: true,
            ..TrackerConfig::default()
        });
        tracker
            .load_area(vec![street("way/1", &[(40.0, -73.0), (40.0, -72.999)])])
            .unwrap();

        // ~50m north of the street: inside the 60m base threshold
        let point = Position::new(40.0 + north(50.0), -72.9995).with_accuracy(10.0);
        tracker.update_position(&point).unwrap();
        assert_eq!(tracker.progress().unwrap().visited, 1);
    }

    #[test]
    fn test_clear_target() {
        let tracker = scenario_tracker();
        tracker.update_position(&Position::new(40.7585, -73.9855)).unwrap();
        tracker.clear_target().unwrap();

        let state = tracker.state().unwrap();
        assert!(state.target().is_none());
        assert_eq!(state.visited_count(), 1);
    }

    #[test]
    fn test_concurrent_updates_and_reloads() {
        use std::sync::Arc;
        use std::thread;

        let tracker = Arc::new(scenario_tracker());
        let mut handles = Vec::new();

        for worker in 0..4 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                for i in 0..50 {
                    let lat = 40.757 + (i % 20) as f64 * 0.0002;
                    tracker.update_position(&Position::new(lat, -73.9855)).unwrap();
                    if worker == 0 && i % 10 == 0 {
                        let area = vec![street("way/1", &[(40.758, -73.986), (40.759, -73.985)])];
                        tracker.load_area(area).unwrap();
                    }
                    let state = tracker.state().unwrap();
                    if let Some(target) = state.target() {
                        assert!(!target.visited);
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
