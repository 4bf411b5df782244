//! Live drive loop: session bookkeeping around the coverage tracker.
//!
//! Each accepted fix is persisted as a breadcrumb, integrated into the trip
//! distance, and matched against the loaded streets, in that order.

use crate::breadcrumbs::{Breadcrumb, BreadcrumbStore, SessionRecord};
use crate::coverage::{CoverageProgress, CoverageTracker};
use crate::error::{lock_poisoned, CoverageError, Result};
use crate::position::Position;
use crate::trip::{TripAccumulator, TripStats};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Result of one processed fix
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveUpdate {
    pub newly_visited: usize,
    pub target_id: Option<String>,
    pub progress: CoverageProgress,
    pub distance_meters: f64,
}

/// Final numbers for a finished (or replayed) drive
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveSummary {
    pub session: SessionRecord,
    pub trip: TripStats,
    pub progress: CoverageProgress,
}

pub struct DriveTracker<S: BreadcrumbStore> {
    coverage: Arc<CoverageTracker>,
    trip: TripAccumulator,
    store: S,
    session: Mutex<Option<SessionRecord>>,
}

impl<S: BreadcrumbStore> DriveTracker<S> {
    pub fn new(coverage: Arc<CoverageTracker>, store: S) -> Self {
        DriveTracker {
            coverage,
            trip: TripAccumulator::new(),
            store,
            session: Mutex::new(None),
        }
    }

    pub fn coverage(&self) -> &Arc<CoverageTracker> {
        &self.coverage
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn active_session(&self) -> Result<Option<SessionRecord>> {
        let session = self.session.lock().map_err(|_| lock_poisoned("drive session"))?;
        Ok(session.clone())
    }

    pub fn trip_stats(&self) -> Result<TripStats> {
        self.trip.stats()
    }

    /// Open a session and start integrating distance
    ///
    /// Without a name the session is called `Drive - <date time>`.
    pub fn start(&self, name: Option<&str>) -> Result<SessionRecord> {
        let mut session = self.session.lock().map_err(|_| lock_poisoned("drive session"))?;
        if session.is_some() {
            return Err(CoverageError::SessionAlreadyActive);
        }

        let name = match name {
            Some(name) => name.to_string(),
            None => format!("Drive - {}", Utc::now().format("%Y-%m-%d %H:%M")),
        };
        let record = self.store.create_session(&name)?;
        self.trip.start()?;

        log::info!("Started session {} ({})", record.id, record.name);
        *session = Some(record.clone());
        Ok(record)
    }

    /// Process one fix
    ///
    /// # Returns
    /// `None` when no session is active (the fix is dropped)
    ///
    /// # Errors
    /// `InvalidPosition` before any side effect. A failed breadcrumb write is
    /// logged and does not stop coverage tracking.
    pub fn on_position(&self, point: &Position) -> Result<Option<DriveUpdate>> {
        point.validate()?;

        let session = self.session.lock().map_err(|_| lock_poisoned("drive session"))?;
        let session_id = match session.as_ref() {
            Some(record) => record.id,
            None => return Ok(None),
        };

        if let Err(e) = self.store.append(&Breadcrumb::from_position(session_id, point)) {
            log::warn!("Failed to save breadcrumb for session {}: {}", session_id, e);
        }

        self.trip.record_position(point)?;
        let newly_visited = self.coverage.apply_position(point)?;

        Ok(Some(DriveUpdate {
            newly_visited,
            target_id: self.coverage.target_id()?,
            progress: self.coverage.progress()?,
            distance_meters: self.trip.stats()?.distance_meters,
        }))
    }

    /// Freeze the trip, close the session, and drop the navigation target
    pub fn stop(&self) -> Result<DriveSummary> {
        let mut session = self.session.lock().map_err(|_| lock_poisoned("drive session"))?;
        let mut record = session.take().ok_or(CoverageError::SessionNotActive)?;

        let trip = self.trip.stop()?;
        self.coverage.clear_target()?;

        // Local state is already closed; a store failure only leaves the record stale
        if let Err(e) = self.store.end_session(record.id) {
            log::warn!("Failed to close session {}: {}", record.id, e);
        }
        record.is_active = false;

        Ok(DriveSummary {
            session: record,
            trip,
            progress: self.coverage.progress()?,
        })
    }
}

/// Rebuild coverage and distance for a stored session
///
/// Breadcrumbs are fed through `tracker` in timestamp order. Invalid
/// breadcrumbs are skipped with a warning.
///
/// # Errors
/// `Storage` if the session does not exist or its log cannot be read.
pub fn replay_session(
    store: &dyn BreadcrumbStore,
    tracker: &CoverageTracker,
    session_id: u64,
) -> Result<DriveSummary> {
    let session = store
        .session(session_id)?
        .ok_or_else(|| CoverageError::Storage(format!("Unknown session {}", session_id)))?;
    let crumbs = store.breadcrumbs(session_id)?;

    let trip = TripAccumulator::new();
    trip.start()?;

    let mut skipped = 0usize;
    for crumb in &crumbs {
        let point = crumb.to_position();
        if point.validate().is_err() {
            skipped += 1;
            continue;
        }
        trip.record_position(&point)?;
        tracker.apply_position(&point)?;
    }

    if skipped > 0 {
        log::warn!("Skipped {} invalid breadcrumbs in session {}", skipped, session_id);
    }
    log::info!(
        "Replayed session {}: {} breadcrumbs",
        session_id,
        crumbs.len() - skipped
    );

    Ok(DriveSummary {
        session,
        trip: trip.stop()?,
        progress: tracker.progress()?,
    })
}
