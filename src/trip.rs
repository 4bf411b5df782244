use crate::error::{lock_poisoned, CoverageError, Result};
use crate::position::Position;
use crate::proximity::haversine_distance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Accumulator state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripState {
    /// Never started
    Idle,
    /// Integrating distance
    Active,
    /// Frozen until the next start
    Stopped,
}

/// Distance statistics for one drive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripStats {
    pub distance_meters: f64,
    /// Last accepted position, the anchor for the next distance increment
    pub anchor: Option<Position>,
    pub sample_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TripStats {
    fn empty() -> Self {
        TripStats {
            distance_meters: 0.0,
            anchor: None,
            sample_count: 0,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn distance_km(&self) -> f64 {
        self.distance_meters / 1000.0
    }
}

struct TripInner {
    state: TripState,
    stats: TripStats,
}

/// Integrates great-circle distance over the position stream of one drive
pub struct TripAccumulator {
    inner: Mutex<TripInner>,
}

impl TripAccumulator {
    pub fn new() -> Self {
        TripAccumulator {
            inner: Mutex::new(TripInner {
                state: TripState::Idle,
                stats: TripStats::empty(),
            }),
        }
    }

    /// Reset distance and anchor and begin integrating
    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("trip"))?;
        inner.state = TripState::Active;
        inner.stats = TripStats {
            started_at: Some(Utc::now()),
            ..TripStats::empty()
        };
        Ok(())
    }

    /// Add the distance from the anchor to `point`, then move the anchor
    ///
    /// No-op unless active. Identical consecutive points add nothing.
    pub fn record_position(&self, point: &Position) -> Result<()> {
        point.validate()?;

        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("trip"))?;
        if inner.state != TripState::Active {
            return Ok(());
        }

        let stats = &mut inner.stats;
        if let Some(anchor) = &stats.anchor {
            stats.distance_meters += haversine_distance(anchor.coord(), point.coord());
        }
        stats.anchor = Some(point.clone());
        stats.sample_count += 1;

        Ok(())
    }

    /// Freeze and return the final stats
    pub fn stop(&self) -> Result<TripStats> {
        let mut inner = self.inner.lock().map_err(|_| lock_poisoned("trip"))?;
        if inner.state != TripState::Active {
            return Err(CoverageError::SessionNotActive);
        }

        inner.state = TripState::Stopped;
        inner.stats.ended_at = Some(Utc::now());

        log::info!(
            "Trip ended: {:.2} km over {} samples",
            inner.stats.distance_km(),
            inner.stats.sample_count
        );

        Ok(inner.stats.clone())
    }

    pub fn stats(&self) -> Result<TripStats> {
        let inner = self.inner.lock().map_err(|_| lock_poisoned("trip"))?;
        Ok(inner.stats.clone())
    }

    pub fn state(&self) -> Result<TripState> {
        let inner = self.inner.lock().map_err(|_| lock_poisoned("trip"))?;
        Ok(inner.state)
    }

    pub fn is_active(&self) -> Result<bool> {
        Ok(self.state()? == TripState::Active)
    }
}

impl Default for TripAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
