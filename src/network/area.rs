use super::parse_osm_json;
use crate::coverage::CoverageTracker;
use crate::error::{lock_poisoned, AreaLoadError, CoverageError, FetchError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;

/// Geographic bounding box in degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BoundingBox {
    /// Square box of `offset_deg` in every direction, clamped to valid coordinates
    ///
    /// The default offset of 0.04° gives roughly an 8km half-width box.
    pub fn around(lat: f64, lng: f64, offset_deg: f64) -> Self {
        BoundingBox {
            north: (lat + offset_deg).min(90.0),
            south: (lat - offset_deg).max(-90.0),
            east: (lng + offset_deg).min(180.0),
            west: (lng - offset_deg).max(-180.0),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let finite = [self.north, self.south, self.east, self.west]
            .iter()
            .all(|v| v.is_finite());
        let ordered = self.south <= self.north && self.west <= self.east;
        let in_range = (-90.0..=90.0).contains(&self.south)
            && (-90.0..=90.0).contains(&self.north)
            && (-180.0..=180.0).contains(&self.west)
            && (-180.0..=180.0).contains(&self.east);

        if finite && ordered && in_range {
            Ok(())
        } else {
            Err(CoverageError::Config(format!("Invalid bounding box: {:?}", self)))
        }
    }

    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.south && lat <= self.north && lng >= self.west && lng <= self.east
    }

    /// (lat, lng) of the box center
    pub fn center(&self) -> (f64, f64) {
        ((self.north + self.south) / 2.0, (self.east + self.west) / 2.0)
    }
}

/// Source of raw street-network data (Overpass JSON text)
pub trait StreetNetworkProvider {
    fn fetch_network(
        &mut self,
        bbox: &BoundingBox,
    ) -> impl Future<Output = std::result::Result<String, FetchError>> + Send;
}

/// Issued per area request; only the newest one may be applied
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AreaTicket {
    generation: u64,
}

/// Orders overlapping area loads so a superseded fetch never overwrites a newer area
#[derive(Default)]
pub struct AreaRequests {
    latest: Mutex<u64>,
}

impl AreaRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new request, superseding every earlier ticket
    pub fn begin(&self) -> Result<AreaTicket> {
        let mut latest = self.latest.lock().map_err(|_| lock_poisoned("area request"))?;
        *latest += 1;
        Ok(AreaTicket { generation: *latest })
    }

    pub fn is_current(&self, ticket: AreaTicket) -> Result<bool> {
        let latest = self.latest.lock().map_err(|_| lock_poisoned("area request"))?;
        Ok(*latest == ticket.generation)
    }

    /// Load `segments` into the tracker if `ticket` is still the newest request
    ///
    /// # Returns
    /// `true` if applied, `false` if the ticket was stale
    pub fn apply(
        &self,
        ticket: AreaTicket,
        tracker: &CoverageTracker,
        segments: Vec<super::StreetSegment>,
    ) -> Result<bool> {
        // Held across the load so a newer ticket cannot slip in between check and swap
        let latest = self.latest.lock().map_err(|_| lock_poisoned("area request"))?;
        if *latest != ticket.generation {
            log::debug!(
                "Discarding stale area result (ticket {}, latest {})",
                ticket.generation,
                *latest
            );
            return Ok(false);
        }
        tracker.load_area(segments)?;
        Ok(true)
    }
}

/// Result of [`load_area_for`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AreaLoadOutcome {
    Applied { segments: usize },
    Stale,
}

/// Fetch the street network around (lat, lng), ingest it, and load it into the tracker
///
/// # Arguments
/// * `provider` - Street-network source
/// * `tracker` - Coverage tracker receiving the new area
/// * `requests` - Shared request ordering; a newer call started while this one
///   is in flight wins
/// * `lat`, `lng` - Center of the area in degrees
/// * `offset_deg` - Half-width of the box in degrees
pub async fn load_area_for<P: StreetNetworkProvider>(
    provider: &mut P,
    tracker: &CoverageTracker,
    requests: &AreaRequests,
    lat: f64,
    lng: f64,
    offset_deg: f64,
) -> std::result::Result<AreaLoadOutcome, AreaLoadError> {
    let bbox = BoundingBox::around(lat, lng, offset_deg);
    bbox.validate()?;

    let ticket = requests.begin()?;
    let body = provider.fetch_network(&bbox).await?;
    let segments = parse_osm_json(&body)?;
    let count = segments.len();

    if requests.apply(ticket, tracker, segments)? {
        log::info!(
            "Found {} driveable streets around ({:.5}, {:.5})",
            count,
            lat,
            lng
        );
        Ok(AreaLoadOutcome::Applied { segments: count })
    } else {
        Ok(AreaLoadOutcome::Stale)
    }
}
