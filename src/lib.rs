//! Street coverage tracking.
//!
//! Ingests an OpenStreetMap street network, matches a stream of positions
//! against it, and reports which streets have been driven along with the
//! nearest one still left to cover.

pub mod breadcrumbs;
pub mod config;
pub mod coverage;
pub mod directions;
pub mod drive;
pub mod error;
pub mod network;
pub mod position;
pub mod proximity;
pub mod trip;

pub use config::TrackerConfig;
pub use coverage::{nearest_unvisited, CoverageProgress, CoverageState, CoverageTracker};
pub use error::{AreaLoadError, CoverageError, FetchError, Result};
pub use position::Position;
