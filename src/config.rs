use crate::error::{CoverageError, Result};
use crate::proximity::DEFAULT_VISIT_THRESHOLD_M;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Tunables for coverage tracking and the provider clients
///
/// Every field has a default, so a config file only needs the keys it changes:
///
/// ```json
/// { "visit_threshold_m": 25.0, "accuracy_scaling": true }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Distance within which a street counts as visited
    pub visit_threshold_m: f64,
    /// Widen the threshold to the reported GPS accuracy
    pub accuracy_scaling: bool,
    /// Upper bound for the accuracy-scaled threshold
    pub max_visit_threshold_m: f64,
    /// Build an R-tree prefilter at or above this many segments
    pub spatial_index_min_segments: usize,
    /// Half-width of the area fetched around the user, in degrees
    pub area_offset_deg: f64,
    pub overpass_url: String,
    pub overpass_timeout_secs: u64,
    pub osrm_url: String,
    pub http_timeout_secs: u64,
    /// Directory for on-disk breadcrumb logs; in-memory when unset
    pub breadcrumb_dir: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            visit_threshold_m: DEFAULT_VISIT_THRESHOLD_M,
            accuracy_scaling: false,
            max_visit_threshold_m: 50.0,
            spatial_index_min_segments: 256,
            area_offset_deg: 0.04,
            overpass_url: "https://overpass-api.de/api/interpreter".to_string(),
            overpass_timeout_secs: 25,
            osrm_url: "https://router.project-osrm.org".to_string(),
            http_timeout_secs: 30,
            breadcrumb_dir: None,
        }
    }
}

impl TrackerConfig {
    /// Load and validate a JSON config file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| {
                CoverageError::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: TrackerConfig = serde_json::from_str(text)
            .map_err(|e| CoverageError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.visit_threshold_m.is_finite() || self.visit_threshold_m <= 0.0 {
            return Err(CoverageError::Config(format!(
                "visit_threshold_m must be positive, got {}",
                self.visit_threshold_m
            )));
        }
        // The cap only matters when thresholds scale with accuracy
        let max_ok = self.max_visit_threshold_m.is_finite()
            && (!self.accuracy_scaling || self.max_visit_threshold_m >= self.visit_threshold_m);
        if !max_ok {
            return Err(CoverageError::Config(format!(
                "max_visit_threshold_m ({}) must be >= visit_threshold_m ({})",
                self.max_visit_threshold_m, self.visit_threshold_m
            )));
        }
        let offset = self.area_offset_deg;
        if !offset.is_finite() || offset <= 0.0 || offset > 1.0 {
            return Err(CoverageError::Config(format!(
                "area_offset_deg must be in (0, 1], got {}",
                self.area_offset_deg
            )));
        }
        Ok(())
    }

    /// Visit threshold for a fix with the given reported accuracy
    pub fn threshold_for(&self, accuracy: Option<f64>) -> f64 {
        match accuracy {
            // Never below the base threshold, even with an unvalidated cap under it
            Some(acc) if self.accuracy_scaling && acc.is_finite() => acc
                .min(self.max_visit_threshold_m)
                .max(self.visit_threshold_m),
            _ => self.visit_threshold_m,
        }
    }
}
