use crate::error::{CoverageError, Result};
use chrono::{DateTime, Utc};
use geo::Coord;
use serde::{Deserialize, Serialize};

/// A single location fix from the device
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    /// Accuracy radius in meters
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// Degrees clockwise from north
    #[serde(default)]
    pub heading: Option<f64>,
    /// Meters per second
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Position {
    /// Position captured now, with no accuracy/heading/speed
    pub fn new(lat: f64, lng: f64) -> Self {
        Position {
            lat,
            lng,
            accuracy: None,
            heading: None,
            speed: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Reject non-finite or out-of-range coordinates
    pub fn validate(&self) -> Result<()> {
        let lat_ok = self.lat.is_finite() && (-90.0..=90.0).contains(&self.lat);
        let lng_ok = self.lng.is_finite() && (-180.0..=180.0).contains(&self.lng);
        if lat_ok && lng_ok {
            Ok(())
        } else {
            Err(CoverageError::InvalidPosition {
                lat: self.lat,
                lng: self.lng,
            })
        }
    }

    /// geo coordinate, x = lng, y = lat
    pub fn coord(&self) -> Coord<f64> {
        Coord {
            x: self.lng,
            y: self.lat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_positions() {
        assert!(Position::new(0.0, 0.0).validate().is_ok());
        assert!(Position::new(90.0, 180.0).validate().is_ok());
        assert!(Position::new(-90.0, -180.0).validate().is_ok());
    }

    #[test]
    fn test_invalid_positions() {
        assert!(Position::new(200.0, 0.0).validate().is_err());
        assert!(Position::new(0.0, -180.5).validate().is_err());
        assert!(Position::new(f64::NAN, 0.0).validate().is_err());
        assert!(Position::new(0.0, f64::INFINITY).validate().is_err());

        match Position::new(200.0, 1.0).validate() {
            Err(CoverageError::InvalidPosition { lat, lng }) => {
                assert_eq!(lat, 200.0);
                assert_eq!(lng, 1.0);
            }
            other => panic!("expected InvalidPosition, got {:?}", other),
        }
    }

    #[test]
    fn test_deserialize_minimal() {
        let pos: Position = serde_json::from_str(r#"{"lat": 40.0, "lng": -73.0}"#).unwrap();
        assert_eq!(pos.lat, 40.0);
        assert_eq!(pos.accuracy, None);

        let pos: Position = serde_json::from_str(
            r#"{"lat": 40.0, "lng": -73.0, "accuracy": 8.5, "timestamp": "2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(pos.accuracy, Some(8.5));
        assert_eq!(pos.timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_coord_axis_order() {
        let c = Position::new(40.5, -73.25).coord();
        assert_eq!(c.x, -73.25);
        assert_eq!(c.y, 40.5);
    }
}
