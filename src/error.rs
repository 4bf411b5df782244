use thiserror::Error;

/// Street coverage error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoverageError {
    #[error("Segment {segment_id} has {point_count} coordinates, at least 2 required")]
    InvalidGeometry {
        segment_id: String,
        point_count: usize,
    },

    #[error("Invalid position: lat={lat}, lng={lng}")]
    InvalidPosition { lat: f64, lng: f64 },

    #[error("Malformed street network: {0}")]
    MalformedNetwork(String),

    #[error("Session already active")]
    SessionAlreadyActive,

    #[error("Session not active")]
    SessionNotActive,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for coverage operations
pub type Result<T> = std::result::Result<T, CoverageError>;

/// Failures of the street-network and directions providers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Network timeout")]
    NetworkTimeout,

    #[error("HTTP error: {0}")]
    HttpError(u16),

    #[error("Provider query timed out")]
    ProviderTimeout,

    #[error("Rate limited by provider")]
    RateLimited,

    #[error("No route found")]
    NoRoute,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unknown error: {0}")]
    UnknownError(String),
}

/// Failure while fetching and applying a new area
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AreaLoadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Coverage(#[from] CoverageError),
}

/// Map a poisoned lock into an internal error
pub(crate) fn lock_poisoned(what: &str) -> CoverageError {
    CoverageError::Internal(format!("Failed to acquire {} lock", what))
}
