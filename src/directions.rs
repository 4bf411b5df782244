use crate::config::TrackerConfig;
use crate::coverage::CoverageState;
use crate::error::FetchError;
use crate::position::Position;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

const DEFAULT_INSTRUCTION: &str = "Continue";
const DEFAULT_ROAD_NAME: &str = "Unnamed road";

/// One turn-by-turn step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStep {
    /// Meters
    pub distance: f64,
    /// Seconds
    pub duration: f64,
    pub instruction: String,
    pub name: String,
}

/// Driving route between two points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Meters
    pub distance: f64,
    /// Seconds
    pub duration: f64,
    pub steps: Vec<RouteStep>,
}

/// Turn-by-turn routing between two (lat, lng) points
pub trait DirectionsProvider {
    fn route(
        &self,
        start: (f64, f64),
        end: (f64, f64),
    ) -> impl Future<Output = Result<Route, FetchError>> + Send;
}

#[derive(Deserialize)]
struct OsrmResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
    #[serde(default)]
    legs: Vec<OsrmLeg>,
}

#[derive(Deserialize)]
struct OsrmLeg {
    #[serde(default)]
    steps: Vec<OsrmStep>,
}

#[derive(Deserialize)]
struct OsrmStep {
    distance: f64,
    duration: f64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    maneuver: Option<OsrmManeuver>,
}

#[derive(Deserialize)]
struct OsrmManeuver {
    #[serde(default)]
    instruction: Option<String>,
}

fn non_empty_or(value: Option<String>, fallback: &str) -> String {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

/// Convert an OSRM `route` response into a [`Route`] from its first route
pub fn parse_osrm_response(body: &str) -> Result<Route, FetchError> {
    let response: OsrmResponse =
        serde_json::from_str(body).map_err(|e| FetchError::ParseError(e.to_string()))?;

    let route = match response.routes.into_iter().next() {
        Some(route) => route,
        None => {
            log::debug!("OSRM returned no routes (code {:?})", response.code);
            return Err(FetchError::NoRoute);
        }
    };

    let steps = route
        .legs
        .into_iter()
        .flat_map(|leg| leg.steps)
        .map(|step| RouteStep {
            distance: step.distance,
            duration: step.duration,
            instruction: non_empty_or(
                step.maneuver.and_then(|m| m.instruction),
                DEFAULT_INSTRUCTION,
            ),
            name: non_empty_or(step.name, DEFAULT_ROAD_NAME),
        })
        .collect();

    Ok(Route {
        distance: route.distance,
        duration: route.duration,
        steps,
    })
}

/// OSRM HTTP client using the `car` profile
pub struct OsrmClient {
    client: reqwest::Client,
    base_url: String,
}

impl OsrmClient {
    pub fn new(config: &TrackerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent(concat!("street-coverage/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        OsrmClient {
            client,
            base_url: config.osrm_url.trim_end_matches('/').to_string(),
        }
    }

    fn route_url(&self, start: (f64, f64), end: (f64, f64)) -> String {
        // OSRM takes lng,lat pairs
        format!(
            "{}/route/v1/car/{},{};{},{}?steps=true&geometries=geojson&overview=full",
            self.base_url, start.1, start.0, end.1, end.0
        )
    }

    pub async fn fetch_route(
        &self,
        start: (f64, f64),
        end: (f64, f64),
    ) -> Result<Route, FetchError> {
        let url = self.route_url(start, end);
        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Err(FetchError::NetworkTimeout),
            Err(e) => return Err(FetchError::UnknownError(e.to_string())),
        };

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }

        let body = response.text().await.map_err(|e| {
            FetchError::UnknownError(format!("Failed to read response: {}", e))
        })?;

        match parse_osrm_response(&body) {
            Ok(route) if status.is_success() => Ok(route),
            // OSRM answers 400 with code "NoRoute" when the points are not connected
            Err(FetchError::NoRoute) => Err(FetchError::NoRoute),
            _ if !status.is_success() => Err(FetchError::HttpError(status.as_u16())),
            other => other,
        }
    }
}

impl DirectionsProvider for OsrmClient {
    async fn route(&self, start: (f64, f64), end: (f64, f64)) -> Result<Route, FetchError> {
        self.fetch_route(start, end).await
    }
}

/// Route from `from` to the first coordinate of the current target, if any
pub async fn route_to_target<P: DirectionsProvider>(
    provider: &P,
    from: &Position,
    state: &CoverageState,
) -> Result<Option<Route>, FetchError> {
    match state.target_anchor() {
        Some(anchor) => provider.route((from.lat, from.lng), anchor).await.map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::CoverageTracker;
    use crate::network::{RoadClass, StreetSegment};
    use std::sync::Mutex;

    const OSRM_BODY: &str = r#"{
        "code": "Ok",
        "routes": [{
            "distance": 1520.4,
            "duration": 181.2,
            "legs": [{
                "steps": [
                    {"distance": 800.0, "duration": 90.0, "name": "Main Street",
                     "maneuver": {"type": "depart", "instruction": "Head north on Main Street"}},
                    {"distance": 720.4, "duration": 91.2, "name": "",
                     "maneuver": {"type": "turn", "modifier": "left"}},
                    {"distance": 0.0, "duration": 0.0,
                     "maneuver": {"type": "arrive"}}
                ]
            }]
        }]
    }"#;

    struct RecordingProvider {
        calls: Mutex<Vec<((f64, f64), (f64, f64))>>,
    }

    impl DirectionsProvider for RecordingProvider {
        async fn route(&self, start: (f64, f64), end: (f64, f64)) -> Result<Route, FetchError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((start, end));
            }
            parse_osrm_response(OSRM_BODY)
        }
    }

    #[test]
    fn test_parse_route() {
        let route = parse_osrm_response(OSRM_BODY).unwrap();

        assert_eq!(route.distance, 1520.4);
        assert_eq!(route.duration, 181.2);
        assert_eq!(route.steps.len(), 3);
        assert_eq!(route.steps[0].instruction, "Head north on Main Street");
        assert_eq!(route.steps[0].name, "Main Street");
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let route = parse_osrm_response(OSRM_BODY).unwrap();

        assert_eq!(route.steps[1].instruction, "Continue");
        assert_eq!(route.steps[1].name, "Unnamed road");
        assert_eq!(route.steps[2].name, "Unnamed road");
    }

    #[test]
    fn test_no_route() {
        let body = r#"{"code": "NoRoute", "message": "Impossible route between points", "routes": []}"#;
        assert_eq!(parse_osrm_response(body).unwrap_err(), FetchError::NoRoute);

        let body = r#"{"code": "NoRoute"}"#;
        assert_eq!(parse_osrm_response(body).unwrap_err(), FetchError::NoRoute);
    }

    #[test]
    fn test_malformed_body() {
        assert!(matches!(
            parse_osrm_response("Bad Gateway"),
            Err(FetchError::ParseError(_))
        ));
    }

    #[test]
    fn test_route_url_orders_lng_lat() {
        let config = TrackerConfig {
            osrm_url: "http://localhost:5000/".to_string(),
            ..TrackerConfig::default()
        };
        let client = OsrmClient::new(&config);

        let url = client.route_url((40.0, -73.0), (40.5, -73.5));
        assert_eq!(
            url,
            "http://localhost:5000/route/v1/car/-73,40;-73.5,40.5?steps=true&geometries=geojson&overview=full"
        );
    }

    #[tokio::test]
    async fn test_route_to_target() {
        let tracker = CoverageTracker::new(TrackerConfig::default());
        tracker
            .load_area(vec![StreetSegment::from_lat_lng(
                "way/1",
                &[(40.01, -73.0), (40.02, -73.0)],
                RoadClass::Residential,
            )])
            .unwrap();

        let provider = RecordingProvider {
            calls: Mutex::new(Vec::new()),
        };
        let here = Position::new(40.0, -73.0);

        // No target before the first position update
        let state = tracker.state().unwrap();
        assert!(route_to_target(&provider, &here, &state).await.unwrap().is_none());

        tracker.update_position(&here).unwrap();
        let state = tracker.state().unwrap();
        let route = route_to_target(&provider, &here, &state).await.unwrap();

        assert!(route.is_some());
        let calls = provider.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), &[((40.0, -73.0), (40.01, -73.0))]);
    }

    #[tokio::test]
    #[ignore]
    async fn test_fetch_route_integration() {
        let client = OsrmClient::new(&TrackerConfig::default());
        let route = client
            .fetch_route((37.7749, -122.4194), (37.7849, -122.4094))
            .await
            .expect("route failed");
        assert!(route.distance > 0.0);
        assert!(!route.steps.is_empty());
    }
}
