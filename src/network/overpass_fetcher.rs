use super::area::{BoundingBox, StreetNetworkProvider};
use crate::config::TrackerConfig;
use crate::error::FetchError;
use std::time::{Duration, Instant};

/// Highway values that are not driveable streets
const EXCLUDED_HIGHWAYS: &str = "footway|cycleway|path|steps|pedestrian|track|service";

const MAX_RETRIES: u32 = 3;

/// Rate limiter for Overpass API requests
struct RateLimit {
    last_request: Option<Instant>,
    min_interval: Duration,
}

impl RateLimit {
    fn new(min_interval: Duration) -> Self {
        RateLimit {
            last_request: None,
            min_interval,
        }
    }

    fn wait_time(&self) -> Duration {
        match self.last_request {
            Some(last) => self.min_interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }
}

/// Overpass API client for fetching driveable streets
///
/// # Rate Limiting
/// - Minimum 1 second between requests
/// - HTTP 429 is reported as `RateLimited`, the caller decides when to retry
///
/// # Error Handling
/// - Network timeout: returned as `NetworkTimeout`
/// - Overpass query timeout: retry up to 3 times with exponential backoff (1s, 2s, 4s)
/// - Any other non-success status: `HttpError`
pub struct OverpassFetcher {
    client: reqwest::Client,
    base_url: String,
    timeout_secs: u64,
    rate_limit: RateLimit,
}

impl OverpassFetcher {
    pub fn new(config: &TrackerConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .user_agent(concat!("street-coverage/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        OverpassFetcher {
            client,
            base_url: config.overpass_url.clone(),
            timeout_secs: config.overpass_timeout_secs,
            rate_limit: RateLimit::new(Duration::from_secs(1)),
        }
    }

    /// Build the Overpass QL query for a bounding box
    ///
    /// # Query Format
    /// ```text
    /// [out:json][timeout:25];
    /// (
    ///   way["highway"]["highway"!~"footway|cycleway|..."](south,west,north,east);
    /// );
    /// out body;
    /// >;
    /// out skel qt;
    /// ```
    fn build_query(&self, bbox: &BoundingBox) -> String {
        format!(
            "[out:json][timeout:{}];\n\
            (\n  \
              way[\"highway\"][\"highway\"!~\"{}\"]\
              ({},{},{},{});\n\
            );\n\
            out body;\n\
            >;\n\
            out skel qt;",
            self.timeout_secs,
            EXCLUDED_HIGHWAYS,
            bbox.south,
            bbox.west,
            bbox.north,
            bbox.east
        )
    }

    async fn respect_rate_limit(&mut self) {
        let wait = self.rate_limit.wait_time();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.rate_limit.last_request = Some(Instant::now());
    }

    /// Fetch the raw Overpass JSON for a bounding box
    pub async fn fetch_bbox(&mut self, bbox: &BoundingBox) -> Result<String, FetchError> {
        for attempt in 0..MAX_RETRIES {
            self.respect_rate_limit().await;

            let query = self.build_query(bbox);
            let response = match self
                .client
                .post(&self.base_url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(query)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => return Err(FetchError::NetworkTimeout),
                Err(e) => return Err(FetchError::UnknownError(e.to_string())),
            };

            let status = response.status();
            if status.as_u16() == 429 {
                log::warn!("Rate limited by Overpass API");
                return Err(FetchError::RateLimited);
            }

            let body = response.text().await.map_err(|e| {
                FetchError::UnknownError(format!("Failed to read response: {}", e))
            })?;

            if is_query_timeout(status.as_u16(), &body) {
                let backoff = 1u64 << attempt;
                log::warn!(
                    "Overpass timeout on attempt {}/{}, retrying in {}s",
                    attempt + 1,
                    MAX_RETRIES,
                    backoff
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::HttpError(status.as_u16()));
            }

            log::debug!("Fetched {} bytes of street data for {:?}", body.len(), bbox);
            return Ok(body);
        }

        Err(FetchError::ProviderTimeout)
    }
}

/// Overpass reports query timeouts either as 504 or as a remark in a 200 body
fn is_query_timeout(status: u16, body: &str) -> bool {
    if status == 504 {
        return true;
    }
    let lower = body.to_ascii_lowercase();
    lower.contains("runtime error") && lower.contains("timed out")
}

impl StreetNetworkProvider for OverpassFetcher {
    async fn fetch_network(&mut self, bbox: &BoundingBox) -> Result<String, FetchError> {
        self.fetch_bbox(bbox).await
    }
}
