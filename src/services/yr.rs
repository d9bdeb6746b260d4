//! yr.no Locationforecast 2.0 client.
//!
//! Fetches the full multi-day timeseries for a location, honouring the
//! conditional-request contract (`If-Modified-Since` / `Last-Modified`) and
//! surfacing the `Expires` header so the cache knows when to come back.
//! See: https://api.met.no/weatherapi/locationforecast/2.0/documentation

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, EXPIRES, IF_MODIFIED_SINCE, LAST_MODIFIED, USER_AGENT};
use reqwest::StatusCode;
use std::time::Duration;

use crate::config::YrConfig;
use crate::db::models::Checkpoint;
use crate::helpers::dec_to_f64;

const FORECAST_PATH: &str = "/weatherapi/locationforecast/2.0/complete";

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("yr.no request failed: {0}")]
    Transport(String),

    #[error("yr.no request timed out after {0:?}")]
    Timeout(Duration),

    #[error("yr.no returned HTTP {0}")]
    Status(u16),

    #[error("yr.no response is not a timeseries: {0}")]
    Decode(String),

    #[error("invalid request header: {0}")]
    InvalidHeader(String),
}

/// Where to ask the provider for a forecast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f64,
}

impl Location {
    pub fn of_checkpoint(cp: &Checkpoint) -> Self {
        Self {
            latitude: dec_to_f64(cp.latitude),
            longitude: dec_to_f64(cp.longitude),
            altitude_m: dec_to_f64(cp.elevation_m),
        }
    }

    /// Query string. yr.no's terms cap coordinates at 4 decimals.
    fn query(&self) -> String {
        format!(
            "lat={:.4}&lon={:.4}&altitude={:.0}",
            self.latitude, self.longitude, self.altitude_m
        )
    }
}

/// Outcome of a conditional fetch.
#[derive(Debug, Clone)]
pub enum UpstreamResponse {
    /// HTTP 200 with a full timeseries.
    NewData {
        payload: serde_json::Value,
        /// Parsed `Expires`; `None` when absent or unparseable.
        expires: Option<DateTime<Utc>>,
        /// `Last-Modified`, replayed as `If-Modified-Since` next time.
        validator: Option<String>,
    },
    /// HTTP 304. The cached payload is still current.
    NotModified {
        expires: Option<DateTime<Utc>>,
        validator: Option<String>,
    },
}

/// Source of upstream timeseries. Implemented by [`YrClient`]; tests plug in fakes.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    async fn fetch(
        &self,
        location: &Location,
        validator: Option<&str>,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

/// Client for the yr.no Locationforecast API.
#[derive(Debug, Clone)]
pub struct YrClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: HeaderValue,
    timeout: Duration,
}

impl YrClient {
    pub fn new(config: &YrConfig) -> Result<Self, UpstreamError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| UpstreamError::InvalidHeader(format!("User-Agent: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_agent,
            timeout,
        })
    }

    fn map_reqwest(&self, e: reqwest::Error) -> UpstreamError {
        if e.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl UpstreamProvider for YrClient {
    async fn fetch(
        &self,
        location: &Location,
        validator: Option<&str>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = format!("{}{}?{}", self.base_url, FORECAST_PATH, location.query());

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, self.user_agent.clone());
        if let Some(v) = validator {
            match HeaderValue::from_str(v) {
                Ok(val) => {
                    headers.insert(IF_MODIFIED_SINCE, val);
                }
                Err(_) => tracing::warn!(validator = v, "dropping unusable validator"),
            }
        }

        tracing::debug!(%url, conditional = validator.is_some(), "fetching yr.no timeseries");

        let response = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let status = response.status();
        let expires = header_str(response.headers(), EXPIRES.as_str()).and_then(|s| parse_http_date(&s));
        let last_modified = header_str(response.headers(), LAST_MODIFIED.as_str());

        if status == StatusCode::NOT_MODIFIED {
            return Ok(UpstreamResponse::NotModified {
                expires,
                validator: last_modified,
            });
        }
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| self.map_reqwest(e))?;
        let payload: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| UpstreamError::Decode(e.to_string()))?;
        if !payload
            .pointer("/properties/timeseries")
            .is_some_and(serde_json::Value::is_array)
        {
            return Err(UpstreamError::Decode(
                "missing properties.timeseries".to_string(),
            ));
        }

        Ok(UpstreamResponse::NewData {
            payload,
            expires,
            validator: last_modified,
        })
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Parse an HTTP date (`Expires`, `Last-Modified`).
///
/// Accepts RFC 2822 plus the three HTTP-date forms: IMF-fixdate, RFC 850 and
/// asctime. Returns `None` and logs when nothing matches.
pub fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }

    const FORMATS: [&str; 3] = [
        "%a, %d %b %Y %H:%M:%S GMT",
        "%A, %d-%b-%y %H:%M:%S GMT",
        "%a %b %e %H:%M:%S %Y",
    ];
    let parsed = FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| dt.and_utc());

    if parsed.is_none() {
        tracing::warn!(value = s, "unparseable HTTP date header");
    }
    parsed
}
