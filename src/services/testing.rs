//! Test doubles for the upstream provider and yr.no payload builders.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::helpers::floor_to_hour;
use crate::services::yr::{Location, UpstreamError, UpstreamProvider, UpstreamResponse};

/// Hourly entries for `hours` hours from the hour of `from`, then six-hourly
/// entries out to `days` days.
pub fn payload(from: DateTime<Utc>, hours: i64, days: i64, model_run: DateTime<Utc>) -> serde_json::Value {
    let start = floor_to_hour(from);
    let mut entries = Vec::new();
    for h in 0..hours {
        let t = start + Duration::hours(h);
        entries.push(json!({
            "time": t.to_rfc3339(),
            "data": {
                "instant": { "details": {
                    "air_temperature": -5.0 + h as f64 * 0.1,
                    "wind_speed": 3.0,
                    "wind_from_direction": 200.0,
                    "relative_humidity": 80.0,
                    "dew_point_temperature": -8.0,
                    "cloud_area_fraction": 40.0
                }},
                "next_1_hours": {
                    "summary": { "symbol_code": "cloudy" },
                    "details": { "precipitation_amount": 0.0 }
                }
            }
        }));
    }
    let mut t = start + Duration::hours(hours);
    let end = start + Duration::days(days);
    while t <= end {
        entries.push(json!({
            "time": t.to_rfc3339(),
            "data": {
                "instant": { "details": {
                    "air_temperature": -2.0,
                    "wind_speed": 4.0,
                    "wind_from_direction": 220.0,
                    "relative_humidity": 70.0
                }},
                "next_6_hours": {
                    "summary": { "symbol_code": "snow" },
                    "details": { "precipitation_amount": 1.0 }
                }
            }
        }));
        t += Duration::hours(6);
    }
    json!({
        "type": "Feature",
        "properties": {
            "meta": { "updated_at": model_run.to_rfc3339() },
            "timeseries": entries
        }
    })
}

pub fn new_data(payload: serde_json::Value, expires: DateTime<Utc>, validator: &str) -> UpstreamResponse {
    UpstreamResponse::NewData {
        payload,
        expires: Some(expires),
        validator: Some(validator.to_string()),
    }
}

pub fn not_modified() -> UpstreamResponse {
    UpstreamResponse::NotModified {
        expires: None,
        validator: None,
    }
}

/// Replays queued responses in order; records the validator of every call.
/// An empty queue answers with a transport error.
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<Result<UpstreamResponse, UpstreamError>>>,
    validators: Mutex<Vec<Option<String>>>,
    calls: AtomicUsize,
    delay: Option<std::time::Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(delay: std::time::Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn push(&self, response: Result<UpstreamResponse, UpstreamError>) -> &Self {
        self.responses.lock().unwrap().push_back(response);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn validators(&self) -> Vec<Option<String>> {
        self.validators.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamProvider for ScriptedProvider {
    async fn fetch(
        &self,
        _location: &Location,
        validator: Option<&str>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.validators
            .lock()
            .unwrap()
            .push(validator.map(str::to_string));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(UpstreamError::Transport("connection refused".to_string())))
    }
}
