//! Forecast HTTP endpoints.
//!
//! - GET /api/v1/forecasts/checkpoint/:checkpoint_id?datetime=ISO8601
//! - GET /api/v1/forecasts/checkpoint/:checkpoint_id?target_duration_hours=N
//! - GET /api/v1/forecasts/checkpoint/:checkpoint_id/history?datetime=ISO8601
//! - GET /api/v1/forecasts/race/:race_id?target_duration_hours=N

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::db::models::ForecastObservation;
use crate::errors::{AppError, ErrorResponse};
use crate::helpers::{dec_to_f64, opt_dec_to_f64, opt_weather_decimal, weather_decimal};
use crate::services::extractor::ExtractedSample;
use crate::services::forecast::{CheckpointForecast, ForecastService};
use crate::services::history::SOURCE_YR;

/// Set to `true` on responses served from an expired snapshot.
pub const STALE_HEADER: &str = "x-forecast-stale";

/// Shared application state for forecast endpoints.
#[derive(Clone)]
pub struct AppState {
    pub service: ForecastService,
}

// ---------------------------------------------------------------------------
// Query parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct ForecastQuery {
    /// Target datetime in ISO 8601 format (e.g. "2026-03-01T08:00:00Z")
    pub datetime: Option<String>,
    /// Target finish duration in hours; the checkpoint's expected arrival is
    /// used as the target datetime. Mutually exclusive with `datetime`.
    pub target_duration_hours: Option<f64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Target datetime in ISO 8601 format (e.g. "2026-03-01T08:00:00Z")
    pub datetime: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RaceForecastQuery {
    /// Target race duration in hours (e.g. 8.0 for an 8-hour finish)
    pub target_duration_hours: f64,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Weather at one yr.no sample instant.
///
/// Detail-only fields (wind gusts, humidity, dew point, cloud cover, UV) are
/// omitted from the race overview via `skip_serializing_if`.
#[derive(Debug, Serialize, ToSchema)]
pub struct Weather {
    /// "hourly" or "six_hourly"
    pub resolution: String,
    /// Air temperature in Celsius
    pub temperature_c: f64,
    /// 10th percentile temperature (uncertainty low bound)
    pub temperature_percentile_10_c: Option<f64>,
    /// 90th percentile temperature (uncertainty high bound)
    pub temperature_percentile_90_c: Option<f64>,
    /// Feels-like temperature (wind chill adjusted) in Celsius
    pub feels_like_c: f64,
    /// Estimated snow surface temperature in Celsius (for wax selection)
    pub snow_temperature_c: Option<f64>,
    /// Wind speed in metres per second
    pub wind_speed_ms: f64,
    pub wind_speed_percentile_10_ms: Option<f64>,
    pub wind_speed_percentile_90_ms: Option<f64>,
    /// Wind direction in degrees (0 = north, 90 = east)
    pub wind_direction_deg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_gust_ms: Option<f64>,
    /// Precipitation over the sample's period in mm
    pub precipitation_mm: f64,
    pub precipitation_min_mm: Option<f64>,
    pub precipitation_max_mm: Option<f64>,
    /// "snow", "rain", "sleet", or "none"
    pub precipitation_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dew_point_c: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_cover_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uv_index: Option<f64>,
    /// yr.no weather symbol code (e.g. "cloudy", "lightssnowshowers_day")
    pub symbol_code: String,
}

fn round1(v: f64) -> f64 {
    dec_to_f64(weather_decimal(v))
}

fn opt_round1(v: Option<f64>) -> Option<f64> {
    opt_dec_to_f64(opt_weather_decimal(v))
}

impl Weather {
    /// Full weather for the checkpoint detail view.
    pub fn full(s: &ExtractedSample) -> Self {
        Self {
            resolution: s.resolution.as_str().to_string(),
            temperature_c: round1(s.temperature_c),
            temperature_percentile_10_c: opt_round1(s.temperature_percentile_10_c),
            temperature_percentile_90_c: opt_round1(s.temperature_percentile_90_c),
            feels_like_c: round1(s.feels_like_c),
            snow_temperature_c: opt_round1(s.snow_temperature_c),
            wind_speed_ms: round1(s.wind_speed_ms),
            wind_speed_percentile_10_ms: opt_round1(s.wind_speed_percentile_10_ms),
            wind_speed_percentile_90_ms: opt_round1(s.wind_speed_percentile_90_ms),
            wind_direction_deg: round1(s.wind_direction_deg),
            wind_gust_ms: opt_round1(s.wind_gust_ms),
            precipitation_mm: round1(s.precipitation_mm),
            precipitation_min_mm: opt_round1(s.precipitation_min_mm),
            precipitation_max_mm: opt_round1(s.precipitation_max_mm),
            precipitation_type: s.precipitation_type.as_str().to_string(),
            humidity_pct: Some(round1(s.humidity_pct)),
            dew_point_c: opt_round1(s.dew_point_c),
            cloud_cover_pct: opt_round1(s.cloud_cover_pct),
            uv_index: opt_round1(s.uv_index),
            symbol_code: s.symbol_code.clone(),
        }
    }

    /// Race overview: detail-only fields dropped.
    pub fn simplified(s: &ExtractedSample) -> Self {
        Self {
            wind_gust_ms: None,
            humidity_pct: None,
            dew_point_c: None,
            cloud_cover_pct: None,
            uv_index: None,
            ..Self::full(s)
        }
    }

    /// A stored history row.
    pub fn recorded(o: &ForecastObservation) -> Self {
        Self {
            resolution: o.resolution.clone(),
            temperature_c: dec_to_f64(o.temperature_c),
            temperature_percentile_10_c: opt_dec_to_f64(o.temperature_percentile_10_c),
            temperature_percentile_90_c: opt_dec_to_f64(o.temperature_percentile_90_c),
            feels_like_c: dec_to_f64(o.feels_like_c),
            snow_temperature_c: opt_dec_to_f64(o.snow_temperature_c),
            wind_speed_ms: dec_to_f64(o.wind_speed_ms),
            wind_speed_percentile_10_ms: opt_dec_to_f64(o.wind_speed_percentile_10_ms),
            wind_speed_percentile_90_ms: opt_dec_to_f64(o.wind_speed_percentile_90_ms),
            wind_direction_deg: dec_to_f64(o.wind_direction_deg),
            wind_gust_ms: opt_dec_to_f64(o.wind_gust_ms),
            precipitation_mm: dec_to_f64(o.precipitation_mm),
            precipitation_min_mm: opt_dec_to_f64(o.precipitation_min_mm),
            precipitation_max_mm: opt_dec_to_f64(o.precipitation_max_mm),
            precipitation_type: o.precipitation_type.clone(),
            humidity_pct: Some(dec_to_f64(o.humidity_pct)),
            dew_point_c: opt_dec_to_f64(o.dew_point_c),
            cloud_cover_pct: opt_dec_to_f64(o.cloud_cover_pct),
            uv_index: opt_dec_to_f64(o.uv_index),
            symbol_code: o.symbol_code.clone(),
        }
    }
}

/// Checkpoint forecast response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ForecastResponse {
    pub checkpoint_id: Uuid,
    pub checkpoint_name: String,
    /// The instant that was asked for (explicit or pacing-derived), ISO 8601.
    pub requested_time: String,
    /// Native yr.no sample instant the weather belongs to.
    /// Null when `forecast_available` is false.
    pub forecast_time: Option<String>,
    /// `false` when no sample lies within tolerance of `requested_time`,
    /// e.g. beyond yr.no's forecast horizon.
    pub forecast_available: bool,
    /// Forecast data source (e.g. "yr.no").
    pub source: String,
    /// Served from an expired snapshot because yr.no was unreachable.
    pub stale: bool,
    /// When the underlying yr.no payload was fetched (ISO 8601).
    pub fetched_at: String,
    /// When yr.no's weather model generated this forecast (ISO 8601).
    pub model_run_at: Option<String>,
    /// The furthest datetime yr.no currently forecasts to (ISO 8601).
    pub forecast_horizon: String,
    /// Full weather data. Null when `forecast_available` is false.
    pub weather: Option<Weather>,
}

impl From<&CheckpointForecast> for ForecastResponse {
    fn from(f: &CheckpointForecast) -> Self {
        Self {
            checkpoint_id: f.checkpoint.id,
            checkpoint_name: f.checkpoint.name.clone(),
            requested_time: f.requested_time.to_rfc3339(),
            forecast_time: f.sample.as_ref().map(|s| s.forecast_time.to_rfc3339()),
            forecast_available: f.sample.is_some(),
            source: SOURCE_YR.to_string(),
            stale: f.stale,
            fetched_at: f.fetched_at.to_rfc3339(),
            model_run_at: f.model_run_at.map(|dt| dt.to_rfc3339()),
            forecast_horizon: f.horizon.to_rfc3339(),
            weather: f.sample.as_ref().map(Weather::full),
        }
    }
}

/// One model-run version of a forecast slot.
#[derive(Debug, Serialize, ToSchema)]
pub struct ForecastHistoryEntry {
    /// When this version was captured (ISO 8601)
    pub fetched_at: String,
    /// When yr.no's weather model generated this version, if disclosed.
    pub yr_model_run_at: Option<String>,
    /// `yr_model_run_at` if known, otherwise `fetched_at`.
    /// Always populated; use this as the X-axis in history charts.
    pub model_run_at: String,
    pub weather: Weather,
}

/// How the forecast for one slot evolved across model runs.
#[derive(Debug, Serialize, ToSchema)]
pub struct ForecastHistoryResponse {
    pub checkpoint_id: Uuid,
    pub checkpoint_name: String,
    pub requested_time: String,
    /// The stored sample instant nearest the request; null when nothing is recorded.
    pub forecast_time: Option<String>,
    /// Oldest model run first.
    pub history: Vec<ForecastHistoryEntry>,
}

/// A checkpoint with its expected weather in the race forecast.
#[derive(Debug, Serialize, ToSchema)]
pub struct RaceForecastCheckpoint {
    pub checkpoint_id: Uuid,
    pub name: String,
    /// Distance from race start in km
    pub distance_km: f64,
    /// Expected pass-through time based on elevation-adjusted pacing (ISO 8601)
    pub expected_time: String,
    /// Native yr.no sample instant, null when `forecast_available` is false.
    pub forecast_time: Option<String>,
    pub forecast_available: bool,
    pub stale: bool,
    /// Simplified weather at expected pass-through time.
    pub weather: Option<Weather>,
}

/// Race forecast with weather at every checkpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct RaceForecastResponse {
    pub race_id: Uuid,
    pub race_name: String,
    /// Target duration used for pacing calculation
    pub target_duration_hours: f64,
    /// True if any checkpoint was served from an expired snapshot.
    pub stale: bool,
    /// Oldest model run across checkpoints with a forecast (ISO 8601).
    pub model_run_at: Option<String>,
    /// Earliest horizon across all checkpoints (ISO 8601).
    pub forecast_horizon: Option<String>,
    /// In course order.
    pub checkpoints: Vec<RaceForecastCheckpoint>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, AppError> {
    raw.parse()
        .map_err(|e| AppError::BadRequest(format!("Invalid datetime '{}': {}", raw, e)))
}

fn stale_headers(stale: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if stale {
        headers.insert(
            HeaderName::from_static(STALE_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    headers
}

/// Get the forecast for a checkpoint at a datetime or a target finish time.
///
/// Exactly one of `datetime` and `target_duration_hours` must be given. If
/// yr.no is unreachable and a cached timeseries exists, that is served with
/// the `X-Forecast-Stale: true` header.
#[utoipa::path(
    get,
    path = "/api/v1/forecasts/checkpoint/{checkpoint_id}",
    tag = "Forecasts",
    params(
        ("checkpoint_id" = Uuid, Path, description = "Checkpoint UUID"),
        ForecastQuery,
    ),
    responses(
        (status = 200, description = "Forecast for the checkpoint", body = ForecastResponse,
         headers(
             ("X-Forecast-Stale" = String, description = "Set to 'true' when serving cached data because yr.no is unreachable")
         )),
        (status = 400, description = "Invalid or missing query parameters", body = ErrorResponse),
        (status = 404, description = "Checkpoint not found", body = ErrorResponse),
        (status = 502, description = "yr.no unreachable and nothing cached, or unreadable payload", body = ErrorResponse),
    )
)]
pub async fn get_checkpoint_forecast(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<Uuid>,
    Query(params): Query<ForecastQuery>,
) -> Result<(HeaderMap, Json<ForecastResponse>), AppError> {
    let forecast = match (params.datetime.as_deref(), params.target_duration_hours) {
        (Some(raw), None) => {
            let at = parse_datetime(raw)?;
            state.service.resolve_checkpoint(checkpoint_id, at).await?
        }
        (None, Some(hours)) => {
            state
                .service
                .resolve_at_duration(checkpoint_id, hours)
                .await?
        }
        (Some(_), Some(_)) => {
            return Err(AppError::BadRequest(
                "Specify either datetime or target_duration_hours, not both".to_string(),
            ))
        }
        (None, None) => {
            return Err(AppError::BadRequest(
                "One of datetime or target_duration_hours is required".to_string(),
            ))
        }
    };

    Ok((
        stale_headers(forecast.stale),
        Json(ForecastResponse::from(&forecast)),
    ))
}

/// Get the forecast history for a checkpoint, showing how predictions evolved.
///
/// Snaps to the recorded sample instant nearest `datetime` and returns one
/// entry per yr.no model run, oldest first.
#[utoipa::path(
    get,
    path = "/api/v1/forecasts/checkpoint/{checkpoint_id}/history",
    tag = "Forecasts",
    params(
        ("checkpoint_id" = Uuid, Path, description = "Checkpoint UUID"),
        HistoryQuery,
    ),
    responses(
        (status = 200, description = "Forecast history for the checkpoint", body = ForecastHistoryResponse),
        (status = 400, description = "Invalid datetime format", body = ErrorResponse),
        (status = 404, description = "Checkpoint not found", body = ErrorResponse),
    )
)]
pub async fn get_checkpoint_forecast_history(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<Uuid>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<ForecastHistoryResponse>, AppError> {
    let near = parse_datetime(&params.datetime)?;
    let history = state.service.history(checkpoint_id, near).await?;

    let entries = history
        .entries
        .iter()
        .map(|o| ForecastHistoryEntry {
            fetched_at: o.fetched_at.to_rfc3339(),
            yr_model_run_at: o.yr_model_run_at.map(|dt| dt.to_rfc3339()),
            model_run_at: o.effective_run_at().to_rfc3339(),
            weather: Weather::recorded(o),
        })
        .collect();

    Ok(Json(ForecastHistoryResponse {
        checkpoint_id: history.checkpoint.id,
        checkpoint_name: history.checkpoint.name.clone(),
        requested_time: history.requested_time.to_rfc3339(),
        forecast_time: history.forecast_time().map(|dt| dt.to_rfc3339()),
        history: entries,
    }))
}

/// Get weather forecasts for all checkpoints in a race.
///
/// Expected pass-through times come from elevation-adjusted pacing for the
/// target duration. Any checkpoint that cannot be resolved at all fails the
/// whole request.
#[utoipa::path(
    get,
    path = "/api/v1/forecasts/race/{race_id}",
    tag = "Forecasts",
    params(
        ("race_id" = Uuid, Path, description = "Race UUID"),
        RaceForecastQuery,
    ),
    responses(
        (status = 200, description = "Race forecast with weather at all checkpoints", body = RaceForecastResponse,
         headers(
             ("X-Forecast-Stale" = String, description = "Set to 'true' when serving cached data because yr.no is unreachable")
         )),
        (status = 400, description = "Invalid query parameters", body = ErrorResponse),
        (status = 404, description = "Race not found", body = ErrorResponse),
        (status = 502, description = "yr.no unreachable and nothing cached for a checkpoint", body = ErrorResponse),
    )
)]
pub async fn get_race_forecast(
    State(state): State<AppState>,
    Path(race_id): Path<Uuid>,
    Query(params): Query<RaceForecastQuery>,
) -> Result<(HeaderMap, Json<RaceForecastResponse>), AppError> {
    let race = state
        .service
        .resolve_race(race_id, params.target_duration_hours)
        .await?;

    let checkpoints = race
        .checkpoints
        .iter()
        .map(|c| RaceForecastCheckpoint {
            checkpoint_id: c.checkpoint.id,
            name: c.checkpoint.name.clone(),
            distance_km: dec_to_f64(c.checkpoint.distance_km),
            expected_time: c.requested_time.to_rfc3339(),
            forecast_time: c.sample.as_ref().map(|s| s.forecast_time.to_rfc3339()),
            forecast_available: c.sample.is_some(),
            stale: c.stale,
            weather: c.sample.as_ref().map(Weather::simplified),
        })
        .collect();

    let stale = race.stale();
    Ok((
        stale_headers(stale),
        Json(RaceForecastResponse {
            race_id: race.race.id,
            race_name: race.race.name.clone(),
            target_duration_hours: race.target_duration_hours,
            stale,
            model_run_at: race.model_run_at().map(|dt| dt.to_rfc3339()),
            forecast_horizon: race.horizon().map(|dt| dt.to_rfc3339()),
            checkpoints,
        }),
    ))
}
