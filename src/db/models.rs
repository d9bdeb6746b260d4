use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

/// Race summary. Owned by the seeding pipeline; read-only here.
#[derive(Debug, Clone, FromRow)]
pub struct Race {
    pub id: Uuid,
    pub name: String,
    pub year: i32,
    pub start_time: DateTime<Utc>,
    pub distance_km: Decimal,
}

/// A checkpoint along a race course. Read-only here.
#[derive(Debug, Clone, FromRow)]
pub struct Checkpoint {
    pub id: Uuid,
    pub race_id: Uuid,
    pub name: String,
    pub distance_km: Decimal,
    pub latitude: Decimal,
    pub longitude: Decimal,
    pub elevation_m: Decimal,
    pub sort_order: i32,
}

/// Latest full yr.no timeseries for one checkpoint (`yr_responses`).
///
/// One row per checkpoint; a successful refetch replaces it wholesale.
#[derive(Debug, Clone, FromRow)]
pub struct UpstreamSnapshot {
    pub id: Uuid,
    pub checkpoint_id: Uuid,
    pub latitude: Decimal,
    pub longitude: Decimal,
    pub elevation_m: Decimal,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// `Last-Modified` of the stored payload, replayed as `If-Modified-Since`.
    pub last_modified: Option<String>,
    pub raw_response: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Fields written when a snapshot is replaced.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub checkpoint_id: Uuid,
    pub latitude: Decimal,
    pub longitude: Decimal,
    pub elevation_m: Decimal,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_modified: Option<String>,
    pub raw_response: serde_json::Value,
}

/// One captured version of a forecast slot (`forecasts`, append-only).
#[derive(Debug, Clone, FromRow)]
pub struct ForecastObservation {
    pub id: Uuid,
    pub checkpoint_id: Uuid,
    /// Native yr.no slot, never a pacing-derived instant.
    pub forecast_time: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub source: String,
    /// "hourly" or "six_hourly".
    pub resolution: String,

    pub temperature_c: Decimal,
    pub temperature_percentile_10_c: Option<Decimal>,
    pub temperature_percentile_90_c: Option<Decimal>,
    pub wind_speed_ms: Decimal,
    pub wind_speed_percentile_10_ms: Option<Decimal>,
    pub wind_speed_percentile_90_ms: Option<Decimal>,
    pub wind_direction_deg: Decimal,
    pub wind_gust_ms: Option<Decimal>,
    pub precipitation_mm: Decimal,
    pub precipitation_min_mm: Option<Decimal>,
    pub precipitation_max_mm: Option<Decimal>,
    pub humidity_pct: Decimal,
    pub dew_point_c: Option<Decimal>,
    pub cloud_cover_pct: Option<Decimal>,
    pub uv_index: Option<Decimal>,
    pub symbol_code: String,

    pub feels_like_c: Decimal,
    pub precipitation_type: String,
    pub snow_temperature_c: Option<Decimal>,

    /// When yr.no's model produced the data. Not always disclosed.
    pub yr_model_run_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl ForecastObservation {
    /// Model run if known, otherwise the capture instant.
    pub fn effective_run_at(&self) -> DateTime<Utc> {
        self.yr_model_run_at.unwrap_or(self.fetched_at)
    }
}

/// An extracted sample ready for the history table.
#[derive(Debug, Clone)]
pub struct NewObservation {
    pub checkpoint_id: Uuid,
    pub forecast_time: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub source: String,
    pub resolution: String,
    pub temperature_c: Decimal,
    pub temperature_percentile_10_c: Option<Decimal>,
    pub temperature_percentile_90_c: Option<Decimal>,
    pub wind_speed_ms: Decimal,
    pub wind_speed_percentile_10_ms: Option<Decimal>,
    pub wind_speed_percentile_90_ms: Option<Decimal>,
    pub wind_direction_deg: Decimal,
    pub wind_gust_ms: Option<Decimal>,
    pub precipitation_mm: Decimal,
    pub precipitation_min_mm: Option<Decimal>,
    pub precipitation_max_mm: Option<Decimal>,
    pub humidity_pct: Decimal,
    pub dew_point_c: Option<Decimal>,
    pub cloud_cover_pct: Option<Decimal>,
    pub uv_index: Option<Decimal>,
    pub symbol_code: String,
    pub feels_like_c: Decimal,
    pub precipitation_type: String,
    pub snow_temperature_c: Option<Decimal>,
    pub yr_model_run_at: Option<DateTime<Utc>>,
}
