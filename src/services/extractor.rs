//! Pure extraction of a single forecast sample from a cached yr.no timeseries.
//!
//! yr.no publishes hourly samples for roughly the first 2.5 days and six-hourly
//! samples after that. A sample is only served when it lies within the
//! tolerance of its own tier: 1 h for hourly, 3 h for six-hourly. Beyond that
//! the forecast is reported as unavailable rather than stretched.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    #[error("timeseries structure error: {0}")]
    Structure(String),

    #[error("timeseries has no usable entries")]
    Empty,
}

/// Sampling tier of a timeseries entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Hourly,
    SixHourly,
}

impl Resolution {
    /// Largest accepted distance between the requested instant and the sample.
    pub fn tolerance(self) -> Duration {
        match self {
            Resolution::Hourly => Duration::hours(1),
            Resolution::SixHourly => Duration::hours(3),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Hourly => "hourly",
            Resolution::SixHourly => "six_hourly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PrecipitationType {
    None,
    Snow,
    Sleet,
    Rain,
}

impl PrecipitationType {
    pub fn as_str(self) -> &'static str {
        match self {
            PrecipitationType::None => "none",
            PrecipitationType::Snow => "snow",
            PrecipitationType::Sleet => "sleet",
            PrecipitationType::Rain => "rain",
        }
    }
}

/// One timeseries entry with derived fields, in provider units.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedSample {
    /// Native sample instant, never the requested instant.
    pub forecast_time: DateTime<Utc>,
    pub resolution: Resolution,
    pub temperature_c: f64,
    pub temperature_percentile_10_c: Option<f64>,
    pub temperature_percentile_90_c: Option<f64>,
    pub wind_speed_ms: f64,
    pub wind_speed_percentile_10_ms: Option<f64>,
    pub wind_speed_percentile_90_ms: Option<f64>,
    pub wind_direction_deg: f64,
    pub wind_gust_ms: Option<f64>,
    pub precipitation_mm: f64,
    pub precipitation_min_mm: Option<f64>,
    pub precipitation_max_mm: Option<f64>,
    pub humidity_pct: f64,
    pub dew_point_c: Option<f64>,
    pub cloud_cover_pct: Option<f64>,
    pub uv_index: Option<f64>,
    pub symbol_code: String,
    pub feels_like_c: f64,
    pub precipitation_type: PrecipitationType,
    pub snow_temperature_c: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Available(ExtractedSample),
    /// Nearest sample is outside its tier's tolerance, or the series is exhausted.
    Unavailable,
}

impl Extraction {
    pub fn into_sample(self) -> Option<ExtractedSample> {
        match self {
            Extraction::Available(s) => Some(s),
            Extraction::Unavailable => None,
        }
    }
}

/// Result of extracting several instants from one payload.
#[derive(Debug, Clone)]
pub struct BatchExtraction {
    /// One entry per requested instant, in request order.
    pub samples: Vec<Extraction>,
    /// Last sample instant in the series.
    pub horizon: DateTime<Utc>,
    /// Upstream model run (`properties.meta.updated_at`), if disclosed.
    pub model_run_at: Option<DateTime<Utc>>,
}

// --- yr.no JSON response types ---

#[derive(Debug, Deserialize)]
struct YrResponse {
    properties: YrProperties,
}

#[derive(Debug, Deserialize)]
struct YrProperties {
    meta: Option<YrMeta>,
    timeseries: Vec<YrTimeseries>,
}

#[derive(Debug, Deserialize)]
struct YrMeta {
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YrTimeseries {
    time: String,
    data: YrData,
}

#[derive(Debug, Deserialize)]
struct YrData {
    instant: YrInstant,
    next_1_hours: Option<YrPeriod>,
    next_6_hours: Option<YrPeriod>,
}

#[derive(Debug, Deserialize)]
struct YrInstant {
    details: YrInstantDetails,
}

#[derive(Debug, Deserialize)]
struct YrInstantDetails {
    air_temperature: Option<f64>,
    air_temperature_percentile_10: Option<f64>,
    air_temperature_percentile_90: Option<f64>,
    wind_speed: Option<f64>,
    wind_speed_percentile_10: Option<f64>,
    wind_speed_percentile_90: Option<f64>,
    wind_from_direction: Option<f64>,
    wind_speed_of_gust: Option<f64>,
    relative_humidity: Option<f64>,
    dew_point_temperature: Option<f64>,
    cloud_area_fraction: Option<f64>,
    ultraviolet_index_clear_sky: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct YrPeriod {
    summary: Option<YrSummary>,
    details: Option<YrPeriodDetails>,
}

#[derive(Debug, Deserialize)]
struct YrSummary {
    symbol_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YrPeriodDetails {
    precipitation_amount: Option<f64>,
    precipitation_amount_min: Option<f64>,
    precipitation_amount_max: Option<f64>,
}

/// A parsed timeseries. Build once, query many times.
pub struct Timeseries {
    entries: Vec<(DateTime<Utc>, YrData)>,
    model_run_at: Option<DateTime<Utc>>,
}

impl Timeseries {
    pub fn parse(payload: &serde_json::Value) -> Result<Self, DecodeError> {
        let response = YrResponse::deserialize(payload)
            .map_err(|e| DecodeError::Structure(e.to_string()))?;

        let model_run_at = response
            .properties
            .meta
            .and_then(|m| m.updated_at)
            .and_then(|s| parse_instant(&s));

        let mut entries: Vec<(DateTime<Utc>, YrData)> = response
            .properties
            .timeseries
            .into_iter()
            .filter_map(|ts| match parse_instant(&ts.time) {
                Some(t) => Some((t, ts.data)),
                None => {
                    tracing::warn!(time = %ts.time, "skipping timeseries entry with bad timestamp");
                    None
                }
            })
            .collect();

        if entries.is_empty() {
            return Err(DecodeError::Empty);
        }
        entries.sort_by_key(|(t, _)| *t);

        Ok(Self {
            entries,
            model_run_at,
        })
    }

    pub fn model_run_at(&self) -> Option<DateTime<Utc>> {
        self.model_run_at
    }

    /// Instant of the last sample.
    pub fn horizon(&self) -> DateTime<Utc> {
        // `parse` rejects empty series
        self.entries
            .last()
            .map(|(t, _)| *t)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Nearest sample to `target` if within its tier's tolerance.
    pub fn extract(&self, target: DateTime<Utc>) -> Extraction {
        // Entries are sorted, so the first minimum is the earlier sample on a tie.
        let Some((time, data)) = self
            .entries
            .iter()
            .min_by_key(|(t, _)| (*t - target).num_milliseconds().unsigned_abs())
        else {
            return Extraction::Unavailable;
        };

        let resolution = if data.next_1_hours.is_some() {
            Resolution::Hourly
        } else {
            Resolution::SixHourly
        };
        let delta = (*time - target).abs();
        if delta > resolution.tolerance() {
            tracing::debug!(
                %target,
                nearest = %time,
                delta_secs = delta.num_seconds(),
                resolution = resolution.as_str(),
                "nearest sample outside tolerance"
            );
            return Extraction::Unavailable;
        }

        Extraction::Available(to_sample(*time, resolution, data))
    }
}

/// Extract several instants from a raw payload, parsing it once.
pub fn extract_many(
    payload: &serde_json::Value,
    targets: &[DateTime<Utc>],
) -> Result<BatchExtraction, DecodeError> {
    let series = Timeseries::parse(payload)?;
    Ok(BatchExtraction {
        samples: targets.iter().map(|t| series.extract(*t)).collect(),
        horizon: series.horizon(),
        model_run_at: series.model_run_at(),
    })
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn to_sample(time: DateTime<Utc>, resolution: Resolution, data: &YrData) -> ExtractedSample {
    let d = &data.instant.details;
    let period = match resolution {
        Resolution::Hourly => data.next_1_hours.as_ref(),
        Resolution::SixHourly => data.next_6_hours.as_ref(),
    };
    let symbol_code = period
        .and_then(|p| p.summary.as_ref())
        .and_then(|s| s.symbol_code.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let precip = period.and_then(|p| p.details.as_ref());

    let temperature_c = d.air_temperature.unwrap_or(0.0);
    let wind_speed_ms = d.wind_speed.unwrap_or(0.0);
    let precipitation_mm = precip.and_then(|p| p.precipitation_amount).unwrap_or(0.0);

    let snow_temperature_c = match (
        d.air_temperature,
        d.dew_point_temperature,
        d.cloud_area_fraction,
        d.wind_speed,
    ) {
        (Some(t), Some(td), Some(cloud), Some(wind)) => {
            Some(snow_surface_temperature(t, td, cloud, wind))
        }
        _ => None,
    };

    ExtractedSample {
        forecast_time: time,
        resolution,
        temperature_c,
        temperature_percentile_10_c: d.air_temperature_percentile_10,
        temperature_percentile_90_c: d.air_temperature_percentile_90,
        wind_speed_ms,
        wind_speed_percentile_10_ms: d.wind_speed_percentile_10,
        wind_speed_percentile_90_ms: d.wind_speed_percentile_90,
        wind_direction_deg: d.wind_from_direction.unwrap_or(0.0),
        wind_gust_ms: d.wind_speed_of_gust,
        precipitation_mm,
        precipitation_min_mm: precip.and_then(|p| p.precipitation_amount_min),
        precipitation_max_mm: precip.and_then(|p| p.precipitation_amount_max),
        humidity_pct: d.relative_humidity.unwrap_or(0.0),
        dew_point_c: d.dew_point_temperature,
        cloud_cover_pct: d.cloud_area_fraction,
        uv_index: d.ultraviolet_index_clear_sky,
        feels_like_c: feels_like(temperature_c, wind_speed_ms),
        precipitation_type: precipitation_type(&symbol_code, temperature_c, precipitation_mm),
        snow_temperature_c,
        symbol_code,
    }
}

// --- derived fields ---

/// North American wind-chill index (Environment Canada / NWS).
///
/// Defined only for T <= 10 °C and wind >= 4.8 km/h; outside that range the
/// air temperature is returned unchanged.
pub fn feels_like(temperature_c: f64, wind_speed_ms: f64) -> f64 {
    let wind_kmh = wind_speed_ms * 3.6;
    if temperature_c > 10.0 || wind_kmh < 4.8 {
        return temperature_c;
    }
    let v = wind_kmh.powf(0.16);
    13.12 + 0.6215 * temperature_c - 11.37 * v + 0.3965 * temperature_c * v
}

/// Precipitation type from the symbol code, falling back to temperature bands.
pub fn precipitation_type(
    symbol_code: &str,
    temperature_c: f64,
    precipitation_mm: f64,
) -> PrecipitationType {
    if precipitation_mm <= 0.0 {
        return PrecipitationType::None;
    }

    let code = symbol_code.to_lowercase();
    if code.contains("snow") {
        PrecipitationType::Snow
    } else if code.contains("sleet") {
        PrecipitationType::Sleet
    } else if code.contains("rain") || code.contains("drizzle") {
        PrecipitationType::Rain
    } else if temperature_c < 0.0 {
        PrecipitationType::Snow
    } else if temperature_c <= 2.0 {
        PrecipitationType::Sleet
    } else {
        PrecipitationType::Rain
    }
}

/// Estimated snow surface temperature, for wax selection.
///
/// Starts from `min(T_air, T_dew)` and subtracts a clear-sky radiative offset
/// of up to 3 °C, scaled by the clear fraction of the sky and damped by wind.
/// Snow cannot be warmer than its melting point, so the result is capped at 0.
pub fn snow_surface_temperature(
    temperature_c: f64,
    dew_point_c: f64,
    cloud_cover_pct: f64,
    wind_speed_ms: f64,
) -> f64 {
    let base = temperature_c.min(dew_point_c);
    let clear_sky = 1.0 - (cloud_cover_pct / 100.0).clamp(0.0, 1.0);
    let wind_damping = 1.0 / (1.0 + wind_speed_ms / 5.0);
    (base - clear_sky * 3.0 * wind_damping).min(0.0)
}
