//! Append-only forecast history.
//!
//! Every extracted sample is offered to the `forecasts` table. The table's
//! partial unique indexes make the write idempotent, so readers and the
//! poller can record the same sample concurrently without coordination.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::models::NewObservation;
use crate::db::{ObservationStore, StoreError};
use crate::helpers::{opt_weather_decimal, weather_decimal};
use crate::services::extractor::ExtractedSample;

pub const SOURCE_YR: &str = "yr.no";

/// Provenance of a sample: which fetch and which model run produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Provenance {
    pub fetched_at: DateTime<Utc>,
    pub model_run_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct HistoryWriter {
    store: Arc<dyn ObservationStore>,
}

impl HistoryWriter {
    pub fn new(store: Arc<dyn ObservationStore>) -> Self {
        Self { store }
    }

    /// Insert the sample unless an equivalent row exists.
    ///
    /// Returns `Ok(false)` on a dedup collision.
    pub async fn record(
        &self,
        checkpoint_id: Uuid,
        sample: &ExtractedSample,
        provenance: Provenance,
    ) -> Result<bool, StoreError> {
        let inserted = self
            .store
            .insert_if_absent(to_observation(checkpoint_id, sample, provenance))
            .await?;
        if !inserted {
            tracing::debug!(
                %checkpoint_id,
                forecast_time = %sample.forecast_time,
                model_run_at = ?provenance.model_run_at,
                "forecast already recorded"
            );
        }
        Ok(inserted)
    }

    /// Record every sample; failures are logged and counted, never returned.
    ///
    /// Returns the number of rows actually inserted.
    pub async fn record_best_effort(
        &self,
        checkpoint_id: Uuid,
        samples: &[ExtractedSample],
        provenance: Provenance,
    ) -> usize {
        let mut inserted = 0;
        for sample in samples {
            match self.record(checkpoint_id, sample, provenance).await {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(
                    %checkpoint_id,
                    forecast_time = %sample.forecast_time,
                    error = %e,
                    "failed to record forecast history"
                ),
            }
        }
        inserted
    }
}

fn to_observation(
    checkpoint_id: Uuid,
    s: &ExtractedSample,
    provenance: Provenance,
) -> NewObservation {
    NewObservation {
        checkpoint_id,
        forecast_time: s.forecast_time,
        fetched_at: provenance.fetched_at,
        source: SOURCE_YR.to_string(),
        resolution: s.resolution.as_str().to_string(),
        temperature_c: weather_decimal(s.temperature_c),
        temperature_percentile_10_c: opt_weather_decimal(s.temperature_percentile_10_c),
        temperature_percentile_90_c: opt_weather_decimal(s.temperature_percentile_90_c),
        wind_speed_ms: weather_decimal(s.wind_speed_ms),
        wind_speed_percentile_10_ms: opt_weather_decimal(s.wind_speed_percentile_10_ms),
        wind_speed_percentile_90_ms: opt_weather_decimal(s.wind_speed_percentile_90_ms),
        wind_direction_deg: weather_decimal(s.wind_direction_deg),
        wind_gust_ms: opt_weather_decimal(s.wind_gust_ms),
        precipitation_mm: weather_decimal(s.precipitation_mm),
        precipitation_min_mm: opt_weather_decimal(s.precipitation_min_mm),
        precipitation_max_mm: opt_weather_decimal(s.precipitation_max_mm),
        humidity_pct: weather_decimal(s.humidity_pct),
        dew_point_c: opt_weather_decimal(s.dew_point_c),
        cloud_cover_pct: opt_weather_decimal(s.cloud_cover_pct),
        uv_index: opt_weather_decimal(s.uv_index),
        symbol_code: s.symbol_code.clone(),
        feels_like_c: weather_decimal(s.feels_like_c),
        precipitation_type: s.precipitation_type.as_str().to_string(),
        snow_temperature_c: opt_weather_decimal(s.snow_temperature_c),
        yr_model_run_at: provenance.model_run_at,
    }
}
