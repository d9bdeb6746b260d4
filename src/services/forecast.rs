//! Reader pipeline: pacing → fresh snapshot → extraction → history.
//!
//! Called by the HTTP layer. The history write is detached from the request so
//! a slow or failing insert never delays or fails a read.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::models::{Checkpoint, ForecastObservation, Race};
use crate::db::{ObservationStore, RaceCatalog};
use crate::services::extractor::{ExtractedSample, Timeseries};
use crate::services::freshness::CacheFreshnessManager;
use crate::services::history::{HistoryWriter, Provenance};
use crate::services::pacing::PacingModel;
use crate::services::ForecastError;

/// Upper bound on `target_duration_hours` (3 days).
pub const MAX_TARGET_DURATION_HOURS: f64 = 72.0;

/// Concurrent checkpoint resolutions per race request.
const RACE_FAN_OUT: usize = 4;

/// History lookups snap to the nearest stored slot within this window.
const HISTORY_WINDOW_HOURS: i64 = 3;

const HISTORY_LIMIT: i64 = 200;

/// Forecast for one checkpoint at one requested instant.
#[derive(Debug, Clone)]
pub struct CheckpointForecast {
    pub checkpoint: Checkpoint,
    pub requested_time: DateTime<Utc>,
    /// `None` when the nearest sample is outside tolerance.
    pub sample: Option<ExtractedSample>,
    /// Served from an expired snapshot because yr.no could not be reached.
    pub stale: bool,
    pub fetched_at: DateTime<Utc>,
    pub model_run_at: Option<DateTime<Utc>>,
    pub horizon: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RaceForecast {
    pub race: Race,
    pub target_duration_hours: f64,
    /// In course order; `requested_time` is the expected arrival.
    pub checkpoints: Vec<CheckpointForecast>,
}

impl RaceForecast {
    pub fn stale(&self) -> bool {
        self.checkpoints.iter().any(|c| c.stale)
    }

    /// Oldest model run across checkpoints that have a sample.
    pub fn model_run_at(&self) -> Option<DateTime<Utc>> {
        self.checkpoints
            .iter()
            .filter(|c| c.sample.is_some())
            .filter_map(|c| c.model_run_at)
            .min()
    }

    /// Most conservative horizon across checkpoints.
    pub fn horizon(&self) -> Option<DateTime<Utc>> {
        self.checkpoints.iter().map(|c| c.horizon).min()
    }
}

#[derive(Debug, Clone)]
pub struct ForecastHistory {
    pub checkpoint: Checkpoint,
    pub requested_time: DateTime<Utc>,
    /// One observation per model run, oldest first.
    pub entries: Vec<ForecastObservation>,
}

impl ForecastHistory {
    /// Slot the entries belong to, if any were found.
    pub fn forecast_time(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|o| o.forecast_time)
    }
}

pub fn validate_duration(hours: f64) -> Result<f64, ForecastError> {
    // NaN fails every comparison, so check finiteness first
    if !hours.is_finite() || hours <= 0.0 || hours > MAX_TARGET_DURATION_HOURS {
        return Err(ForecastError::InvalidDuration {
            value: hours,
            max: MAX_TARGET_DURATION_HOURS,
        });
    }
    Ok(hours)
}

#[derive(Clone)]
pub struct ForecastService {
    catalog: Arc<dyn RaceCatalog>,
    observations: Arc<dyn ObservationStore>,
    freshness: CacheFreshnessManager,
    history: HistoryWriter,
    pacing: PacingModel,
}

impl ForecastService {
    pub fn new(
        catalog: Arc<dyn RaceCatalog>,
        observations: Arc<dyn ObservationStore>,
        freshness: CacheFreshnessManager,
        pacing: PacingModel,
    ) -> Self {
        Self {
            catalog,
            history: HistoryWriter::new(observations.clone()),
            observations,
            freshness,
            pacing,
        }
    }

    /// Forecast at an explicit instant.
    pub async fn resolve_checkpoint(
        &self,
        checkpoint_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CheckpointForecast, ForecastError> {
        let checkpoint = self.checkpoint(checkpoint_id).await?;
        self.resolve(checkpoint, at).await
    }

    /// Forecast at the checkpoint's expected arrival for a target finish time.
    pub async fn resolve_at_duration(
        &self,
        checkpoint_id: Uuid,
        target_hours: f64,
    ) -> Result<CheckpointForecast, ForecastError> {
        let target_hours = validate_duration(target_hours)?;
        let checkpoint = self.checkpoint(checkpoint_id).await?;
        let race = self.race(checkpoint.race_id).await?;
        let course = self.catalog.checkpoints(race.id).await?;

        let at = self
            .pacing
            .expected_arrival(&race, &course, checkpoint.id, target_hours)
            .ok_or(ForecastError::CheckpointNotFound(checkpoint.id))?;
        self.resolve(checkpoint, at).await
    }

    /// Forecast at every checkpoint of a race for a target finish time.
    ///
    /// Any checkpoint that fails hard fails the whole request.
    pub async fn resolve_race(
        &self,
        race_id: Uuid,
        target_hours: f64,
    ) -> Result<RaceForecast, ForecastError> {
        let target_hours = validate_duration(target_hours)?;
        let race = self.race(race_id).await?;
        let course = self.catalog.checkpoints(race.id).await?;
        let arrivals = self.pacing.expected_arrivals(&race, &course, target_hours);

        let results: Vec<Result<CheckpointForecast, ForecastError>> =
            stream::iter(course.into_iter().zip(arrivals))
                .map(|(cp, at)| self.resolve(cp, at))
                .buffered(RACE_FAN_OUT)
                .collect()
                .await;
        let checkpoints = results.into_iter().collect::<Result<Vec<_>, _>>()?;

        Ok(RaceForecast {
            race,
            target_duration_hours: target_hours,
            checkpoints,
        })
    }

    /// Every recorded model-run version of the slot nearest `near`.
    pub async fn history(
        &self,
        checkpoint_id: Uuid,
        near: DateTime<Utc>,
    ) -> Result<ForecastHistory, ForecastError> {
        let checkpoint = self.checkpoint(checkpoint_id).await?;
        let entries = self
            .observations
            .history(checkpoint.id, near, HISTORY_WINDOW_HOURS, HISTORY_LIMIT)
            .await?;
        Ok(ForecastHistory {
            checkpoint,
            requested_time: near,
            entries,
        })
    }

    async fn checkpoint(&self, id: Uuid) -> Result<Checkpoint, ForecastError> {
        self.catalog
            .checkpoint(id)
            .await?
            .ok_or(ForecastError::CheckpointNotFound(id))
    }

    async fn race(&self, id: Uuid) -> Result<Race, ForecastError> {
        self.catalog
            .race(id)
            .await?
            .ok_or(ForecastError::RaceNotFound(id))
    }

    async fn resolve(
        &self,
        checkpoint: Checkpoint,
        at: DateTime<Utc>,
    ) -> Result<CheckpointForecast, ForecastError> {
        let fresh = self.freshness.ensure_fresh(&checkpoint).await?;
        let series = Timeseries::parse(&fresh.payload)?;
        let sample = series.extract(at).into_sample();

        if let Some(sample) = &sample {
            let writer = self.history.clone();
            let checkpoint_id = checkpoint.id;
            let samples = vec![sample.clone()];
            let provenance = Provenance {
                fetched_at: Utc::now(),
                model_run_at: series.model_run_at(),
            };
            tokio::spawn(async move {
                writer
                    .record_best_effort(checkpoint_id, &samples, provenance)
                    .await;
            });
        }

        Ok(CheckpointForecast {
            checkpoint,
            requested_time: at,
            sample,
            stale: fresh.degraded,
            fetched_at: fresh.fetched_at,
            model_run_at: series.model_run_at(),
            horizon: series.horizon(),
        })
    }
}
