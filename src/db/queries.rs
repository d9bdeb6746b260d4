//! PostgreSQL implementation of the store seams.

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use super::models::{
    Checkpoint, ForecastObservation, NewObservation, NewSnapshot, Race, UpstreamSnapshot,
};
use super::{ObservationStore, RaceCatalog, RaceWithCheckpoints, SnapshotStore, StoreResult};

const SNAPSHOT_COLS: &str = "\
    id, checkpoint_id, latitude, longitude, elevation_m, fetched_at, expires_at, \
    last_modified, raw_response, created_at";

const CHECKPOINT_COLS: &str =
    "id, race_id, name, distance_km, latitude, longitude, elevation_m, sort_order";

/// Keep in sync with `ForecastObservation`.
const OBSERVATION_COLS: &str = "\
    id, checkpoint_id, forecast_time, fetched_at, source, resolution, \
    temperature_c, temperature_percentile_10_c, temperature_percentile_90_c, \
    wind_speed_ms, wind_speed_percentile_10_ms, wind_speed_percentile_90_ms, \
    wind_direction_deg, wind_gust_ms, \
    precipitation_mm, precipitation_min_mm, precipitation_max_mm, \
    humidity_pct, dew_point_c, cloud_cover_pct, uv_index, symbol_code, \
    feels_like_c, precipitation_type, snow_temperature_c, yr_model_run_at, created_at";

/// Insert column list; `id` and `created_at` come from column defaults.
const OBSERVATION_INSERT_COLS: &str = "\
    checkpoint_id, forecast_time, fetched_at, source, resolution, \
    temperature_c, temperature_percentile_10_c, temperature_percentile_90_c, \
    wind_speed_ms, wind_speed_percentile_10_ms, wind_speed_percentile_90_ms, \
    wind_direction_deg, wind_gust_ms, \
    precipitation_mm, precipitation_min_mm, precipitation_max_mm, \
    humidity_pct, dew_point_c, cloud_cover_pct, uv_index, symbol_code, \
    feels_like_c, precipitation_type, snow_temperature_c, yr_model_run_at";

/// All stores backed by one connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Round-trip a trivial query; used by the health endpoint.
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// yr_responses
// ---------------------------------------------------------------------------

#[async_trait]
impl SnapshotStore for PgStore {
    async fn fresh_snapshot(
        &self,
        checkpoint_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UpstreamSnapshot>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLS} FROM yr_responses WHERE checkpoint_id = $1 AND expires_at > $2"
        );
        Ok(sqlx::query_as::<_, UpstreamSnapshot>(&sql)
            .bind(checkpoint_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn latest_snapshot(&self, checkpoint_id: Uuid) -> StoreResult<Option<UpstreamSnapshot>> {
        let sql = format!("SELECT {SNAPSHOT_COLS} FROM yr_responses WHERE checkpoint_id = $1");
        Ok(sqlx::query_as::<_, UpstreamSnapshot>(&sql)
            .bind(checkpoint_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn replace_snapshot(&self, s: NewSnapshot) -> StoreResult<UpstreamSnapshot> {
        let sql = format!(
            "INSERT INTO yr_responses
                 (checkpoint_id, latitude, longitude, elevation_m, fetched_at, expires_at,
                  last_modified, raw_response)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (checkpoint_id) DO UPDATE SET
                 latitude = EXCLUDED.latitude,
                 longitude = EXCLUDED.longitude,
                 elevation_m = EXCLUDED.elevation_m,
                 fetched_at = EXCLUDED.fetched_at,
                 expires_at = EXCLUDED.expires_at,
                 last_modified = EXCLUDED.last_modified,
                 raw_response = EXCLUDED.raw_response
             RETURNING {SNAPSHOT_COLS}"
        );
        Ok(sqlx::query_as::<_, UpstreamSnapshot>(&sql)
            .bind(s.checkpoint_id)
            .bind(s.latitude)
            .bind(s.longitude)
            .bind(s.elevation_m)
            .bind(s.fetched_at)
            .bind(s.expires_at)
            .bind(s.last_modified)
            .bind(s.raw_response)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn extend_expiry(
        &self,
        checkpoint_id: Uuid,
        expires_at: DateTime<Utc>,
        last_modified: Option<&str>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE yr_responses
             SET expires_at = $2, last_modified = COALESCE($3, last_modified)
             WHERE checkpoint_id = $1",
        )
        .bind(checkpoint_id)
        .bind(expires_at)
        .bind(last_modified)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn earliest_expiry(&self, checkpoint_ids: &[Uuid]) -> StoreResult<Option<DateTime<Utc>>> {
        if checkpoint_ids.is_empty() {
            return Ok(None);
        }
        let earliest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(expires_at) FROM yr_responses WHERE checkpoint_id = ANY($1)",
        )
        .bind(checkpoint_ids)
        .fetch_one(&self.pool)
        .await?;
        Ok(earliest)
    }
}

// ---------------------------------------------------------------------------
// forecasts
// ---------------------------------------------------------------------------

#[async_trait]
impl ObservationStore for PgStore {
    async fn insert_if_absent(&self, o: NewObservation) -> StoreResult<bool> {
        // NULL never equals NULL, so each case needs its own partial unique index
        // and the conflict target has to name the matching one.
        let conflict_target = if o.yr_model_run_at.is_some() {
            "(checkpoint_id, forecast_time, yr_model_run_at) WHERE yr_model_run_at IS NOT NULL"
        } else {
            "(checkpoint_id, forecast_time) WHERE yr_model_run_at IS NULL"
        };
        let sql = format!(
            "INSERT INTO forecasts ({OBSERVATION_INSERT_COLS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                     $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)
             ON CONFLICT {conflict_target} DO NOTHING
             RETURNING id"
        );

        let inserted: Option<Uuid> = sqlx::query_scalar(&sql)
            .bind(o.checkpoint_id)
            .bind(o.forecast_time)
            .bind(o.fetched_at)
            .bind(&o.source)
            .bind(&o.resolution)
            .bind(o.temperature_c)
            .bind(o.temperature_percentile_10_c)
            .bind(o.temperature_percentile_90_c)
            .bind(o.wind_speed_ms)
            .bind(o.wind_speed_percentile_10_ms)
            .bind(o.wind_speed_percentile_90_ms)
            .bind(o.wind_direction_deg)
            .bind(o.wind_gust_ms)
            .bind(o.precipitation_mm)
            .bind(o.precipitation_min_mm)
            .bind(o.precipitation_max_mm)
            .bind(o.humidity_pct)
            .bind(o.dew_point_c)
            .bind(o.cloud_cover_pct)
            .bind(o.uv_index)
            .bind(&o.symbol_code)
            .bind(o.feels_like_c)
            .bind(&o.precipitation_type)
            .bind(o.snow_temperature_c)
            .bind(o.yr_model_run_at)
            .fetch_optional(&self.pool)
            .await?;
        Ok(inserted.is_some())
    }

    async fn history(
        &self,
        checkpoint_id: Uuid,
        near: DateTime<Utc>,
        window_hours: i64,
        limit: i64,
    ) -> StoreResult<Vec<ForecastObservation>> {
        let sql = format!(
            "SELECT {OBSERVATION_COLS} FROM (
             SELECT * FROM (
                 SELECT DISTINCT ON (COALESCE(yr_model_run_at, fetched_at)) *
                 FROM forecasts
                 WHERE checkpoint_id = $1
                   AND forecast_time = (
                       SELECT forecast_time FROM forecasts
                       WHERE checkpoint_id = $1
                         AND forecast_time BETWEEN $2 - make_interval(hours => $3)
                                               AND $2 + make_interval(hours => $3)
                       ORDER BY ABS(EXTRACT(EPOCH FROM (forecast_time - $2))), forecast_time
                       LIMIT 1
                   )
                 ORDER BY COALESCE(yr_model_run_at, fetched_at), fetched_at DESC
             ) versions
             ORDER BY COALESCE(yr_model_run_at, fetched_at) DESC
             LIMIT $4
             ) newest
             ORDER BY COALESCE(yr_model_run_at, fetched_at) ASC"
        );
        Ok(sqlx::query_as::<_, ForecastObservation>(&sql)
            .bind(checkpoint_id)
            .bind(near)
            .bind(i32::try_from(window_hours).unwrap_or(i32::MAX))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }
}

// ---------------------------------------------------------------------------
// races / checkpoints (read-only)
// ---------------------------------------------------------------------------

#[async_trait]
impl RaceCatalog for PgStore {
    async fn race(&self, race_id: Uuid) -> StoreResult<Option<Race>> {
        Ok(sqlx::query_as::<_, Race>(
            "SELECT id, name, year, start_time, distance_km FROM races WHERE id = $1",
        )
        .bind(race_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn checkpoint(&self, checkpoint_id: Uuid) -> StoreResult<Option<Checkpoint>> {
        let sql = format!("SELECT {CHECKPOINT_COLS} FROM checkpoints WHERE id = $1");
        Ok(sqlx::query_as::<_, Checkpoint>(&sql)
            .bind(checkpoint_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn checkpoints(&self, race_id: Uuid) -> StoreResult<Vec<Checkpoint>> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLS} FROM checkpoints WHERE race_id = $1 ORDER BY sort_order"
        );
        Ok(sqlx::query_as::<_, Checkpoint>(&sql)
            .bind(race_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn upcoming_races(
        &self,
        now: DateTime<Utc>,
        lookahead_days: i64,
    ) -> StoreResult<Vec<RaceWithCheckpoints>> {
        let start_of_today = now.duration_trunc(Duration::days(1)).unwrap_or(now);
        let horizon = now + Duration::days(lookahead_days);

        let races = sqlx::query_as::<_, Race>(
            "SELECT id, name, year, start_time, distance_km
             FROM races
             WHERE start_time >= $1 AND start_time <= $2
             ORDER BY start_time",
        )
        .bind(start_of_today)
        .bind(horizon)
        .fetch_all(&self.pool)
        .await?;

        if races.is_empty() {
            return Ok(Vec::new());
        }

        let race_ids: Vec<Uuid> = races.iter().map(|r| r.id).collect();
        let sql = format!(
            "SELECT {CHECKPOINT_COLS} FROM checkpoints
             WHERE race_id = ANY($1)
             ORDER BY race_id, sort_order"
        );
        let checkpoints = sqlx::query_as::<_, Checkpoint>(&sql)
            .bind(&race_ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(group_by_race(races, checkpoints))
    }
}

/// Attach checkpoints to their races, preserving race order and course order.
fn group_by_race(races: Vec<Race>, checkpoints: Vec<Checkpoint>) -> Vec<RaceWithCheckpoints> {
    let mut by_race: HashMap<Uuid, Vec<Checkpoint>> = HashMap::new();
    for cp in checkpoints {
        by_race.entry(cp.race_id).or_default().push(cp);
    }
    races
        .into_iter()
        .map(|race| {
            let mut checkpoints = by_race.remove(&race.id).unwrap_or_default();
            checkpoints.sort_by_key(|cp| cp.sort_order);
            RaceWithCheckpoints { race, checkpoints }
        })
        .collect()
}
