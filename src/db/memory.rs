//! In-memory store used by unit tests. Enforces the same uniqueness rules as
//! the PostgreSQL schema (one snapshot per checkpoint, partial dedup keys).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::models::{
    Checkpoint, ForecastObservation, NewObservation, NewSnapshot, Race, UpstreamSnapshot,
};
use super::{
    ObservationStore, RaceCatalog, RaceWithCheckpoints, SnapshotStore, StoreError, StoreResult,
};

#[derive(Default)]
pub struct MemoryStore {
    snapshots: Mutex<Vec<UpstreamSnapshot>>,
    observations: Mutex<Vec<ForecastObservation>>,
    races: Mutex<Vec<Race>>,
    checkpoints: Mutex<Vec<Checkpoint>>,
    snapshot_writes: AtomicUsize,
    fail_observation_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_race(&self, race: Race, checkpoints: Vec<Checkpoint>) {
        self.races.lock().unwrap().push(race);
        self.checkpoints.lock().unwrap().extend(checkpoints);
    }

    /// Seed a snapshot directly, bypassing the write counter.
    pub fn seed_snapshot(&self, snapshot: NewSnapshot) {
        let row = to_row(snapshot, Utc::now());
        let mut rows = self.snapshots.lock().unwrap();
        rows.retain(|s| s.checkpoint_id != row.checkpoint_id);
        rows.push(row);
    }

    pub fn snapshot_rows(&self, checkpoint_id: Uuid) -> Vec<UpstreamSnapshot> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.checkpoint_id == checkpoint_id)
            .cloned()
            .collect()
    }

    pub fn snapshot_writes(&self) -> usize {
        self.snapshot_writes.load(Ordering::SeqCst)
    }

    pub fn observations(&self) -> Vec<ForecastObservation> {
        self.observations.lock().unwrap().clone()
    }

    pub fn fail_observation_writes(&self, fail: bool) {
        self.fail_observation_writes.store(fail, Ordering::SeqCst);
    }
}

fn to_row(s: NewSnapshot, created_at: DateTime<Utc>) -> UpstreamSnapshot {
    UpstreamSnapshot {
        id: Uuid::new_v4(),
        checkpoint_id: s.checkpoint_id,
        latitude: s.latitude,
        longitude: s.longitude,
        elevation_m: s.elevation_m,
        fetched_at: s.fetched_at,
        expires_at: s.expires_at,
        last_modified: s.last_modified,
        raw_response: s.raw_response,
        created_at,
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn fresh_snapshot(
        &self,
        checkpoint_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UpstreamSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.checkpoint_id == checkpoint_id && s.expires_at > now)
            .cloned())
    }

    async fn latest_snapshot(&self, checkpoint_id: Uuid) -> StoreResult<Option<UpstreamSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.checkpoint_id == checkpoint_id)
            .cloned())
    }

    async fn replace_snapshot(&self, snapshot: NewSnapshot) -> StoreResult<UpstreamSnapshot> {
        self.snapshot_writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.snapshots.lock().unwrap();
        let row = match rows.iter().position(|s| s.checkpoint_id == snapshot.checkpoint_id) {
            Some(idx) => {
                let existing = rows.remove(idx);
                UpstreamSnapshot {
                    id: existing.id,
                    created_at: existing.created_at,
                    ..to_row(snapshot, existing.created_at)
                }
            }
            None => to_row(snapshot, Utc::now()),
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn extend_expiry(
        &self,
        checkpoint_id: Uuid,
        expires_at: DateTime<Utc>,
        last_modified: Option<&str>,
    ) -> StoreResult<bool> {
        self.snapshot_writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.snapshots.lock().unwrap();
        match rows.iter_mut().find(|s| s.checkpoint_id == checkpoint_id) {
            Some(row) => {
                row.expires_at = expires_at;
                if let Some(lm) = last_modified {
                    row.last_modified = Some(lm.to_string());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn earliest_expiry(&self, checkpoint_ids: &[Uuid]) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| checkpoint_ids.contains(&s.checkpoint_id))
            .map(|s| s.expires_at)
            .min())
    }
}

#[async_trait]
impl ObservationStore for MemoryStore {
    async fn insert_if_absent(&self, o: NewObservation) -> StoreResult<bool> {
        if self.fail_observation_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Injected("observation write failed".to_string()));
        }
        let mut rows = self.observations.lock().unwrap();
        let collides = rows.iter().any(|r| {
            r.checkpoint_id == o.checkpoint_id
                && r.forecast_time == o.forecast_time
                && match (r.yr_model_run_at, o.yr_model_run_at) {
                    (Some(a), Some(b)) => a == b,
                    (None, None) => true,
                    _ => false,
                }
        });
        if collides {
            return Ok(false);
        }
        rows.push(ForecastObservation {
            id: Uuid::new_v4(),
            checkpoint_id: o.checkpoint_id,
            forecast_time: o.forecast_time,
            fetched_at: o.fetched_at,
            source: o.source,
            resolution: o.resolution,
            temperature_c: o.temperature_c,
            temperature_percentile_10_c: o.temperature_percentile_10_c,
            temperature_percentile_90_c: o.temperature_percentile_90_c,
            wind_speed_ms: o.wind_speed_ms,
            wind_speed_percentile_10_ms: o.wind_speed_percentile_10_ms,
            wind_speed_percentile_90_ms: o.wind_speed_percentile_90_ms,
            wind_direction_deg: o.wind_direction_deg,
            wind_gust_ms: o.wind_gust_ms,
            precipitation_mm: o.precipitation_mm,
            precipitation_min_mm: o.precipitation_min_mm,
            precipitation_max_mm: o.precipitation_max_mm,
            humidity_pct: o.humidity_pct,
            dew_point_c: o.dew_point_c,
            cloud_cover_pct: o.cloud_cover_pct,
            uv_index: o.uv_index,
            symbol_code: o.symbol_code,
            feels_like_c: o.feels_like_c,
            precipitation_type: o.precipitation_type,
            snow_temperature_c: o.snow_temperature_c,
            yr_model_run_at: o.yr_model_run_at,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn history(
        &self,
        checkpoint_id: Uuid,
        near: DateTime<Utc>,
        window_hours: i64,
        limit: i64,
    ) -> StoreResult<Vec<ForecastObservation>> {
        let rows = self.observations.lock().unwrap();
        let window = Duration::hours(window_hours);
        let slot = rows
            .iter()
            .filter(|r| r.checkpoint_id == checkpoint_id)
            .filter(|r| (r.forecast_time - near).abs() <= window)
            .min_by_key(|r| ((r.forecast_time - near).abs(), r.forecast_time))
            .map(|r| r.forecast_time);
        let Some(slot) = slot else {
            return Ok(Vec::new());
        };

        let mut versions: Vec<ForecastObservation> = Vec::new();
        for row in rows
            .iter()
            .filter(|r| r.checkpoint_id == checkpoint_id && r.forecast_time == slot)
        {
            match versions
                .iter_mut()
                .find(|v| v.effective_run_at() == row.effective_run_at())
            {
                Some(v) if v.fetched_at < row.fetched_at => *v = row.clone(),
                Some(_) => {}
                None => versions.push(row.clone()),
            }
        }
        // keep the newest `limit` runs, returned oldest first
        versions.sort_by_key(|v| std::cmp::Reverse(v.effective_run_at()));
        versions.truncate(usize::try_from(limit).unwrap_or(0));
        versions.reverse();
        Ok(versions)
    }
}

#[async_trait]
impl RaceCatalog for MemoryStore {
    async fn race(&self, race_id: Uuid) -> StoreResult<Option<Race>> {
        Ok(self
            .races
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == race_id)
            .cloned())
    }

    async fn checkpoint(&self, checkpoint_id: Uuid) -> StoreResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == checkpoint_id)
            .cloned())
    }

    async fn checkpoints(&self, race_id: Uuid) -> StoreResult<Vec<Checkpoint>> {
        let mut cps: Vec<Checkpoint> = self
            .checkpoints
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.race_id == race_id)
            .cloned()
            .collect();
        cps.sort_by_key(|c| c.sort_order);
        Ok(cps)
    }

    async fn upcoming_races(
        &self,
        now: DateTime<Utc>,
        lookahead_days: i64,
    ) -> StoreResult<Vec<RaceWithCheckpoints>> {
        let today = now.date_naive();
        let horizon = now + Duration::days(lookahead_days);
        let mut races: Vec<Race> = self
            .races
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.start_time.date_naive() >= today && r.start_time <= horizon)
            .cloned()
            .collect();
        races.sort_by_key(|r| r.start_time);

        let mut out = Vec::with_capacity(races.len());
        for race in races {
            let checkpoints = self.checkpoints(race.id).await?;
            out.push(RaceWithCheckpoints { race, checkpoints });
        }
        Ok(out)
    }
}

// --- fixtures ---

pub fn race(name: &str, start_time: DateTime<Utc>, distance_km: i64) -> Race {
    use chrono::Datelike;
    Race {
        id: Uuid::new_v4(),
        name: name.to_string(),
        year: start_time.year(),
        start_time,
        distance_km: distance_km.into(),
    }
}

pub fn checkpoint(race_id: Uuid, name: &str, km: f64, elevation_m: f64, sort_order: i32) -> Checkpoint {
    use crate::helpers::geo_decimal;
    Checkpoint {
        id: Uuid::new_v4(),
        race_id,
        name: name.to_string(),
        distance_km: geo_decimal(km),
        latitude: geo_decimal(61.0 + km / 1000.0),
        longitude: geo_decimal(13.5 + km / 100.0),
        elevation_m: geo_decimal(elevation_m),
        sort_order,
    }
}

pub fn snapshot(
    cp: &Checkpoint,
    fetched_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    last_modified: Option<&str>,
    raw_response: serde_json::Value,
) -> NewSnapshot {
    NewSnapshot {
        checkpoint_id: cp.id,
        latitude: cp.latitude,
        longitude: cp.longitude,
        elevation_m: cp.elevation_m,
        fetched_at,
        expires_at,
        last_modified: last_modified.map(str::to_string),
        raw_response,
    }
}
