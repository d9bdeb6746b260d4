//! Background poller for proactive forecast capture.
//!
//! Refreshes every checkpoint of upcoming races on a schedule driven by
//! yr.no's `Expires` header, so the `forecasts` table records each model run
//! even when nobody is reading.
//!
//! - Sleeps until the earliest snapshot expiry plus a buffer, clamped to
//!   `[min_sleep, max_sleep]`; a fixed idle sleep when no race is tracked.
//! - Per checkpoint: ensure the snapshot is fresh, extract the hourly slots
//!   a skier could plausibly pass through, record them.
//! - A 304 right after expiry usually means the next model run is not
//!   published yet. Those checkpoints are revalidated up to `max_retries`
//!   times with a fixed delay, then left for the next cycle.
//! - State lives in memory only; after a restart the schedule is rebuilt from
//!   the stored `expires_at` values.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::PollerConfig;
use crate::db::models::{Checkpoint, Race};
use crate::db::{RaceCatalog, SnapshotStore};
use crate::helpers::{add_hours, ceil_to_hour, dec_to_f64, floor_to_hour};
use crate::services::extractor::{extract_many, ExtractedSample};
use crate::services::freshness::{CacheFreshnessManager, FreshnessOutcome};
use crate::services::history::{HistoryWriter, Provenance};

// ---------------------------------------------------------------------------
// Poller state (in-memory, shared via Arc<RwLock<>>)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PollerPhase {
    Idle,
    Scanning,
    Refreshing,
}

/// Result of the last poll of one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    Pending,
    NewData,
    NotModified,
    CacheHit,
    /// yr.no unreachable, an expired snapshot was kept.
    Stale,
    Error,
}

impl From<FreshnessOutcome> for PollOutcome {
    fn from(o: FreshnessOutcome) -> Self {
        match o {
            FreshnessOutcome::CacheHit => PollOutcome::CacheHit,
            FreshnessOutcome::Refetched => PollOutcome::NewData,
            FreshnessOutcome::NotModified => PollOutcome::NotModified,
            FreshnessOutcome::StaleFallback => PollOutcome::Stale,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckpointPollStatus {
    pub checkpoint_id: Uuid,
    pub checkpoint_name: String,
    pub race_name: String,
    pub distance_km: f64,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub last_model_run_at: Option<DateTime<Utc>>,
    pub last_outcome: PollOutcome,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Samples extracted in the last poll.
    pub extraction_count: usize,
    /// Rows actually inserted in the last poll (after dedup).
    pub insert_count: usize,
}

impl CheckpointPollStatus {
    fn pending(cp: &Checkpoint, race: &Race) -> Self {
        Self {
            checkpoint_id: cp.id,
            checkpoint_name: cp.name.clone(),
            race_name: race.name.clone(),
            distance_km: dec_to_f64(cp.distance_km),
            expires_at: None,
            last_fetched_at: None,
            last_model_run_at: None,
            last_outcome: PollOutcome::Pending,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            extraction_count: 0,
            insert_count: 0,
        }
    }

    fn apply(&mut self, report: PollReport, at: DateTime<Utc>) {
        self.last_outcome = report.outcome;
        self.extraction_count = report.extraction_count;
        self.insert_count = report.insert_count;
        if report.expires_at.is_some() {
            self.expires_at = report.expires_at;
            self.last_fetched_at = report.fetched_at;
        }
        if report.model_run_at.is_some() {
            self.last_model_run_at = report.model_run_at;
        }
        match report.error {
            Some(e) => {
                self.last_failure_at = Some(at);
                self.last_error = Some(e);
            }
            None => {
                self.last_success_at = Some(at);
                self.last_error = None;
            }
        }
    }
}

/// Global poller state, exposed via the status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PollerState {
    pub enabled: bool,
    pub phase: PollerPhase,
    /// Checkpoint being refreshed while `phase` is `refreshing`.
    pub current_checkpoint: Option<Uuid>,
    pub last_cycle_started_at: Option<DateTime<Utc>>,
    pub last_cycle_completed_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_ms: Option<u64>,
    pub total_cycles: u64,
    pub next_wakeup_at: Option<DateTime<Utc>>,
    pub checkpoints: Vec<CheckpointPollStatus>,
}

impl PollerState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            phase: PollerPhase::Idle,
            current_checkpoint: None,
            last_cycle_started_at: None,
            last_cycle_completed_at: None,
            last_cycle_duration_ms: None,
            total_cycles: 0,
            next_wakeup_at: None,
            checkpoints: Vec::new(),
        }
    }
}

/// Shared poller state handle.
pub type SharedPollerState = Arc<RwLock<PollerState>>;

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Hourly slots between the arrival at the fastest and at the slowest
/// plausible pace. The start checkpoint only gets the start hour.
pub fn arrival_bands(
    race_start: DateTime<Utc>,
    distance_km: f64,
    config: &PollerConfig,
) -> Vec<DateTime<Utc>> {
    if distance_km <= 0.0 || !distance_km.is_finite() {
        return vec![floor_to_hour(race_start)];
    }

    let earliest = add_hours(race_start, distance_km / config.max_speed_kmh);
    let latest = add_hours(race_start, distance_km / config.min_speed_kmh);

    let mut slots = Vec::new();
    let mut slot = floor_to_hour(earliest);
    let last = ceil_to_hour(latest);
    while slot <= last {
        slots.push(slot);
        slot += Duration::hours(1);
    }
    slots
}

/// Time until the next cycle.
pub fn compute_sleep(
    now: DateTime<Utc>,
    earliest_expiry: Option<DateTime<Utc>>,
    config: &PollerConfig,
) -> std::time::Duration {
    let secs = match earliest_expiry {
        Some(expiry) => {
            let wake = expiry + Duration::seconds(config.wakeup_buffer_secs as i64);
            (wake - now).num_seconds().max(0) as u64
        }
        None => config.max_sleep_secs,
    };
    std::time::Duration::from_secs(secs.clamp(config.min_sleep_secs, config.max_sleep_secs))
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PollReport {
    outcome: PollOutcome,
    expires_at: Option<DateTime<Utc>>,
    fetched_at: Option<DateTime<Utc>>,
    model_run_at: Option<DateTime<Utc>>,
    extraction_count: usize,
    insert_count: usize,
    error: Option<String>,
}

impl PollReport {
    fn failed(error: String) -> Self {
        Self {
            outcome: PollOutcome::Error,
            expires_at: None,
            fetched_at: None,
            model_run_at: None,
            extraction_count: 0,
            insert_count: 0,
            error: Some(error),
        }
    }
}

pub struct BackgroundPoller {
    catalog: Arc<dyn RaceCatalog>,
    snapshots: Arc<dyn SnapshotStore>,
    freshness: CacheFreshnessManager,
    history: HistoryWriter,
    config: PollerConfig,
    state: SharedPollerState,
}

impl BackgroundPoller {
    pub fn new(
        catalog: Arc<dyn RaceCatalog>,
        snapshots: Arc<dyn SnapshotStore>,
        freshness: CacheFreshnessManager,
        history: HistoryWriter,
        config: PollerConfig,
        state: SharedPollerState,
    ) -> Self {
        Self {
            catalog,
            snapshots,
            freshness,
            history,
            config,
            state,
        }
    }

    /// Run cycles until the process exits. Spawn with `tokio::spawn`.
    pub async fn run(self) {
        tracing::info!(
            lookahead_days = self.config.lookahead_days,
            "background poller started"
        );
        loop {
            let sleep = self.run_cycle().await;
            tokio::time::sleep(sleep).await;
        }
    }

    /// One full cycle; returns how long to sleep before the next.
    pub async fn run_cycle(&self) -> std::time::Duration {
        let started = Utc::now();
        {
            let mut s = self.state.write().await;
            s.phase = PollerPhase::Scanning;
            s.current_checkpoint = None;
            s.last_cycle_started_at = Some(started);
        }

        let races = match self
            .catalog
            .upcoming_races(started, self.config.lookahead_days)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "poller failed to load upcoming races");
                let sleep = std::time::Duration::from_secs(self.config.min_sleep_secs);
                self.finish_cycle(started, sleep, None).await;
                return sleep;
            }
        };

        if races.is_empty() {
            let sleep = std::time::Duration::from_secs(self.config.idle_sleep_secs);
            tracing::debug!(
                lookahead_days = self.config.lookahead_days,
                sleep_secs = sleep.as_secs(),
                "no upcoming races"
            );
            self.finish_cycle(started, sleep, Some(Vec::new())).await;
            return sleep;
        }

        let tracked: Vec<(&Race, &Checkpoint)> = races
            .iter()
            .flat_map(|r| r.checkpoints.iter().map(move |cp| (&r.race, cp)))
            .collect();
        self.sync_statuses(&tracked).await;

        let mut not_modified = Vec::new();
        for (race, cp) in &tracked {
            let report = self.poll_checkpoint(race, cp, false).await;
            if report.outcome == PollOutcome::NotModified {
                not_modified.push((*race, *cp));
            }
            self.publish(cp.id, report).await;
        }

        for attempt in 1..=self.config.max_retries {
            if not_modified.is_empty() {
                break;
            }
            tracing::info!(
                attempt,
                max_retries = self.config.max_retries,
                checkpoints = not_modified.len(),
                "yr.no not modified after expiry, retrying"
            );
            {
                let mut s = self.state.write().await;
                s.phase = PollerPhase::Scanning;
                s.current_checkpoint = None;
            }
            tokio::time::sleep(std::time::Duration::from_secs(self.config.retry_delay_secs)).await;

            let mut still = Vec::new();
            for (race, cp) in not_modified {
                let report = self.poll_checkpoint(race, cp, true).await;
                if report.outcome == PollOutcome::NotModified {
                    still.push((race, cp));
                }
                self.publish(cp.id, report).await;
            }
            not_modified = still;
        }
        if !not_modified.is_empty() {
            tracing::info!(
                checkpoints = not_modified.len(),
                "giving up on unchanged checkpoints until next cycle"
            );
        }

        let ids: Vec<Uuid> = tracked.iter().map(|(_, cp)| cp.id).collect();
        let earliest = match self.snapshots.earliest_expiry(&ids).await {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(error = %e, "poller failed to read earliest expiry");
                None
            }
        };
        let sleep = compute_sleep(Utc::now(), earliest, &self.config);
        self.finish_cycle(started, sleep, None).await;

        tracing::info!(
            checkpoints = ids.len(),
            sleep_secs = sleep.as_secs(),
            earliest_expiry = ?earliest,
            "poll cycle complete"
        );
        sleep
    }

    async fn poll_checkpoint(&self, race: &Race, cp: &Checkpoint, revalidate: bool) -> PollReport {
        {
            let mut s = self.state.write().await;
            s.phase = PollerPhase::Refreshing;
            s.current_checkpoint = Some(cp.id);
        }

        let fresh = if revalidate {
            self.freshness.revalidate(cp).await
        } else {
            self.freshness.ensure_fresh(cp).await
        };
        let fresh = match fresh {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    checkpoint_id = %cp.id,
                    checkpoint = %cp.name,
                    error = %e,
                    "poller failed to refresh checkpoint"
                );
                return PollReport::failed(e.to_string());
            }
        };

        let outcome = PollOutcome::from(fresh.outcome);
        if fresh.degraded {
            return PollReport {
                outcome,
                expires_at: Some(fresh.expires_at),
                fetched_at: Some(fresh.fetched_at),
                model_run_at: None,
                extraction_count: 0,
                insert_count: 0,
                error: Some("yr.no unreachable, kept expired snapshot".to_string()),
            };
        }

        let bands = arrival_bands(race.start_time, dec_to_f64(cp.distance_km), &self.config);
        let batch = match extract_many(&fresh.payload, &bands) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(checkpoint_id = %cp.id, error = %e, "poller extraction failed");
                return PollReport::failed(e.to_string());
            }
        };

        // Several hourly bands can snap to the same six-hourly sample.
        let mut samples: Vec<ExtractedSample> =
            batch.samples.into_iter().filter_map(|e| e.into_sample()).collect();
        samples.dedup_by_key(|s| s.forecast_time);

        let inserted = self
            .history
            .record_best_effort(
                cp.id,
                &samples,
                Provenance {
                    fetched_at: Utc::now(),
                    model_run_at: batch.model_run_at,
                },
            )
            .await;

        tracing::debug!(
            checkpoint_id = %cp.id,
            checkpoint = %cp.name,
            outcome = fresh.outcome.as_str(),
            bands = bands.len(),
            extracted = samples.len(),
            inserted,
            "polled checkpoint"
        );

        PollReport {
            outcome,
            expires_at: Some(fresh.expires_at),
            fetched_at: Some(fresh.fetched_at),
            model_run_at: batch.model_run_at,
            extraction_count: samples.len(),
            insert_count: inserted,
            error: None,
        }
    }

    /// Keep statuses of tracked checkpoints, drop the rest, add new ones.
    async fn sync_statuses(&self, tracked: &[(&Race, &Checkpoint)]) {
        let mut s = self.state.write().await;
        let previous = std::mem::take(&mut s.checkpoints);
        s.checkpoints = tracked
            .iter()
            .map(|(race, cp)| {
                previous
                    .iter()
                    .find(|p| p.checkpoint_id == cp.id)
                    .cloned()
                    .unwrap_or_else(|| CheckpointPollStatus::pending(cp, race))
            })
            .collect();
    }

    async fn publish(&self, checkpoint_id: Uuid, report: PollReport) {
        let now = Utc::now();
        let mut s = self.state.write().await;
        if let Some(status) = s
            .checkpoints
            .iter_mut()
            .find(|c| c.checkpoint_id == checkpoint_id)
        {
            status.apply(report, now);
        }
    }

    async fn finish_cycle(
        &self,
        started: DateTime<Utc>,
        sleep: std::time::Duration,
        checkpoints: Option<Vec<CheckpointPollStatus>>,
    ) {
        let now = Utc::now();
        let mut s = self.state.write().await;
        if let Some(c) = checkpoints {
            s.checkpoints = c;
        }
        s.phase = PollerPhase::Idle;
        s.current_checkpoint = None;
        s.last_cycle_completed_at = Some(now);
        s.last_cycle_duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        s.total_cycles += 1;
        s.next_wakeup_at = Some(now + Duration::milliseconds(sleep.as_millis() as i64));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{self, MemoryStore};
    use crate::services::freshness::FreshnessPolicy;
    use crate::services::testing::{self, new_data, not_modified, ScriptedProvider};
    use crate::services::yr::UpstreamError;
    use chrono::Timelike;

    const LM: &str = "Sun, 01 Mar 2026 06:00:00 GMT";

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn config() -> PollerConfig {
        PollerConfig {
            enabled: true,
            min_sleep_secs: 60,
            max_sleep_secs: 1800,
            wakeup_buffer_secs: 30,
            idle_sleep_secs: 3600,
            retry_delay_secs: 0,
            max_retries: 5,
            lookahead_days: 10,
            min_speed_kmh: 10.0,
            max_speed_kmh: 30.0,
        }
    }

    // --- arrival bands ---

    #[test]
    fn test_bands_start_checkpoint() {
        let start = utc("2026-03-01T07:00:00Z");
        assert_eq!(arrival_bands(start, 0.0, &config()), vec![start]);
    }

    #[test]
    fn test_bands_mid_race() {
        // 45 km: 1.5 h -> 08:30 -> 08:00; 4.5 h -> 11:30 -> 12:00
        let start = utc("2026-03-01T07:00:00Z");
        let bands = arrival_bands(start, 45.0, &config());
        assert_eq!(bands.len(), 5, "{bands:?}");
        assert_eq!(bands[0], utc("2026-03-01T08:00:00Z"));
        assert_eq!(bands[4], utc("2026-03-01T12:00:00Z"));
    }

    #[test]
    fn test_bands_finish_exact_hours() {
        // 90 km: 3 h -> 10:00, 9 h -> 16:00
        let start = utc("2026-03-01T07:00:00Z");
        let bands = arrival_bands(start, 90.0, &config());
        assert_eq!(bands.len(), 7, "{bands:?}");
        assert_eq!(bands[0], utc("2026-03-01T10:00:00Z"));
        assert_eq!(bands[6], utc("2026-03-01T16:00:00Z"));
    }

    #[test]
    fn test_bands_short_distance() {
        // 5 km: 10 min -> 07:00; 30 min -> 08:00
        let start = utc("2026-03-01T07:00:00Z");
        let bands = arrival_bands(start, 5.0, &config());
        assert_eq!(
            bands,
            vec![utc("2026-03-01T07:00:00Z"), utc("2026-03-01T08:00:00Z")]
        );
    }

    #[test]
    fn test_bands_follow_configured_speeds() {
        let start = utc("2026-03-01T07:00:00Z");
        let mut cfg = config();
        cfg.min_speed_kmh = 15.0;
        // 45 km: 1.5 h -> 08:00 .. 3 h -> 10:00
        assert_eq!(arrival_bands(start, 45.0, &cfg).len(), 3);
    }

    #[test]
    fn test_bands_out_of_range_offsets_do_not_panic() {
        let start = utc("2026-03-01T07:00:00Z");
        let mut cfg = config();
        cfg.min_speed_kmh = 1e-300;
        cfg.max_speed_kmh = 1e-300;
        assert_eq!(arrival_bands(start, 45.0, &cfg), vec![start]);
    }

    #[test]
    fn test_bands_on_hour_and_increasing() {
        let start = utc("2026-03-01T07:20:00Z");
        let bands = arrival_bands(start, 60.0, &config());
        assert!(bands.windows(2).all(|w| w[1] > w[0]));
        assert!(bands.iter().all(|t| t.minute() == 0 && t.second() == 0));
    }

    // --- sleep computation ---

    #[test]
    fn test_sleep_until_expiry_plus_buffer() {
        let now = utc("2026-03-01T07:00:00Z");
        let sleep = compute_sleep(now, Some(now + Duration::minutes(10)), &config());
        assert_eq!(sleep.as_secs(), 630);
    }

    #[test]
    fn test_sleep_clamped() {
        let now = utc("2026-03-01T07:00:00Z");
        // already expired -> min
        assert_eq!(
            compute_sleep(now, Some(now - Duration::hours(1)), &config()).as_secs(),
            60
        );
        // far away -> max
        assert_eq!(
            compute_sleep(now, Some(now + Duration::hours(5)), &config()).as_secs(),
            1800
        );
        // nothing cached -> max
        assert_eq!(compute_sleep(now, None, &config()).as_secs(), 1800);
    }

    // --- cycles ---

    struct Fixture {
        store: Arc<MemoryStore>,
        provider: Arc<ScriptedProvider>,
        poller: BackgroundPoller,
        state: SharedPollerState,
    }

    fn fixture(config: PollerConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        let freshness = CacheFreshnessManager::new(
            store.clone(),
            provider.clone(),
            FreshnessPolicy {
                request_timeout: std::time::Duration::from_millis(500),
                default_expiry: Duration::hours(1),
                not_modified_extension: Duration::minutes(10),
            },
        );
        let state: SharedPollerState = Arc::new(RwLock::new(PollerState::new(true)));
        let poller = BackgroundPoller::new(
            store.clone(),
            store.clone(),
            freshness,
            HistoryWriter::new(store.clone()),
            config,
            state.clone(),
        );
        Fixture {
            store,
            provider,
            poller,
            state,
        }
    }

    fn add_race(store: &MemoryStore, start_in: Duration) -> (Race, Vec<Checkpoint>) {
        let start = floor_to_hour(Utc::now() + start_in);
        let race = memory::race("Vasaloppet", start, 90);
        let course = vec![
            memory::checkpoint(race.id, "Berga", 0.0, 349.0, 0),
            memory::checkpoint(race.id, "Smågan", 11.0, 502.0, 1),
        ];
        store.add_race(race.clone(), course.clone());
        (race, course)
    }

    fn live_payload(run: DateTime<Utc>) -> serde_json::Value {
        testing::payload(Utc::now() - Duration::hours(1), 60, 9, run)
    }

    #[tokio::test]
    async fn test_no_races_sleeps_idle() {
        let f = fixture(config());
        let sleep = f.poller.run_cycle().await;
        assert_eq!(sleep.as_secs(), 3600);

        let s = f.state.read().await;
        assert_eq!(s.phase, PollerPhase::Idle);
        assert_eq!(s.total_cycles, 1);
        assert!(s.checkpoints.is_empty());
        assert!(s.next_wakeup_at.is_some());
    }

    #[tokio::test]
    async fn test_races_outside_lookahead_are_ignored() {
        let f = fixture(config());
        add_race(&f.store, Duration::days(20));
        add_race(&f.store, Duration::days(-3));
        assert_eq!(f.poller.run_cycle().await.as_secs(), 3600);
        assert_eq!(f.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_cycle_refreshes_and_records_bands() {
        let f = fixture(config());
        let (_, course) = add_race(&f.store, Duration::hours(12));
        let run = Utc::now() - Duration::hours(2);
        for _ in 0..2 {
            f.provider.push(Ok(new_data(
                live_payload(run),
                Utc::now() + Duration::minutes(20),
                LM,
            )));
        }

        let sleep = f.poller.run_cycle().await;
        // earliest expiry ~20 min + 30 s buffer
        assert!(sleep.as_secs() > 1100 && sleep.as_secs() <= 1230, "{sleep:?}");

        let obs = f.store.observations();
        // start: 1 band; 11 km: 3 bands
        assert_eq!(obs.len(), 4);
        assert!(obs.iter().all(|o| o.yr_model_run_at.is_some()));

        let s = f.state.read().await;
        assert_eq!(s.phase, PollerPhase::Idle);
        assert_eq!(s.checkpoints.len(), 2);
        let smagan = s
            .checkpoints
            .iter()
            .find(|c| c.checkpoint_id == course[1].id)
            .unwrap();
        assert_eq!(smagan.last_outcome, PollOutcome::NewData);
        assert_eq!(smagan.extraction_count, 3);
        assert_eq!(smagan.insert_count, 3);
        assert!(smagan.last_success_at.is_some());
        assert!(smagan.last_model_run_at.is_some());
    }

    #[tokio::test]
    async fn test_second_cycle_is_cache_hit_without_duplicates() {
        let f = fixture(config());
        add_race(&f.store, Duration::hours(12));
        let run = Utc::now() - Duration::hours(2);
        for _ in 0..2 {
            f.provider.push(Ok(new_data(
                live_payload(run),
                Utc::now() + Duration::minutes(20),
                LM,
            )));
        }

        f.poller.run_cycle().await;
        f.poller.run_cycle().await;
        assert_eq!(f.provider.calls(), 2);
        assert_eq!(f.store.observations().len(), 4);

        let s = f.state.read().await;
        assert_eq!(s.total_cycles, 2);
        assert!(s
            .checkpoints
            .iter()
            .all(|c| c.last_outcome == PollOutcome::CacheHit && c.insert_count == 0));
    }

    #[tokio::test]
    async fn test_not_modified_is_revalidated_until_new_data() {
        let f = fixture(config());
        let (_, course) = add_race(&f.store, Duration::hours(12));
        let now = Utc::now();
        let old_run = now - Duration::hours(8);
        // both checkpoints have an expired snapshot
        for cp in &course {
            f.store.seed_snapshot(memory::snapshot(
                cp,
                now - Duration::hours(2),
                now - Duration::minutes(1),
                Some(LM),
                live_payload(old_run),
            ));
        }
        // Berga: new data at once. Smågan: 304, 304, then new data.
        f.provider.push(Ok(new_data(
            live_payload(now - Duration::hours(1)),
            now + Duration::hours(1),
            LM,
        )));
        f.provider.push(Ok(not_modified()));
        f.provider.push(Ok(not_modified()));
        f.provider.push(Ok(new_data(
            live_payload(now - Duration::hours(1)),
            now + Duration::hours(1),
            LM,
        )));

        f.poller.run_cycle().await;
        assert_eq!(f.provider.calls(), 4);

        let s = f.state.read().await;
        let smagan = s
            .checkpoints
            .iter()
            .find(|c| c.checkpoint_id == course[1].id)
            .unwrap();
        assert_eq!(smagan.last_outcome, PollOutcome::NewData);
    }

    #[tokio::test]
    async fn test_not_modified_gives_up_after_max_retries() {
        let mut cfg = config();
        cfg.max_retries = 2;
        let f = fixture(cfg);
        let now = Utc::now();
        let race = memory::race("Öppet spår", floor_to_hour(now + Duration::hours(12)), 90);
        let cp = memory::checkpoint(race.id, "Start", 0.0, 300.0, 0);
        f.store.add_race(race, vec![cp.clone()]);
        f.store.seed_snapshot(memory::snapshot(
            &cp,
            now - Duration::hours(2),
            now - Duration::minutes(1),
            Some(LM),
            live_payload(now - Duration::hours(3)),
        ));
        for _ in 0..4 {
            f.provider.push(Ok(not_modified()));
        }

        f.poller.run_cycle().await;
        // initial attempt + 2 retries
        assert_eq!(f.provider.calls(), 3);
        let s = f.state.read().await;
        assert_eq!(s.checkpoints[0].last_outcome, PollOutcome::NotModified);
        assert!(s.checkpoints[0].expires_at.unwrap() > now);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_does_not_abort_cycle() {
        let f = fixture(config());
        let (_, course) = add_race(&f.store, Duration::hours(12));
        // Berga: nothing cached and yr.no down. Smågan: fine.
        f.provider.push(Err(UpstreamError::Status(503)));
        f.provider.push(Ok(new_data(
            live_payload(Utc::now() - Duration::hours(2)),
            Utc::now() + Duration::minutes(20),
            LM,
        )));

        f.poller.run_cycle().await;

        let s = f.state.read().await;
        let berga = s
            .checkpoints
            .iter()
            .find(|c| c.checkpoint_id == course[0].id)
            .unwrap();
        assert_eq!(berga.last_outcome, PollOutcome::Error);
        assert!(berga.last_error.is_some());
        assert!(berga.last_failure_at.is_some());

        let smagan = s
            .checkpoints
            .iter()
            .find(|c| c.checkpoint_id == course[1].id)
            .unwrap();
        assert_eq!(smagan.last_outcome, PollOutcome::NewData);
        assert_eq!(f.store.observations().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_snapshot_recorded_as_failure() {
        let f = fixture(config());
        let (_, course) = add_race(&f.store, Duration::hours(12));
        let now = Utc::now();
        for cp in &course {
            f.store.seed_snapshot(memory::snapshot(
                cp,
                now - Duration::hours(3),
                now - Duration::hours(2),
                Some(LM),
                live_payload(now - Duration::hours(4)),
            ));
        }
        // queue empty: every call is a transport error

        f.poller.run_cycle().await;

        let s = f.state.read().await;
        assert!(s.checkpoints.iter().all(|c| c.last_outcome == PollOutcome::Stale
            && c.last_failure_at.is_some()
            && c.insert_count == 0));
        assert!(f.store.observations().is_empty());
    }
}
