//! Persistence seams.
//!
//! Correctness under concurrent readers and the poller comes from the
//! database's own upsert / insert-if-absent semantics, not from in-process
//! locks, so every write below is a single atomic statement.

pub mod models;
pub mod queries;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use models::{Checkpoint, ForecastObservation, NewObservation, NewSnapshot, Race, UpstreamSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(test)]
    #[error("injected store failure: {0}")]
    Injected(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A race with its checkpoints in course order.
#[derive(Debug, Clone)]
pub struct RaceWithCheckpoints {
    pub race: Race,
    pub checkpoints: Vec<Checkpoint>,
}

/// Snapshot-per-checkpoint cache of the upstream timeseries.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The snapshot for `checkpoint_id` if it expires after `now`.
    async fn fresh_snapshot(
        &self,
        checkpoint_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<UpstreamSnapshot>>;

    /// The snapshot for `checkpoint_id` regardless of expiry.
    async fn latest_snapshot(&self, checkpoint_id: Uuid) -> StoreResult<Option<UpstreamSnapshot>>;

    /// Insert or wholesale-replace the checkpoint's snapshot.
    async fn replace_snapshot(&self, snapshot: NewSnapshot) -> StoreResult<UpstreamSnapshot>;

    /// Metadata-only write after a 304. A `None` validator keeps the stored one.
    /// Returns `false` when no snapshot row exists.
    async fn extend_expiry(
        &self,
        checkpoint_id: Uuid,
        expires_at: DateTime<Utc>,
        last_modified: Option<&str>,
    ) -> StoreResult<bool>;

    async fn earliest_expiry(&self, checkpoint_ids: &[Uuid]) -> StoreResult<Option<DateTime<Utc>>>;
}

/// Append-only forecast history.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Insert unless an equivalent row exists. `Ok(false)` on a dedup collision.
    async fn insert_if_absent(&self, observation: NewObservation) -> StoreResult<bool>;

    /// All model-run versions of the slot nearest `near` (within `window_hours`),
    /// one per effective run instant, oldest first.
    async fn history(
        &self,
        checkpoint_id: Uuid,
        near: DateTime<Utc>,
        window_hours: i64,
        limit: i64,
    ) -> StoreResult<Vec<ForecastObservation>>;
}

/// Read-only view of races and checkpoints owned by the seeding pipeline.
#[async_trait]
pub trait RaceCatalog: Send + Sync {
    async fn race(&self, race_id: Uuid) -> StoreResult<Option<Race>>;

    async fn checkpoint(&self, checkpoint_id: Uuid) -> StoreResult<Option<Checkpoint>>;

    /// Checkpoints of a race ordered by `sort_order`.
    async fn checkpoints(&self, race_id: Uuid) -> StoreResult<Vec<Checkpoint>>;

    /// Races whose start date is today or later and that start within
    /// `lookahead_days` of `now`, with their checkpoints.
    async fn upcoming_races(
        &self,
        now: DateTime<Utc>,
        lookahead_days: i64,
    ) -> StoreResult<Vec<RaceWithCheckpoints>>;
}
