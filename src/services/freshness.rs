//! Keeps each checkpoint's upstream snapshot fresh.
//!
//! A snapshot is reused until its `Expires` instant. After that a conditional
//! request is made with the stored `Last-Modified`; a 304 only bumps the
//! expiry, a 200 replaces the row. If yr.no cannot be reached, whatever is
//! cached is served as a degraded result instead of failing the read.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::config::YrConfig;
use crate::db::models::{Checkpoint, NewSnapshot};
use crate::db::SnapshotStore;
use crate::services::yr::{Location, UpstreamError, UpstreamProvider, UpstreamResponse};
use crate::services::ForecastError;

/// How a snapshot was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessOutcome {
    /// Non-expired snapshot, no network call.
    CacheHit,
    /// HTTP 200, snapshot replaced.
    Refetched,
    /// HTTP 304, expiry extended.
    NotModified,
    /// Upstream failed, expired snapshot served.
    StaleFallback,
}

impl FreshnessOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            FreshnessOutcome::CacheHit => "cache_hit",
            FreshnessOutcome::Refetched => "refetched",
            FreshnessOutcome::NotModified => "not_modified",
            FreshnessOutcome::StaleFallback => "stale_fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FreshSnapshot {
    pub payload: serde_json::Value,
    /// Served from an expired snapshot because the refresh failed.
    pub degraded: bool,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub outcome: FreshnessOutcome,
}

#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    /// Bound on a single upstream call.
    pub request_timeout: Duration,
    /// Expiry used when a 200 carries no usable `Expires`.
    pub default_expiry: chrono::Duration,
    /// Expiry extension applied on a 304.
    pub not_modified_extension: chrono::Duration,
}

impl From<&YrConfig> for FreshnessPolicy {
    fn from(c: &YrConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(c.timeout_secs),
            default_expiry: chrono::Duration::seconds(c.default_expiry_secs),
            not_modified_extension: chrono::Duration::seconds(c.not_modified_extension_secs),
        }
    }
}

#[derive(Clone)]
pub struct CacheFreshnessManager {
    store: Arc<dyn SnapshotStore>,
    provider: Arc<dyn UpstreamProvider>,
    policy: FreshnessPolicy,
}

impl CacheFreshnessManager {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        provider: Arc<dyn UpstreamProvider>,
        policy: FreshnessPolicy,
    ) -> Self {
        Self {
            store,
            provider,
            policy,
        }
    }

    /// Return a usable snapshot, refreshing it from yr.no when expired.
    pub async fn ensure_fresh(&self, checkpoint: &Checkpoint) -> Result<FreshSnapshot, ForecastError> {
        let now = Utc::now();
        if let Some(snapshot) = self.store.fresh_snapshot(checkpoint.id, now).await? {
            tracing::debug!(
                checkpoint_id = %checkpoint.id,
                expires_at = %snapshot.expires_at,
                "yr.no cache hit"
            );
            return Ok(FreshSnapshot {
                payload: snapshot.raw_response,
                degraded: false,
                fetched_at: snapshot.fetched_at,
                expires_at: snapshot.expires_at,
                outcome: FreshnessOutcome::CacheHit,
            });
        }
        self.revalidate(checkpoint).await
    }

    /// Conditional fetch regardless of the stored expiry.
    pub async fn revalidate(&self, checkpoint: &Checkpoint) -> Result<FreshSnapshot, ForecastError> {
        let cached = self.store.latest_snapshot(checkpoint.id).await?;
        let validator = cached.as_ref().and_then(|s| s.last_modified.as_deref());
        let location = Location::of_checkpoint(checkpoint);

        let result = match tokio::time::timeout(
            self.policy.request_timeout,
            self.provider.fetch(&location, validator),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(UpstreamError::Timeout(self.policy.request_timeout)),
        };

        let now = Utc::now();
        match result {
            Ok(UpstreamResponse::NewData {
                payload,
                expires,
                validator,
            }) => {
                let expires_at = expires.unwrap_or(now + self.policy.default_expiry);
                let row = self
                    .store
                    .replace_snapshot(NewSnapshot {
                        checkpoint_id: checkpoint.id,
                        latitude: checkpoint.latitude,
                        longitude: checkpoint.longitude,
                        elevation_m: checkpoint.elevation_m,
                        fetched_at: now,
                        expires_at,
                        last_modified: validator,
                        raw_response: payload,
                    })
                    .await?;
                tracing::info!(
                    checkpoint_id = %checkpoint.id,
                    checkpoint = %checkpoint.name,
                    %expires_at,
                    "stored new yr.no timeseries"
                );
                Ok(FreshSnapshot {
                    payload: row.raw_response,
                    degraded: false,
                    fetched_at: row.fetched_at,
                    expires_at: row.expires_at,
                    outcome: FreshnessOutcome::Refetched,
                })
            }
            Ok(UpstreamResponse::NotModified { expires, validator }) => {
                let Some(snapshot) = cached else {
                    tracing::error!(
                        checkpoint_id = %checkpoint.id,
                        "yr.no answered 304 but no snapshot is cached"
                    );
                    return Err(ForecastError::ProtocolViolation(checkpoint.id));
                };

                let expires_at = now + self.policy.not_modified_extension;
                let updated = self
                    .store
                    .extend_expiry(checkpoint.id, expires_at, validator.as_deref())
                    .await?;
                if !updated {
                    tracing::error!(
                        checkpoint_id = %checkpoint.id,
                        "snapshot vanished while handling 304"
                    );
                    return Err(ForecastError::ProtocolViolation(checkpoint.id));
                }
                tracing::debug!(
                    checkpoint_id = %checkpoint.id,
                    %expires_at,
                    upstream_expires = ?expires,
                    "yr.no data not modified, extended expiry"
                );
                Ok(FreshSnapshot {
                    payload: snapshot.raw_response,
                    degraded: false,
                    fetched_at: snapshot.fetched_at,
                    expires_at,
                    outcome: FreshnessOutcome::NotModified,
                })
            }
            Err(e) => match cached {
                Some(snapshot) => {
                    tracing::warn!(
                        checkpoint_id = %checkpoint.id,
                        error = %e,
                        fetched_at = %snapshot.fetched_at,
                        "yr.no unreachable, serving stale snapshot"
                    );
                    Ok(FreshSnapshot {
                        payload: snapshot.raw_response,
                        degraded: true,
                        fetched_at: snapshot.fetched_at,
                        expires_at: snapshot.expires_at,
                        outcome: FreshnessOutcome::StaleFallback,
                    })
                }
                None => Err(ForecastError::UpstreamUnavailable {
                    checkpoint_id: checkpoint.id,
                    source: e,
                }),
            },
        }
    }
}
