pub mod extractor;
pub mod forecast;
pub mod freshness;
pub mod history;
pub mod pacing;
pub mod poller;
pub mod yr;

#[cfg(test)]
pub mod testing;

use uuid::Uuid;

use crate::db::StoreError;
use extractor::DecodeError;
use yr::UpstreamError;

/// Failures of the forecast resolution pipeline.
///
/// An out-of-tolerance instant and a dedup collision are not errors; they
/// surface as `forecast_available = false` and `recorded = false`.
#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    #[error("yr.no unavailable for checkpoint {checkpoint_id} and nothing cached: {source}")]
    UpstreamUnavailable {
        checkpoint_id: Uuid,
        #[source]
        source: UpstreamError,
    },

    #[error("yr.no answered 304 for checkpoint {0} but no snapshot is stored")]
    ProtocolViolation(Uuid),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("checkpoint {0} not found")]
    CheckpointNotFound(Uuid),

    #[error("race {0} not found")]
    RaceNotFound(Uuid),

    #[error("target_duration_hours must be a finite number in (0, {max}], got {value}")]
    InvalidDuration { value: f64, max: f64 },
}
