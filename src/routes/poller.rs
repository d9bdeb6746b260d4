//! Poller status HTTP endpoint.
//!
//! GET /api/v1/poller/status returns the in-memory state of the background
//! forecast poller as JSON.

use axum::extract::State;
use axum::Json;

use crate::services::poller::{PollerState, SharedPollerState};

/// Get the current poller status.
///
/// Global info (phase, last cycle timing, next wakeup, enabled) plus one
/// entry per tracked checkpoint (expiry, last outcome, last success and
/// failure, extraction and insert counts).
#[utoipa::path(
    get,
    path = "/api/v1/poller/status",
    tag = "Poller",
    responses(
        (status = 200, description = "Current poller status", body = PollerState),
    )
)]
pub async fn get_poller_status(State(state): State<SharedPollerState>) -> Json<PollerState> {
    let s = state.read().await;
    Json(s.clone())
}
