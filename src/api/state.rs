//! Whole-state API endpoints.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use super::{success, ApiResult};
use crate::models::{Datastore, PartialState};
use crate::AppState;

/// Body of `PUT /api/state`.
#[derive(Debug, Deserialize)]
pub struct SaveStateRequest {
    /// What triggered the save, for logs
    #[serde(default)]
    pub reason: Option<String>,
    pub state: PartialState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStateResponse {
    pub accepted: bool,
    /// Tables queued for the next autosave
    pub tables: usize,
}

/// GET /api/state - Every table with its records.
pub async fn get_state(State(state): State<AppState>) -> ApiResult<Datastore> {
    success(state.store.load_all_tables().await?)
}

/// PUT /api/state - Queue a partial state for autosave.
pub async fn save_state(
    State(state): State<AppState>,
    Json(request): Json<SaveStateRequest>,
) -> ApiResult<SaveStateResponse> {
    state.store.maintenance().ensure_idle()?;

    let tables = request.state.len();
    let reason = request.reason.as_deref().unwrap_or("api");
    let accepted = state.autosave.notify(request.state, reason);
    success(SaveStateResponse { accepted, tables })
}

/// DELETE /api/state - Wipe every table, metadata included.
pub async fn wipe_state(State(state): State<AppState>) -> ApiResult<()> {
    // Raising the flag also drops any autosave buffered before the wipe.
    let _maintenance = state.store.maintenance().enter()?;
    state.store.clear_all().await?;
    success(())
}
