//! Per-table record endpoints.

use axum::{
    extract::{Path, State},
    Json,
};

use super::{success, ApiResult};
use crate::errors::AppError;
use crate::models::{Record, ID_FIELD};
use crate::AppState;

/// GET /api/tables/:table - List the records of a table.
pub async fn list_records(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> ApiResult<Vec<Record>> {
    success(state.store.list(&table).await?)
}

/// GET /api/tables/:table/:id - Get a single record.
pub async fn get_record(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> ApiResult<Record> {
    match state.store.get(&table, &id).await? {
        Some(record) => success(record),
        None => Err(AppError::NotFound(format!("Record {} not found in {}", id, table))),
    }
}

/// PUT /api/tables/:table/:id - Insert or overwrite a record.
pub async fn put_record(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
    Json(mut record): Json<Record>,
) -> ApiResult<Record> {
    state.store.maintenance().ensure_idle()?;

    match record.id() {
        Some(body_id) if body_id != id => {
            return Err(AppError::Validation(format!(
                "Record id {} does not match path id {}",
                body_id, id
            )));
        }
        Some(_) => {}
        None => record.set(ID_FIELD, id),
    }

    success(state.store.upsert(&table, record).await?)
}

/// DELETE /api/tables/:table/:id - Remove a record.
pub async fn delete_record(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> ApiResult<()> {
    state.store.maintenance().ensure_idle()?;
    state.store.remove(&table, &id).await?;
    success(())
}
