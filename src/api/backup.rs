//! Backup API endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Local;
use serde::{Deserialize, Serialize};

use super::{success, ApiResult};
use crate::backup::archive::backup_file_name;
use crate::backup::destination::PermissionMode;
use crate::backup::host::{DirectoryHandle, FsDirectory};
use crate::backup::scheduler::{BackupOutcome, BackupStatus, Wake};
use crate::backup::{ImportOptions, ImportSummary};
use crate::errors::AppError;
use crate::models::BackupManifest;
use crate::AppState;

/// `?merge=` on import routes.
#[derive(Debug, Default, Deserialize)]
pub struct ImportQuery {
    #[serde(default)]
    pub merge: bool,
}

impl From<ImportQuery> for ImportOptions {
    fn from(query: ImportQuery) -> Self {
        ImportOptions { merge: query.merge }
    }
}

/// Body of `POST /api/backup/directory`.
#[derive(Debug, Default, Deserialize)]
pub struct ChooseDirectoryRequest {
    /// Directory the user picked; the app-private directory when absent
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationResponse {
    pub location: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FrequencyRequest {
    pub days: u32,
}

#[derive(Debug, Deserialize)]
pub struct WakeRequest {
    pub event: Wake,
}

/// GET /api/backup/archive - Download the whole state as one archive.
pub async fn export_archive(State(state): State<AppState>) -> Result<Response, AppError> {
    let archive = state.backup.export_backup().await?;
    let file_name = backup_file_name(
        "backup",
        Local::now().naive_local(),
        state.backup.archive_extension(),
    );
    let disposition = format!("attachment; filename=\"{}\"", file_name);

    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        archive,
    )
        .into_response())
}

/// POST /api/backup/archive - Restore from an uploaded archive.
pub async fn import_archive(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
    body: Bytes,
) -> ApiResult<ImportSummary> {
    success(state.backup.import_from_archive(&body, query.into()).await?)
}

/// POST /api/backup/directory - Choose the backup destination (explicit user action).
pub async fn choose_directory(
    State(state): State<AppState>,
    Json(request): Json<ChooseDirectoryRequest>,
) -> ApiResult<DestinationResponse> {
    let picked = request
        .path
        .map(|path| -> Arc<dyn DirectoryHandle> { Arc::new(FsDirectory::new(path)) });
    let handle = state.destinations.request_backup_dir(picked).await?;
    success(DestinationResponse {
        location: handle.locator().map(|p| p.display().to_string()),
    })
}

/// POST /api/backup/directory/export - Write a backup into the chosen directory.
pub async fn export_directory(State(state): State<AppState>) -> ApiResult<BackupManifest> {
    let dir = state.destinations.get_or_request().await?;
    success(state.backup.export_to_directory(dir.as_ref()).await?)
}

/// POST /api/backup/directory/import - Restore from the chosen directory.
pub async fn import_directory(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
) -> ApiResult<ImportSummary> {
    let dir = state
        .destinations
        .ensure_permissions(PermissionMode::Interactive)
        .await?
        .ok_or_else(|| AppError::Permission("No backup directory has been chosen".to_string()))?;
    success(state.backup.import_from_directory(dir.as_ref(), query.into()).await?)
}

/// POST /api/backup/run - Run the scheduled backup check now.
pub async fn run_backup(State(state): State<AppState>) -> ApiResult<BackupOutcome> {
    success(state.scheduler.run_scheduled_backup().await)
}

/// PUT /api/backup/frequency - Change the backup cadence.
pub async fn set_frequency(
    State(state): State<AppState>,
    Json(request): Json<FrequencyRequest>,
) -> ApiResult<BackupStatus> {
    state.scheduler.set_backup_frequency(request.days).await?;
    success(state.scheduler.backup_status().await?)
}

/// GET /api/backup/status - Last backup, cadence and destination usage.
pub async fn backup_status(State(state): State<AppState>) -> ApiResult<BackupStatus> {
    success(state.scheduler.backup_status().await?)
}

/// POST /api/backup/wake - The UI regained focus or visibility.
pub async fn wake(State(state): State<AppState>, Json(request): Json<WakeRequest>) -> ApiResult<Wake> {
    state.triggers.fire(request.event);
    success(request.event)
}
