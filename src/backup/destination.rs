//! Remembered backup destination and the permission policy around it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::host::{DirectoryHandle, FsDirectory, Permission};
use crate::errors::AppError;

/// Persists the directory the user picked across restarts.
#[async_trait]
pub trait HandleStore: Send + Sync {
    async fn save(&self, handle: Arc<dyn DirectoryHandle>) -> Result<(), AppError>;
    async fn load(&self) -> Result<Option<Arc<dyn DirectoryHandle>>, AppError>;
    async fn forget(&self) -> Result<(), AppError>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredHandle {
    backup_dir: PathBuf,
}

/// Handle store keeping the directory path in a small JSON file.
#[derive(Debug, Clone)]
pub struct FsHandleStore {
    path: PathBuf,
}

impl FsHandleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl HandleStore for FsHandleStore {
    async fn save(&self, handle: Arc<dyn DirectoryHandle>) -> Result<(), AppError> {
        let backup_dir = handle.locator().ok_or_else(|| {
            AppError::Validation("This backup destination cannot be remembered".to_string())
        })?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(&StoredHandle { backup_dir })?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Arc<dyn DirectoryHandle>>, AppError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<StoredHandle>(&bytes) {
            Ok(stored) => Ok(Some(Arc::new(FsDirectory::new(stored.backup_dir)))),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring unreadable backup handle");
                Ok(None)
            }
        }
    }

    async fn forget(&self) -> Result<(), AppError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Handle store living only as long as the process.
#[derive(Default)]
pub struct MemoryHandleStore {
    handle: Mutex<Option<Arc<dyn DirectoryHandle>>>,
}

impl MemoryHandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn DirectoryHandle>>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl HandleStore for MemoryHandleStore {
    async fn save(&self, handle: Arc<dyn DirectoryHandle>) -> Result<(), AppError> {
        *self.slot() = Some(handle);
        Ok(())
    }

    async fn load(&self) -> Result<Option<Arc<dyn DirectoryHandle>>, AppError> {
        Ok(self.slot().clone())
    }

    async fn forget(&self) -> Result<(), AppError> {
        *self.slot() = None;
        Ok(())
    }
}

/// Whether acquiring a destination may ask the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// Background use: only an already granted handle is returned
    Passive,
    /// User action: a handle in the `Prompt` state is asked for access
    Interactive,
}

pub struct BackupDestinations {
    handles: Arc<dyn HandleStore>,
    private_dir: PathBuf,
}

impl BackupDestinations {
    /// `private_dir` is used when the user asks for a destination without picking one.
    pub fn new(handles: Arc<dyn HandleStore>, private_dir: impl Into<PathBuf>) -> Self {
        Self {
            handles,
            private_dir: private_dir.into(),
        }
    }

    /// The remembered destination, if access to it is (or, interactively, becomes) granted.
    pub async fn ensure_permissions(
        &self,
        mode: PermissionMode,
    ) -> Result<Option<Arc<dyn DirectoryHandle>>, AppError> {
        let Some(handle) = self.handles.load().await? else {
            return Ok(None);
        };

        let permission = match (handle.query_permission().await, mode) {
            (Permission::Prompt, PermissionMode::Interactive) => handle.request_permission().await,
            (permission, _) => permission,
        };
        if permission == Permission::Granted {
            Ok(Some(handle))
        } else {
            tracing::debug!(?permission, ?mode, "Backup destination not usable");
            Ok(None)
        }
    }

    /// Make `picked` (or the app-private directory) the backup destination.
    /// Only called on an explicit user action.
    pub async fn request_backup_dir(
        &self,
        picked: Option<Arc<dyn DirectoryHandle>>,
    ) -> Result<Arc<dyn DirectoryHandle>, AppError> {
        let handle: Arc<dyn DirectoryHandle> = match picked {
            Some(handle) => handle,
            None => Arc::new(FsDirectory::new(&self.private_dir)),
        };
        match handle.request_permission().await {
            Permission::Granted => {}
            permission => {
                return Err(AppError::Permission(format!(
                    "Access to the backup directory was not granted ({:?})",
                    permission
                )))
            }
        }
        self.handles.save(handle.clone()).await?;
        tracing::info!(location = ?handle.locator(), "Backup destination chosen");
        Ok(handle)
    }

    /// Either destination, whichever ends up usable: the remembered one if granted,
    /// otherwise a fresh request.
    pub async fn get_or_request(&self) -> Result<Arc<dyn DirectoryHandle>, AppError> {
        match self.ensure_permissions(PermissionMode::Interactive).await? {
            Some(handle) => Ok(handle),
            None => self.request_backup_dir(None).await,
        }
    }

    pub async fn forget(&self) -> Result<(), AppError> {
        self.handles.forget().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::host::MemoryDirectory;
    use tempfile::TempDir;

    fn memory_destinations() -> (Arc<MemoryHandleStore>, BackupDestinations) {
        let handles = Arc::new(MemoryHandleStore::new());
        let destinations = BackupDestinations::new(handles.clone(), "/nonexistent/private");
        (handles, destinations)
    }

    #[tokio::test]
    async fn test_nothing_remembered_means_no_destination() {
        let (_, destinations) = memory_destinations();
        for mode in [PermissionMode::Passive, PermissionMode::Interactive] {
            assert!(destinations.ensure_permissions(mode).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_passive_mode_never_requests() {
        let (handles, destinations) = memory_destinations();
        let dir = Arc::new(MemoryDirectory::with_permission(Permission::Prompt));
        handles.save(dir.clone()).await.unwrap();

        assert!(destinations
            .ensure_permissions(PermissionMode::Passive)
            .await
            .unwrap()
            .is_none());
        assert_eq!(dir.query_permission().await, Permission::Prompt);

        assert!(destinations
            .ensure_permissions(PermissionMode::Interactive)
            .await
            .unwrap()
            .is_some());
        assert_eq!(dir.query_permission().await, Permission::Granted);
    }

    #[tokio::test]
    async fn test_denied_handle_is_skipped() {
        let (handles, destinations) = memory_destinations();
        handles
            .save(Arc::new(MemoryDirectory::with_permission(Permission::Denied)))
            .await
            .unwrap();
        assert!(destinations
            .ensure_permissions(PermissionMode::Interactive)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_request_refused_is_permission_error() {
        let (handles, destinations) = memory_destinations();
        let dir = Arc::new(MemoryDirectory::with_permission(Permission::Prompt));
        dir.set_grant_on_request(false);

        let err = destinations.request_backup_dir(Some(dir)).await.err().unwrap();
        assert!(matches!(err, AppError::Permission(_)));
        assert!(handles.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_private_dir_remembered_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let handle_file = temp_dir.path().join("backup-handle.json");
        let private = temp_dir.path().join("backups");

        let destinations = BackupDestinations::new(Arc::new(FsHandleStore::new(&handle_file)), &private);
        let chosen = destinations.request_backup_dir(None).await.unwrap();
        assert_eq!(chosen.locator(), Some(private.clone()));
        assert!(private.is_dir());

        // A fresh instance finds the same directory without asking.
        let destinations = BackupDestinations::new(Arc::new(FsHandleStore::new(&handle_file)), &private);
        let found = destinations
            .ensure_permissions(PermissionMode::Passive)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.locator(), Some(private));

        destinations.forget().await.unwrap();
        assert!(destinations
            .ensure_permissions(PermissionMode::Passive)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unrememberable_handle_rejected_by_fs_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsHandleStore::new(temp_dir.path().join("handle.json"));
        assert!(store.save(Arc::new(MemoryDirectory::new())).await.is_err());
    }
}
