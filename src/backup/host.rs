//! Directory capability the host grants for backups.
//!
//! A handle is opaque to the pipeline: it can read, write and enumerate files by
//! relative path, and it reports whether the user has granted access to it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::AppError;

/// Access state of a handle, as the host reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Granted,
    /// Access can be requested, which may involve the user
    Prompt,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Byte length for files, 0 for directories
    pub size: u64,
}

#[async_trait]
pub trait DirectoryHandle: Send + Sync {
    /// Bytes of the file at `path`.
    async fn read(&self, path: &str) -> Result<Vec<u8>, AppError>;

    /// Create or replace the file at `path`, creating parent directories.
    async fn write(&self, path: &str, data: &[u8]) -> Result<(), AppError>;

    /// Direct children of the directory at `dir` (`""` for the root).
    async fn enumerate(&self, dir: &str) -> Result<Vec<DirEntry>, AppError>;

    async fn query_permission(&self) -> Permission;

    /// Ask for read/write access. Only called on an explicit user action.
    async fn request_permission(&self) -> Permission;

    /// Filesystem location, for handles that can be remembered across restarts.
    fn locator(&self) -> Option<PathBuf> {
        None
    }
}

/// Check that `path` is relative, `/`-separated and free of `.`/`..`/empty segments.
pub fn validate_path(path: &str) -> Result<(), AppError> {
    let valid = !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!("Invalid backup path: {}", path)))
    }
}

/// Sum of every file size below the handle's root.
pub async fn total_size(handle: &dyn DirectoryHandle) -> Result<u64, AppError> {
    let mut total = 0;
    let mut pending = vec![String::new()];
    while let Some(dir) = pending.pop() {
        for entry in handle.enumerate(&dir).await? {
            let path = if dir.is_empty() {
                entry.name
            } else {
                format!("{}/{}", dir, entry.name)
            };
            match entry.kind {
                EntryKind::File => total += entry.size,
                EntryKind::Directory => pending.push(path),
            }
        }
    }
    Ok(total)
}

/// Directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, AppError> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.root.clone(), |acc, seg| acc.join(seg)))
    }
}

#[async_trait]
impl DirectoryHandle for FsDirectory {
    async fn read(&self, path: &str) -> Result<Vec<u8>, AppError> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::NotFound(format!("{} not found", path)),
            _ => e.into(),
        })
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), AppError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = full.clone().into_os_string();
        tmp.push(".partial");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &full).await?;
        Ok(())
    }

    async fn enumerate(&self, dir: &str) -> Result<Vec<DirEntry>, AppError> {
        let full = if dir.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir)?
        };

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&full).await?;
        while let Some(entry) = reader.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let metadata = entry.metadata().await?;
            let kind = if metadata.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            entries.push(DirEntry {
                name,
                kind,
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn query_permission(&self) -> Permission {
        match tokio::fs::metadata(&self.root).await {
            Ok(metadata) if metadata.is_dir() && !metadata.permissions().readonly() => {
                Permission::Granted
            }
            Ok(_) => Permission::Denied,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Permission::Prompt,
            Err(_) => Permission::Denied,
        }
    }

    async fn request_permission(&self) -> Permission {
        if let Err(e) = tokio::fs::create_dir_all(&self.root).await {
            tracing::warn!(path = %self.root.display(), error = %e, "Backup directory not accessible");
            return Permission::Denied;
        }
        self.query_permission().await
    }

    fn locator(&self) -> Option<PathBuf> {
        Some(self.root.clone())
    }
}

/// Directory kept in memory, with a settable permission state.
#[derive(Debug)]
pub struct MemoryDirectory {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    permission: Mutex<Permission>,
    grant_on_request: AtomicBool,
    writes: AtomicUsize,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::with_permission(Permission::Granted)
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_permission(permission: Permission) -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            permission: Mutex::new(permission),
            grant_on_request: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn set_permission(&self, permission: Permission) {
        *self.permission.lock().unwrap_or_else(|e| e.into_inner()) = permission;
    }

    /// Whether a request from the `Prompt` state ends up granted.
    pub fn set_grant_on_request(&self, grant: bool) {
        self.grant_on_request.store(grant, Ordering::SeqCst);
    }

    /// Number of successful `write` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        self.files().keys().cloned().collect()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files().get(path).cloned()
    }

    /// Overwrite a file without going through `write` or counting it.
    pub fn replace_file(&self, path: &str, data: Vec<u8>) {
        self.files().insert(path.to_string(), data);
    }

    fn files(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn permission(&self) -> Permission {
        *self.permission.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DirectoryHandle for MemoryDirectory {
    async fn read(&self, path: &str) -> Result<Vec<u8>, AppError> {
        validate_path(path)?;
        self.file(path)
            .ok_or_else(|| AppError::NotFound(format!("{} not found", path)))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<(), AppError> {
        validate_path(path)?;
        if self.permission() != Permission::Granted {
            return Err(AppError::Permission("Backup directory is not writable".to_string()));
        }
        self.files().insert(path.to_string(), data.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn enumerate(&self, dir: &str) -> Result<Vec<DirEntry>, AppError> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            validate_path(dir)?;
            format!("{}/", dir)
        };

        let mut children: BTreeMap<String, DirEntry> = BTreeMap::new();
        for (path, data) in self.files().iter() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            let entry = match rest.split_once('/') {
                Some((child, _)) => DirEntry {
                    name: child.to_string(),
                    kind: EntryKind::Directory,
                    size: 0,
                },
                None => DirEntry {
                    name: rest.to_string(),
                    kind: EntryKind::File,
                    size: data.len() as u64,
                },
            };
            children.entry(entry.name.clone()).or_insert(entry);
        }
        Ok(children.into_values().collect())
    }

    async fn query_permission(&self) -> Permission {
        self.permission()
    }

    async fn request_permission(&self) -> Permission {
        if self.permission() == Permission::Prompt && self.grant_on_request.load(Ordering::SeqCst) {
            self.set_permission(Permission::Granted);
        }
        self.permission()
    }
}
