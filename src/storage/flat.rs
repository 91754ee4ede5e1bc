//! Flat fallback backend.
//!
//! Used when the structured backend is unavailable. Each table lives as one JSON array
//! under a key of a simple key/value store and is rewritten on every mutation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use super::schema::{self, SCHEMA_VERSION};
use crate::errors::AppError;
use crate::models::Record;

/// Prefix of every key holding a table blob.
pub const TABLE_KEY_PREFIX: &str = "cometa.table.";
/// Key holding the applied schema version.
pub const SCHEMA_VERSION_KEY: &str = "cometa.schema_version";

/// Minimal string key/value store, the shape of a browser's local storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn set_item(&self, key: &str, value: String) -> Result<(), AppError>;
    async fn remove_item(&self, key: &str) -> Result<(), AppError>;
    async fn keys(&self) -> Result<Vec<String>, AppError>;
}

/// Process-local key/value store.
#[derive(Debug, Default)]
pub struct MemoryKv {
    items: Mutex<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        // A poisoned map is still a valid map.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get_item(&self, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.items().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), AppError> {
        self.items().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), AppError> {
        self.items().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, AppError> {
        Ok(self.items().keys().cloned().collect())
    }
}

/// Key/value store keeping one file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, AppError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, AppError> {
        let safe = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            && !key.starts_with('.');
        if !safe {
            return Err(AppError::Validation(format!("Invalid storage key: {}", key)));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl KeyValueStore for FileKv {
    async fn get_item(&self, key: &str) -> Result<Option<String>, AppError> {
        match tokio::fs::read_to_string(self.path_for(key)?).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> Result<(), AppError> {
        let path = self.path_for(key)?;
        let tmp = self.dir.join(format!("{}.tmp-write", key));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), AppError> {
        match tokio::fs::remove_file(self.path_for(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, AppError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".tmp-write") {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Record store over a `KeyValueStore`.
pub struct FlatBackend {
    kv: Arc<dyn KeyValueStore>,
    write_lock: AsyncMutex<()>,
}

impl FlatBackend {
    /// Wrap `kv` and bring it to `SCHEMA_VERSION`.
    pub async fn open(kv: Arc<dyn KeyValueStore>) -> Result<Self, AppError> {
        let backend = Self {
            kv,
            write_lock: AsyncMutex::new(()),
        };
        backend.migrate().await?;
        Ok(backend)
    }

    pub async fn schema_version(&self) -> Result<i64, AppError> {
        Ok(self
            .kv
            .get_item(SCHEMA_VERSION_KEY)
            .await?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0))
    }

    async fn migrate(&self) -> Result<(), AppError> {
        let current = self.schema_version().await?;
        for migration in schema::pending_migrations(current, SCHEMA_VERSION) {
            for table in migration.tables {
                let key = table_key(table);
                if self.kv.get_item(&key).await?.is_none() {
                    self.kv.set_item(&key, "[]".to_string()).await?;
                }
            }
            self.kv
                .set_item(SCHEMA_VERSION_KEY, migration.version.to_string())
                .await?;
            tracing::info!(version = migration.version, "Applied fallback store migration");
        }
        Ok(())
    }

    /// Records of `table`; a malformed blob reads as an empty table.
    pub async fn list(&self, table: &str) -> Result<Vec<Record>, AppError> {
        let Some(blob) = self.kv.get_item(&table_key(table)).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<Record>>(&blob) {
            Ok(records) => Ok(records),
            Err(e) => {
                tracing::warn!(table, error = %e, "Discarding malformed fallback table");
                Ok(Vec::new())
            }
        }
    }

    pub async fn get(&self, table: &str, id: &str) -> Result<Option<Record>, AppError> {
        Ok(self
            .list(table)
            .await?
            .into_iter()
            .find(|r| r.id() == Some(id)))
    }

    /// Replace the record with the same id, or append it.
    pub async fn put(&self, table: &str, record: &Record) -> Result<(), AppError> {
        let id = record.require_id(table)?;
        let _guard = self.write_lock.lock().await;

        let mut records = self.list(table).await?;
        match records.iter_mut().find(|r| r.id() == Some(id)) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.write_table(table, &records).await
    }

    pub async fn delete(&self, table: &str, id: &str) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.list(table).await?;
        records.retain(|r| r.id() != Some(id));
        self.write_table(table, &records).await
    }

    /// Remove every table blob, schema or not.
    pub async fn clear(&self) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;

        for key in self.kv.keys().await? {
            if key.starts_with(TABLE_KEY_PREFIX) {
                self.kv.remove_item(&key).await?;
            }
        }
        Ok(())
    }

    async fn write_table(&self, table: &str, records: &[Record]) -> Result<(), AppError> {
        let blob = serde_json::to_string(records)?;
        self.kv.set_item(&table_key(table), blob).await
    }
}

fn table_key(table: &str) -> String {
    format!("{}{}", TABLE_KEY_PREFIX, table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn memory_backend() -> (Arc<MemoryKv>, FlatBackend) {
        let kv = Arc::new(MemoryKv::new());
        let backend = FlatBackend::open(kv.clone()).await.unwrap();
        (kv, backend)
    }

    #[tokio::test]
    async fn test_migration_seeds_empty_tables() {
        let (kv, backend) = memory_backend().await;
        assert_eq!(backend.schema_version().await.unwrap(), SCHEMA_VERSION);
        assert_eq!(
            kv.get_item("cometa.table.scheduled-tasks").await.unwrap(),
            Some("[]".to_string())
        );
    }

    #[tokio::test]
    async fn test_migration_keeps_existing_blobs() {
        let kv = Arc::new(MemoryKv::new());
        kv.set_item("cometa.table.users", r#"[{"id":"u1"}]"#.to_string())
            .await
            .unwrap();

        let backend = FlatBackend::open(kv.clone()).await.unwrap();
        assert_eq!(backend.list("users").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_blob_reads_empty() {
        let (kv, backend) = memory_backend().await;
        kv.set_item("cometa.table.users", "{not json".to_string())
            .await
            .unwrap();

        assert!(backend.list("users").await.unwrap().is_empty());

        // Writing over a corrupt blob starts a fresh table.
        backend.put("users", &Record::new("u1")).await.unwrap();
        assert_eq!(backend.list("users").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_replaces_by_id() {
        let (_kv, backend) = memory_backend().await;
        backend
            .put("users", &Record::new("u1").with("name", "Mario"))
            .await
            .unwrap();
        backend
            .put("users", &Record::new("u1").with("name", "Luigi"))
            .await
            .unwrap();

        let records = backend.list("users").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get_str("name"), Some("Luigi"));
    }

    #[tokio::test]
    async fn test_clear_only_touches_table_keys() {
        let (kv, backend) = memory_backend().await;
        backend.put("users", &Record::new("u1")).await.unwrap();
        kv.set_item("unrelated", "keep".to_string()).await.unwrap();

        backend.clear().await.unwrap();

        assert!(backend.list("users").await.unwrap().is_empty());
        assert_eq!(kv.get_item("unrelated").await.unwrap(), Some("keep".into()));
        assert!(kv.get_item(SCHEMA_VERSION_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_kv_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(FileKv::open(temp_dir.path()).await.unwrap());
        let backend = FlatBackend::open(kv).await.unwrap();
        backend
            .put("settings", &Record::new("app").with("theme", "dark"))
            .await
            .unwrap();

        let kv = Arc::new(FileKv::open(temp_dir.path()).await.unwrap());
        let backend = FlatBackend::open(kv.clone()).await.unwrap();
        let record = backend.get("settings", "app").await.unwrap().unwrap();
        assert_eq!(record.get_str("theme"), Some("dark"));
        assert!(kv.keys().await.unwrap().contains(&"cometa.table.settings".to_string()));
    }

    #[tokio::test]
    async fn test_file_kv_rejects_path_like_keys() {
        let temp_dir = TempDir::new().unwrap();
        let kv = FileKv::open(temp_dir.path()).await.unwrap();
        assert!(kv.set_item("../escape", "x".into()).await.is_err());
    }
}
