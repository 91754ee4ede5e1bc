//! Tiered record store.
//!
//! SQLite is the source of truth when it can be opened; otherwise the process runs on
//! the flat key/value fallback for its whole lifetime. Both tiers expose the same
//! record contract.

mod flat;
mod maintenance;
pub mod schema;
mod sqlite;

pub use flat::*;
pub use maintenance::*;
pub use sqlite::*;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::config::{BackendPreference, Config};
use crate::errors::AppError;
use crate::models::{Datastore, Record, LAST_MODIFIED_FIELD};

/// Which tier is serving the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Structured,
    Flat,
}

enum Backend {
    Structured(SqliteBackend),
    Flat(FlatBackend),
}

/// The record store shared by autosave, backup and the HTTP surface.
pub struct TieredStore {
    backend: Backend,
    maintenance: MaintenanceGate,
    last_stamp: AtomicI64,
}

impl TieredStore {
    /// Open the store the configuration asks for.
    pub async fn open(config: &Config) -> Result<Self, AppError> {
        if config.backend == BackendPreference::Auto {
            match SqliteBackend::open(&config.db_path).await {
                Ok(backend) => {
                    tracing::info!(path = %config.db_path.display(), "Using structured store");
                    return Ok(Self::with_backend(Backend::Structured(backend)));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Structured store unavailable, using flat fallback");
                }
            }
        }

        tracing::info!(path = %config.fallback_dir.display(), "Using flat fallback store");
        let kv = FileKv::open(&config.fallback_dir).await?;
        Self::flat(Arc::new(kv)).await
    }

    /// Store on the structured tier only.
    pub async fn structured(db_path: &std::path::Path) -> Result<Self, AppError> {
        let backend = SqliteBackend::open(db_path).await?;
        Ok(Self::with_backend(Backend::Structured(backend)))
    }

    /// Store on the flat tier over `kv`.
    pub async fn flat(kv: Arc<dyn KeyValueStore>) -> Result<Self, AppError> {
        let backend = FlatBackend::open(kv).await?;
        Ok(Self::with_backend(Backend::Flat(backend)))
    }

    /// In-memory flat store.
    pub async fn in_memory() -> Result<Self, AppError> {
        Self::flat(Arc::new(MemoryKv::new())).await
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            maintenance: MaintenanceGate::new(),
            last_stamp: AtomicI64::new(0),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self.backend {
            Backend::Structured(_) => BackendKind::Structured,
            Backend::Flat(_) => BackendKind::Flat,
        }
    }

    pub fn maintenance(&self) -> &MaintenanceGate {
        &self.maintenance
    }

    /// Wall-clock milliseconds, never below a previously issued stamp.
    fn stamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self.last_stamp.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }

    /// Insert or overwrite `record` by id, stamping `lastModified`.
    pub async fn upsert(&self, table: &str, mut record: Record) -> Result<Record, AppError> {
        ensure_known(table)?;
        record.require_id(table)?;
        record.set(LAST_MODIFIED_FIELD, self.stamp());
        match &self.backend {
            Backend::Structured(b) => b.put(table, &record).await?,
            Backend::Flat(b) => b.put(table, &record).await?,
        }
        Ok(record)
    }

    pub async fn remove(&self, table: &str, id: &str) -> Result<(), AppError> {
        ensure_known(table)?;
        match &self.backend {
            Backend::Structured(b) => b.delete(table, id).await,
            Backend::Flat(b) => b.delete(table, id).await,
        }
    }

    pub async fn get(&self, table: &str, id: &str) -> Result<Option<Record>, AppError> {
        ensure_known(table)?;
        match &self.backend {
            Backend::Structured(b) => b.get(table, id).await,
            Backend::Flat(b) => b.get(table, id).await,
        }
    }

    pub async fn list(&self, table: &str) -> Result<Vec<Record>, AppError> {
        ensure_known(table)?;
        match &self.backend {
            Backend::Structured(b) => b.list(table).await,
            Backend::Flat(b) => b.list(table).await,
        }
    }

    /// Delete every record of every table, metadata included.
    pub async fn clear_all(&self) -> Result<(), AppError> {
        match &self.backend {
            Backend::Structured(b) => b.clear().await?,
            Backend::Flat(b) => b.clear().await?,
        }
        tracing::info!("Store cleared");
        Ok(())
    }

    /// Every schema table with its records.
    pub async fn load_all_tables(&self) -> Result<Datastore, AppError> {
        let mut datastore = Datastore::new();
        for table in schema::TABLES {
            datastore.insert(*table, self.list(table).await?);
        }
        Ok(datastore)
    }
}

fn ensure_known(table: &str) -> Result<(), AppError> {
    if schema::is_known_table(table) {
        Ok(())
    } else {
        Err(AppError::UnknownTable(table.to_string()))
    }
}
