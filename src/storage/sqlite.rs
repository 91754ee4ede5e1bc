//! Structured backend on SQLite.
//!
//! Every schema table maps to one SQLite table holding the record JSON keyed by id.
//! Writes within a table are serialized by SQLite's transactions.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};

use super::schema::{self, SCHEMA_VERSION};
use crate::errors::AppError;
use crate::models::Record;

/// Open the connection pool for the database at `db_path`.
pub async fn open_pool(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// SQLite-backed record store.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open the database and migrate it to `SCHEMA_VERSION`.
    pub async fn open(db_path: &Path) -> Result<Self, AppError> {
        let pool = open_pool(db_path).await?;
        let backend = Self { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    /// Version recorded by the last applied migration, 0 for a fresh database.
    pub async fn schema_version(&self) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT schema_version FROM store_meta WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("schema_version")).unwrap_or(0))
    }

    async fn migrate(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                schema_version INTEGER NOT NULL,
                migrated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let current = self.schema_version().await?;
        let pending = schema::pending_migrations(current, SCHEMA_VERSION);
        if pending.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for migration in pending {
            for table in migration.tables {
                create_table(&mut tx, table).await?;
            }
            sqlx::query(
                r#"
                INSERT INTO store_meta (id, schema_version, migrated_at) VALUES (1, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    schema_version = excluded.schema_version,
                    migrated_at = excluded.migrated_at
                "#,
            )
            .bind(migration.version)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
            tracing::info!(version = migration.version, "Applied store migration");
        }
        tx.commit().await?;

        Ok(())
    }

    /// Insert or replace a record by id.
    pub async fn put(&self, table: &str, record: &Record) -> Result<(), AppError> {
        let ident = table_ident(table)?;
        let id = record.require_id(table)?;
        let data = serde_json::to_string(record)?;
        let last_modified = record.last_modified().unwrap_or(0);

        sqlx::query(&format!(
            "INSERT INTO {ident} (id, data, last_modified) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, last_modified = excluded.last_modified"
        ))
        .bind(id)
        .bind(&data)
        .bind(last_modified)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete(&self, table: &str, id: &str) -> Result<(), AppError> {
        let ident = table_ident(table)?;
        sqlx::query(&format!("DELETE FROM {ident} WHERE id = ?"))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, table: &str, id: &str) -> Result<Option<Record>, AppError> {
        let ident = table_ident(table)?;
        let row = sqlx::query(&format!("SELECT data FROM {ident} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| record_from_row(table, &r)).transpose()
    }

    /// All records of `table`, ordered by id.
    pub async fn list(&self, table: &str) -> Result<Vec<Record>, AppError> {
        let ident = table_ident(table)?;
        let rows = sqlx::query(&format!("SELECT data FROM {ident} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|r| record_from_row(table, r)).collect()
    }

    /// Empty every schema table in one transaction.
    pub async fn clear(&self) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        for table in schema::TABLES {
            let ident = table_ident(table)?;
            sqlx::query(&format!("DELETE FROM {ident}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn create_table(tx: &mut Transaction<'_, Sqlite>, table: &str) -> Result<(), AppError> {
    let ident = table_ident(table)?;
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {ident} (\
            id TEXT PRIMARY KEY, \
            data TEXT NOT NULL, \
            last_modified INTEGER NOT NULL\
        )"
    ))
    .execute(&mut **tx)
    .await?;
    tracing::debug!(table, "Created store table");
    Ok(())
}

/// Quoted SQL identifier for a schema table. Only schema names reach SQL text.
fn table_ident(table: &str) -> Result<String, AppError> {
    if !schema::is_known_table(table) {
        return Err(AppError::UnknownTable(table.to_string()));
    }
    Ok(format!("\"{}\"", table))
}

fn record_from_row(table: &str, row: &sqlx::sqlite::SqliteRow) -> Result<Record, AppError> {
    let data: String = row.get("data");
    serde_json::from_str(&data).map_err(|e| {
        AppError::Database(format!("Corrupt record in table {}: {}", table, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migration_creates_tables_once() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("store.sqlite");

        let backend = SqliteBackend::open(&db_path).await.unwrap();
        assert_eq!(backend.schema_version().await.unwrap(), SCHEMA_VERSION);
        backend
            .put("scheduled-tasks", &Record::new("t1").with("lastModified", 1))
            .await
            .unwrap();
        drop(backend);

        // Reopening at the target version must not touch existing data.
        let backend = SqliteBackend::open(&db_path).await.unwrap();
        assert_eq!(backend.list("scheduled-tasks").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_table_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(&temp_dir.path().join("store.sqlite"))
            .await
            .unwrap();

        let err = backend.put("rooms", &Record::new("r1")).await.unwrap_err();
        assert!(matches!(err, AppError::UnknownTable(_)));
        assert!(backend.list("users\"; DROP TABLE users; --").await.is_err());
    }

    #[tokio::test]
    async fn test_list_orders_by_id() {
        let temp_dir = TempDir::new().unwrap();
        let backend = SqliteBackend::open(&temp_dir.path().join("store.sqlite"))
            .await
            .unwrap();

        for id in ["b", "c", "a"] {
            backend.put("users", &Record::new(id)).await.unwrap();
        }
        let ids: Vec<String> = backend
            .list("users")
            .await
            .unwrap()
            .iter()
            .map(|r| r.id().unwrap().to_string())
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }
}
