//! Backup export and restore.
//!
//! A backup is a set of files plus `backup-manifest.json`, which lists the SHA-256 of
//! every other file. Exports write the manifest last. Restores hold the maintenance
//! flag throughout and verify every listed file before touching a single table.

pub mod archive;
pub mod destination;
pub mod host;
pub mod layout;
pub mod scheduler;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::digest;
use crate::errors::AppError;
use crate::models::{BackupManifest, Record};
use crate::storage::TieredStore;

use archive::{ArchiveCodec, BackupFile, GzipJsonArchive};
use host::{validate_path, DirectoryHandle};
use layout::{FileSet, TableCodec, Target, MANIFEST_PATH};

/// Manifest schema this build writes and the newest it can read.
pub const BACKUP_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Upsert on top of the current state instead of clearing it first
    pub merge: bool,
}

/// What a restore wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub merged: bool,
    /// Records restored per table, attachments excluded
    pub tables: BTreeMap<String, usize>,
    pub attachments: usize,
}

/// Where a restore reads its files from.
enum Source<'a> {
    Files(FileSet),
    Directory(&'a dyn DirectoryHandle),
}

impl Source<'_> {
    async fn read(&self, path: &str) -> Result<Vec<u8>, AppError> {
        match self {
            Source::Files(files) => files
                .get(path)
                .cloned()
                .ok_or_else(|| AppError::integrity(path, "file listed in the manifest is missing")),
            Source::Directory(handle) => handle.read(path).await.map_err(|e| match e {
                AppError::NotFound(_) => {
                    AppError::integrity(path, "file listed in the manifest is missing")
                }
                other => other,
            }),
        }
    }
}

pub struct BackupService {
    store: Arc<TieredStore>,
    archive: Arc<dyn ArchiveCodec>,
    codecs: Vec<Box<dyn TableCodec>>,
    app_version: String,
}

impl BackupService {
    pub fn new(store: Arc<TieredStore>, app_version: impl Into<String>) -> Self {
        Self::with_archive(store, Arc::new(GzipJsonArchive), app_version)
    }

    pub fn with_archive(
        store: Arc<TieredStore>,
        archive: Arc<dyn ArchiveCodec>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            archive,
            codecs: layout::default_codecs(),
            app_version: app_version.into(),
        }
    }

    pub fn archive_extension(&self) -> &'static str {
        self.archive.extension()
    }

    /// Every data file for `target`, followed by the manifest describing them.
    pub async fn build_files(&self, target: Target) -> Result<(Vec<BackupFile>, BackupManifest), AppError> {
        let state = self.store.load_all_tables().await?;
        let mut manifest = BackupManifest::new(
            BACKUP_SCHEMA_VERSION,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            self.app_version.clone(),
        );

        let mut files = Vec::new();
        for (table, records) in state.tables() {
            let Some(codec) = self.codec_for(table) else {
                tracing::warn!(table, "No backup layout for table, skipping");
                continue;
            };
            for file in codec.encode(records, target)? {
                manifest.push(file.path.clone(), digest::sha256_hex(&file.data));
                files.push(file);
            }
        }

        files.push(BackupFile::new(
            MANIFEST_PATH,
            serde_json::to_vec_pretty(&manifest)?,
        ));
        Ok((files, manifest))
    }

    /// Whole state as a single archive.
    pub async fn export_backup(&self) -> Result<Vec<u8>, AppError> {
        let (files, manifest) = self.build_files(Target::Archive).await?;
        let archive = self.archive.pack(&files)?;
        tracing::info!(files = manifest.files.len(), bytes = archive.len(), "Backup archive exported");
        Ok(archive)
    }

    /// Write the backup tree into `dir`. The manifest is written after every data file.
    pub async fn export_to_directory(&self, dir: &dyn DirectoryHandle) -> Result<BackupManifest, AppError> {
        let (files, manifest) = self.build_files(Target::Directory).await?;
        for file in &files {
            dir.write(&file.path, &file.data).await?;
        }
        tracing::info!(files = manifest.files.len(), "Backup written to directory");
        Ok(manifest)
    }

    pub async fn import_from_archive(
        &self,
        archive: &[u8],
        options: ImportOptions,
    ) -> Result<ImportSummary, AppError> {
        let _maintenance = self.store.maintenance().enter()?;
        let files = self
            .archive
            .unpack(archive)?
            .into_iter()
            .map(|f| (f.path, f.data))
            .collect();
        self.restore(Source::Files(files), options).await
    }

    pub async fn import_from_directory(
        &self,
        dir: &dyn DirectoryHandle,
        options: ImportOptions,
    ) -> Result<ImportSummary, AppError> {
        let _maintenance = self.store.maintenance().enter()?;
        self.restore(Source::Directory(dir), options).await
    }

    /// Runs with the maintenance flag already raised by the caller.
    async fn restore(&self, source: Source<'_>, options: ImportOptions) -> Result<ImportSummary, AppError> {
        let manifest = read_manifest(&source).await?;
        let verified = verify_files(&source, &manifest).await?;
        let plan = self.plan(&verified)?;

        if !options.merge {
            self.store.clear_all().await?;
        }

        let mut summary = ImportSummary {
            merged: options.merge,
            ..Default::default()
        };
        for (table, records) in plan {
            let count = records.len();
            for record in records {
                self.store.upsert(table, record).await?;
            }
            if table == crate::storage::schema::ATTACHMENTS {
                summary.attachments += count;
            } else {
                summary.tables.insert(table.to_string(), count);
            }
        }

        tracing::info!(
            merge = options.merge,
            tables = summary.tables.len(),
            attachments = summary.attachments,
            "Backup restored"
        );
        Ok(summary)
    }

    /// Decode every table carried by `files` before anything is written.
    fn plan(&self, files: &FileSet) -> Result<Vec<(&'static str, Vec<Record>)>, AppError> {
        let mut plan = Vec::new();
        for codec in &self.codecs {
            if let Some(records) = codec.decode(files)? {
                plan.push((codec.table(), records));
            }
        }

        for path in files.keys() {
            if !self.codecs.iter().any(|c| c.owns(path)) {
                tracing::warn!(path = %path, "Skipping backup file for unknown table");
            }
        }
        Ok(plan)
    }

    fn codec_for(&self, table: &str) -> Option<&dyn TableCodec> {
        self.codecs
            .iter()
            .find(|c| c.table() == table)
            .map(|c| c.as_ref())
    }
}

async fn read_manifest(source: &Source<'_>) -> Result<BackupManifest, AppError> {
    let bytes = source.read(MANIFEST_PATH).await?;
    let manifest: BackupManifest = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::integrity(MANIFEST_PATH, format!("unreadable manifest: {}", e)))?;

    if manifest.schema_version < 1 || manifest.schema_version > BACKUP_SCHEMA_VERSION {
        return Err(AppError::UnsupportedSchema {
            found: manifest.schema_version,
            supported: BACKUP_SCHEMA_VERSION,
        });
    }
    Ok(manifest)
}

/// Read every manifest entry and check its digest. Any failure aborts the restore.
async fn verify_files(source: &Source<'_>, manifest: &BackupManifest) -> Result<FileSet, AppError> {
    let mut verified = FileSet::new();
    for entry in &manifest.files {
        validate_path(&entry.path).map_err(|_| AppError::integrity(&entry.path, "invalid path"))?;
        if entry.path == MANIFEST_PATH {
            continue;
        }
        if verified.contains_key(&entry.path) {
            return Err(AppError::integrity(&entry.path, "listed twice in the manifest"));
        }
        let data = source.read(&entry.path).await?;
        if !digest::matches(&data, &entry.digest) {
            tracing::error!(path = %entry.path, "Backup digest mismatch");
            return Err(AppError::integrity(&entry.path, "digest mismatch"));
        }
        verified.insert(entry.path.clone(), data);
    }
    Ok(verified)
}
