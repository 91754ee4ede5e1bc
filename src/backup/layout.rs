//! File layout of a backup and the per-table strategies that produce it.
//!
//! Plain tables become one JSON array file. Attachments are split into raw files under
//! `photos/` plus a `photos/metadata.json` listing the records without their payload.

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::archive::BackupFile;
use super::host::validate_path;
use crate::errors::AppError;
use crate::models::Record;
use crate::storage::schema;

pub const MANIFEST_PATH: &str = "backup-manifest.json";
pub const PHOTOS_DIR: &str = "photos";
pub const PHOTO_METADATA_PATH: &str = "photos/metadata.json";
pub const PREFS_DIR: &str = "prefs";

/// Inline attachment payload, as a `data:` URL.
pub const URL_FIELD: &str = "url";
/// Alternate inline payload field.
pub const DATA_URL_FIELD: &str = "dataUrl";
pub const MIME_FIELD: &str = "mime";
/// File name of an exported attachment, relative to `photos/`.
pub const FILE_FIELD: &str = "file";
/// Payload field to restore into, written only when it is not `url`.
pub const PAYLOAD_FIELD: &str = "fileField";

const PAYLOAD_FIELDS: [&str; 2] = [URL_FIELD, DATA_URL_FIELD];

/// Container a backup is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Archive,
    Directory,
}

/// Verified backup files by path.
pub type FileSet = BTreeMap<String, Vec<u8>>;

/// How one table is laid out in a backup.
pub trait TableCodec: Send + Sync {
    fn table(&self) -> &'static str;

    /// Files that carry `records` in a backup written to `target`.
    fn encode(&self, records: &[Record], target: Target) -> Result<Vec<BackupFile>, AppError>;

    /// Whether `path` is one of the files this codec reads.
    fn owns(&self, path: &str) -> bool;

    /// Records found in `files`, or `None` when the backup does not carry this table.
    fn decode(&self, files: &FileSet) -> Result<Option<Vec<Record>>, AppError>;
}

/// Table stored as a JSON array in `<table>.json`, optionally under a subdirectory
/// when written to a directory.
#[derive(Debug, Clone)]
pub struct JsonTableCodec {
    table: &'static str,
    directory_prefix: Option<&'static str>,
}

impl JsonTableCodec {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            directory_prefix: None,
        }
    }

    /// Place the file under `prefix/` in directory backups.
    pub fn in_directory(table: &'static str, prefix: &'static str) -> Self {
        Self {
            table,
            directory_prefix: Some(prefix),
        }
    }

    fn flat_path(&self) -> String {
        format!("{}.json", self.table)
    }

    fn prefixed_path(&self) -> Option<String> {
        self.directory_prefix
            .map(|prefix| format!("{}/{}.json", prefix, self.table))
    }
}

impl TableCodec for JsonTableCodec {
    fn table(&self) -> &'static str {
        self.table
    }

    fn encode(&self, records: &[Record], target: Target) -> Result<Vec<BackupFile>, AppError> {
        let path = match (target, self.prefixed_path()) {
            (Target::Directory, Some(prefixed)) => prefixed,
            _ => self.flat_path(),
        };
        Ok(vec![BackupFile::new(path, serde_json::to_vec(records)?)])
    }

    fn owns(&self, path: &str) -> bool {
        path == self.flat_path() || self.prefixed_path().as_deref() == Some(path)
    }

    fn decode(&self, files: &FileSet) -> Result<Option<Vec<Record>>, AppError> {
        let candidates = [Some(self.flat_path()), self.prefixed_path()];
        let Some((path, bytes)) = candidates
            .into_iter()
            .flatten()
            .find_map(|path| files.get(&path).map(|bytes| (path, bytes)))
        else {
            return Ok(None);
        };

        let records: Vec<Record> = serde_json::from_slice(bytes)
            .map_err(|e| AppError::integrity(&path, format!("not a JSON array of records: {}", e)))?;
        for record in &records {
            if record.id().is_none() {
                return Err(AppError::integrity(&path, "record without id"));
            }
        }
        Ok(Some(records))
    }
}

/// Attachments with inline payloads, exported as raw files under `photos/`.
///
/// Records without a payload go to the metadata file only.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentCodec {
    table: &'static str,
}

impl AttachmentCodec {
    pub fn new(table: &'static str) -> Self {
        Self { table }
    }
}

impl TableCodec for AttachmentCodec {
    fn table(&self) -> &'static str {
        self.table
    }

    fn encode(&self, records: &[Record], _target: Target) -> Result<Vec<BackupFile>, AppError> {
        let mut files = Vec::with_capacity(records.len() + 1);
        let mut metadata = Vec::with_capacity(records.len());
        let mut taken = BTreeSet::from([metadata_file_name().to_string()]);

        for record in records {
            let id = record.require_id(self.table)?;
            let mime = record.get_str(MIME_FIELD).unwrap_or_default();
            let mut stripped = record.clone();

            if let Some((field, data)) = inline_payload(record, mime) {
                let file_name = unique_file_name(id, mime_to_ext(mime), &mut taken)?;
                files.push(BackupFile::new(format!("{}/{}", PHOTOS_DIR, file_name), data));
                stripped.remove(field);
                stripped.set(FILE_FIELD, file_name);
                if field != URL_FIELD {
                    stripped.set(PAYLOAD_FIELD, field);
                }
            }
            metadata.push(stripped);
        }

        files.push(BackupFile::new(
            PHOTO_METADATA_PATH,
            serde_json::to_vec(&metadata)?,
        ));
        Ok(files)
    }

    fn owns(&self, path: &str) -> bool {
        path.starts_with("photos/")
    }

    fn decode(&self, files: &FileSet) -> Result<Option<Vec<Record>>, AppError> {
        let Some(bytes) = files.get(PHOTO_METADATA_PATH) else {
            return Ok(None);
        };
        let metadata: Vec<Record> = serde_json::from_slice(bytes).map_err(|e| {
            AppError::integrity(PHOTO_METADATA_PATH, format!("not a JSON array: {}", e))
        })?;

        let mut records = Vec::with_capacity(metadata.len());
        for mut record in metadata {
            if record.id().is_none() {
                return Err(AppError::integrity(PHOTO_METADATA_PATH, "attachment without id"));
            }
            let file_name = match record.remove(FILE_FIELD) {
                None => {
                    records.push(record);
                    continue;
                }
                Some(serde_json::Value::String(name)) => name,
                Some(_) => {
                    return Err(AppError::integrity(
                        PHOTO_METADATA_PATH,
                        "attachment file name is not a string",
                    ))
                }
            };
            let field = match record.remove(PAYLOAD_FIELD) {
                None => URL_FIELD,
                Some(serde_json::Value::String(name)) => PAYLOAD_FIELDS
                    .into_iter()
                    .find(|known| *known == name)
                    .ok_or_else(|| {
                        AppError::integrity(PHOTO_METADATA_PATH, format!("unknown payload field {}", name))
                    })?,
                Some(_) => {
                    return Err(AppError::integrity(
                        PHOTO_METADATA_PATH,
                        "attachment payload field is not a string",
                    ))
                }
            };

            let path = format!("{}/{}", PHOTOS_DIR, file_name);
            let data = files.get(&path).ok_or_else(|| {
                AppError::integrity(&path, "listed in photo metadata but not in the manifest")
            })?;
            let mime = record.get_str(MIME_FIELD).unwrap_or_default().to_string();
            record.set(field, encode_data_url(&mime, data));
            records.push(record);
        }
        Ok(Some(records))
    }
}

fn metadata_file_name() -> &'static str {
    PHOTO_METADATA_PATH
        .strip_prefix("photos/")
        .unwrap_or(PHOTO_METADATA_PATH)
}

/// First payload field holding a base64 `data:` URL for `mime`, with its bytes.
///
/// Anything else (remote links, other encodings) stays in the metadata as is.
fn inline_payload(record: &Record, mime: &str) -> Option<(&'static str, Vec<u8>)> {
    PAYLOAD_FIELDS.into_iter().find_map(|field| {
        let url = record.get_str(field)?;
        let data = decode_data_url(url).ok()?;
        (encode_data_url(mime, &data) == url).then_some((field, data))
    })
}

/// `<id>.<ext>`, suffixed with `-N` while the name is taken.
fn unique_file_name(id: &str, ext: &str, taken: &mut BTreeSet<String>) -> Result<String, AppError> {
    if id.contains('/') || ext.contains('/') {
        return Err(AppError::Validation(format!(
            "Attachment id {} cannot be used as a file name",
            id
        )));
    }
    let mut name = format!("{}.{}", id, ext);
    let mut suffix = 1;
    while taken.contains(&name) {
        name = format!("{}-{}.{}", id, suffix, ext);
        suffix += 1;
    }
    validate_path(&format!("{}/{}", PHOTOS_DIR, name))?;
    taken.insert(name.clone());
    Ok(name)
}

/// Codecs for every schema table.
pub fn default_codecs() -> Vec<Box<dyn TableCodec>> {
    schema::TABLES
        .iter()
        .map(|&table| -> Box<dyn TableCodec> {
            match table {
                schema::ATTACHMENTS => Box::new(AttachmentCodec::new(table)),
                schema::SETTINGS => Box::new(JsonTableCodec::in_directory(table, PREFS_DIR)),
                _ => Box::new(JsonTableCodec::new(table)),
            }
        })
        .collect()
}

/// File extension for a MIME type: its subtype, `jpeg` shortened to `jpg`.
pub fn mime_to_ext(mime: &str) -> &str {
    let subtype = mime
        .split_once('/')
        .map(|(_, sub)| sub.split(';').next().unwrap_or_default().trim())
        .unwrap_or_default();
    match subtype {
        "" => "bin",
        "jpeg" => "jpg",
        other => other,
    }
}

/// Raw bytes of a `data:<mime>;base64,<payload>` URL.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>, AppError> {
    let payload = url.split_once(',').map(|(_, p)| p).unwrap_or_default();
    Ok(STANDARD.decode(payload)?)
}

pub fn encode_data_url(mime: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(data))
}
