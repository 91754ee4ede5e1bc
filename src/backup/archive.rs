//! Single-file backup container.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// One file of a backup, addressed by its relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub path: String,
    pub data: Vec<u8>,
}

impl BackupFile {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data,
        }
    }
}

/// Packs a set of files into one archive and back.
pub trait ArchiveCodec: Send + Sync {
    fn pack(&self, files: &[BackupFile]) -> Result<Vec<u8>, AppError>;
    fn unpack(&self, archive: &[u8]) -> Result<Vec<BackupFile>, AppError>;
    /// File extension of produced archives, without the dot.
    fn extension(&self) -> &'static str;
}

const ARCHIVE_FORMAT: &str = "cometa-backup";

#[derive(Serialize, Deserialize)]
struct ArchiveDocument {
    format: String,
    entries: Vec<ArchiveEntry>,
}

#[derive(Serialize, Deserialize)]
struct ArchiveEntry {
    path: String,
    /// Base64 of the file bytes
    data: String,
}

/// Gzip-compressed JSON document listing every file.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipJsonArchive;

impl ArchiveCodec for GzipJsonArchive {
    fn pack(&self, files: &[BackupFile]) -> Result<Vec<u8>, AppError> {
        let document = ArchiveDocument {
            format: ARCHIVE_FORMAT.to_string(),
            entries: files
                .iter()
                .map(|f| ArchiveEntry {
                    path: f.path.clone(),
                    data: STANDARD.encode(&f.data),
                })
                .collect(),
        };

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        serde_json::to_writer(&mut encoder, &document)?;
        encoder.flush()?;
        Ok(encoder.finish()?)
    }

    fn unpack(&self, archive: &[u8]) -> Result<Vec<BackupFile>, AppError> {
        let mut decoder = GzDecoder::new(archive);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| AppError::BadRequest(format!("Not a backup archive: {}", e)))?;

        let document: ArchiveDocument = serde_json::from_slice(&json)?;
        if document.format != ARCHIVE_FORMAT {
            return Err(AppError::BadRequest(format!(
                "Unknown archive format: {}",
                document.format
            )));
        }

        document
            .entries
            .into_iter()
            .map(|entry| -> Result<BackupFile, AppError> {
                Ok(BackupFile::new(entry.path, STANDARD.decode(entry.data)?))
            })
            .collect()
    }

    fn extension(&self) -> &'static str {
        "json.gz"
    }
}

/// `<prefix>-YYYYMMDD-HHMM.<ext>` for a backup taken at local time `at`.
pub fn backup_file_name(prefix: &str, at: NaiveDateTime, ext: &str) -> String {
    format!("{}-{}.{}", prefix, at.format("%Y%m%d-%H%M"), ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_pack_unpack_keeps_binary_content() {
        let files = vec![
            BackupFile::new("users.json", br#"[{"id":"u1"}]"#.to_vec()),
            BackupFile::new("photos/p1.jpg", vec![0xff, 0xd8, 0x00, 0x10]),
        ];
        let codec = GzipJsonArchive;
        let archive = codec.pack(&files).unwrap();
        assert_eq!(&archive[..2], &[0x1f, 0x8b]);
        assert_eq!(codec.unpack(&archive).unwrap(), files);
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(matches!(
            GzipJsonArchive.unpack(b"definitely not gzip"),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_backup_file_name() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(9, 5, 0)
            .unwrap();
        assert_eq!(backup_file_name("backup", at, "zip"), "backup-20240307-0905.zip");
    }
}
