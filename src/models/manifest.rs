//! Backup manifest: the digest-signed index of one backup's files.

use serde::{Deserialize, Serialize};

/// One file listed in a backup manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    /// Lowercase hex SHA-256 of the exact bytes stored at `path`
    pub digest: String,
}

/// Manifest written last into every backup as `backup-manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub schema_version: i64,
    /// ISO-8601 timestamp of export
    pub generated_at: String,
    pub app_version: String,
    pub files: Vec<ManifestEntry>,
}

impl BackupManifest {
    pub fn new(schema_version: i64, generated_at: String, app_version: String) -> Self {
        Self {
            schema_version,
            generated_at,
            app_version,
            files: Vec::new(),
        }
    }

    pub fn push(&mut self, path: impl Into<String>, digest: impl Into<String>) {
        self.files.push(ManifestEntry {
            path: path.into(),
            digest: digest.into(),
        });
    }

    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.files.iter().find(|e| e.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_manifest_wire_format() {
        let mut manifest = BackupManifest::new(1, "2026-01-01T00:00:00Z".into(), "1".into());
        manifest.push("users.json", "ab12");

        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(
            value,
            json!({
                "schemaVersion": 1,
                "generatedAt": "2026-01-01T00:00:00Z",
                "appVersion": "1",
                "files": [{ "path": "users.json", "digest": "ab12" }]
            })
        );
        assert_eq!(manifest.entry("users.json").unwrap().digest, "ab12");
        assert!(manifest.entry("rooms.json").is_none());
    }
}
