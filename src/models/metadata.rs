//! Singleton records kept in the `metadata` table.

use super::Record;

/// Key of the backup bookkeeping record.
pub const BACKUP_META_ID: &str = "backup";
/// Key of the autosave bookkeeping record.
pub const APP_META_ID: &str = "app";

/// Backup cadence used when none has been chosen.
pub const DEFAULT_FREQ_DAYS: u32 = 7;

/// `metadata.backup`: when the last automatic backup ran and how often to run it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupMeta {
    /// Milliseconds since the epoch, 0 when no backup has run
    pub last_backup_at: i64,
    pub freq_days: u32,
}

impl Default for BackupMeta {
    fn default() -> Self {
        Self {
            last_backup_at: 0,
            freq_days: DEFAULT_FREQ_DAYS,
        }
    }
}

impl BackupMeta {
    /// Missing fields, and a stored frequency of 0, read as defaults.
    pub fn from_record(record: Option<&Record>) -> Self {
        let Some(record) = record else {
            return Self::default();
        };
        let freq_days = record
            .get_i64("freqDays")
            .filter(|d| *d > 0)
            .and_then(|d| u32::try_from(d).ok())
            .unwrap_or(DEFAULT_FREQ_DAYS);
        Self {
            last_backup_at: record.get_i64("lastBackupAt").unwrap_or(0),
            freq_days,
        }
    }

    pub fn to_record(self) -> Record {
        Record::new(BACKUP_META_ID)
            .with("lastBackupAt", self.last_backup_at)
            .with("freqDays", self.freq_days)
    }
}

/// `metadata.app`: bookkeeping written after every autosave flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppMeta {
    pub last_autosave_at: i64,
}

impl AppMeta {
    pub fn from_record(record: &Record) -> Option<Self> {
        record.get_i64("lastAutosaveAt").map(|last_autosave_at| Self { last_autosave_at })
    }

    pub fn to_record(self) -> Record {
        Record::new(APP_META_ID).with("lastAutosaveAt", self.last_autosave_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_meta_defaults() {
        assert_eq!(BackupMeta::from_record(None), BackupMeta::default());

        let zero = Record::new(BACKUP_META_ID).with("freqDays", 0).with("lastBackupAt", 5);
        let meta = BackupMeta::from_record(Some(&zero));
        assert_eq!(meta.freq_days, DEFAULT_FREQ_DAYS);
        assert_eq!(meta.last_backup_at, 5);
    }

    #[test]
    fn test_backup_meta_record_shape() {
        let record = BackupMeta {
            last_backup_at: 1_000,
            freq_days: 3,
        }
        .to_record();
        assert_eq!(record.id(), Some("backup"));
        assert_eq!(record.get_i64("freqDays"), Some(3));
        assert_eq!(BackupMeta::from_record(Some(&record)).last_backup_at, 1_000);
    }
}
