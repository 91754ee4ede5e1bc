//! Automatic backups on a cadence measured in days.
//!
//! A check is cheap: it reads `metadata.backup`, compares against the clock and only
//! exports when the cadence has elapsed and a destination is already granted. Checks
//! are triggered by the host's periodic wake-ups when it has them, and by the UI
//! regaining focus or visibility otherwise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::destination::{BackupDestinations, PermissionMode};
use super::host::total_size;
use super::BackupService;
use crate::errors::AppError;
use crate::models::{BackupMeta, BACKUP_META_ID};
use crate::storage::{schema, TieredStore};

/// Tag the periodic trigger is registered under.
pub const PERIODIC_TAG: &str = "cometa-backup";

pub const DAY_MS: i64 = 86_400_000;

/// Why a due check was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Wake {
    /// Host background wake-up
    Periodic,
    Focus,
    /// The UI became visible again
    Visible,
}

/// Wake-up sources offered by the host.
#[async_trait]
pub trait HostTriggers: Send + Sync {
    /// Ask for periodic wake-ups. `Ok(false)` when the host has no such facility.
    async fn register_periodic(&self, tag: &str, min_interval: Duration) -> Result<bool, AppError>;

    /// Stream of wake-ups, or `None` when the host never delivers any.
    fn subscribe(&self) -> Option<broadcast::Receiver<Wake>>;
}

/// Host without background execution or foreground events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHostTriggers;

#[async_trait]
impl HostTriggers for NoHostTriggers {
    async fn register_periodic(&self, _tag: &str, _min_interval: Duration) -> Result<bool, AppError> {
        Ok(false)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Wake>> {
        None
    }
}

/// In-process triggers: a tokio interval for periodic wake-ups plus events fired by
/// the UI surface.
pub struct LocalTriggers {
    sender: broadcast::Sender<Wake>,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl Default for LocalTriggers {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTriggers {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            periodic: Mutex::new(None),
        }
    }

    /// Deliver a foreground event to every subscriber.
    pub fn fire(&self, wake: Wake) {
        let _ = self.sender.send(wake);
    }
}

#[async_trait]
impl HostTriggers for LocalTriggers {
    async fn register_periodic(&self, tag: &str, min_interval: Duration) -> Result<bool, AppError> {
        if min_interval.is_zero() {
            return Err(AppError::Validation("Periodic interval must be positive".to_string()));
        }

        let sender = self.sender.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + min_interval;
            let mut ticker = tokio::time::interval_at(start, min_interval);
            loop {
                ticker.tick().await;
                let _ = sender.send(Wake::Periodic);
            }
        });

        let previous = self
            .periodic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::info!(tag, interval_secs = min_interval.as_secs(), "Periodic backup trigger registered");
        Ok(true)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Wake>> {
        Some(self.sender.subscribe())
    }
}

impl Drop for LocalTriggers {
    fn drop(&mut self) {
        if let Some(task) = self.periodic.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

/// Result of one due check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum BackupOutcome {
    NotDue,
    /// Due, but no granted destination; nothing was asked of the user
    NoDestination,
    /// A restore holds the maintenance flag
    Busy,
    Completed { at: i64, files: usize },
    Failed { message: String },
}

/// Backup bookkeeping shown by the settings view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    pub last_backup_at: i64,
    pub freq_days: u32,
    pub next_due_at: i64,
    pub has_destination: bool,
    /// Bytes currently stored at the destination
    pub destination_bytes: Option<u64>,
}

/// Whether a backup is due at `now_ms`.
pub fn is_due(meta: &BackupMeta, now_ms: i64) -> bool {
    now_ms.saturating_sub(meta.last_backup_at) >= period_ms(meta)
}

fn period_ms(meta: &BackupMeta) -> i64 {
    i64::from(meta.freq_days) * DAY_MS
}

pub struct BackupScheduler {
    store: Arc<TieredStore>,
    backup: Arc<BackupService>,
    destinations: Arc<BackupDestinations>,
    triggers: Arc<dyn HostTriggers>,
    installed: AtomicBool,
    running: tokio::sync::Mutex<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BackupScheduler {
    pub fn new(
        store: Arc<TieredStore>,
        backup: Arc<BackupService>,
        destinations: Arc<BackupDestinations>,
        triggers: Arc<dyn HostTriggers>,
    ) -> Self {
        Self {
            store,
            backup,
            destinations,
            triggers,
            installed: AtomicBool::new(false),
            running: tokio::sync::Mutex::new(()),
            listener: Mutex::new(None),
        }
    }

    /// Install the wake-up triggers on first use, then check whether a backup is due.
    pub async fn run_scheduled_backup(self: &Arc<Self>) -> BackupOutcome {
        if !self.installed.swap(true, Ordering::SeqCst) {
            self.install_triggers().await;
        }
        self.run_due_check().await
    }

    async fn install_triggers(self: &Arc<Self>) {
        let meta = match self.read_meta().await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read backup metadata, using defaults");
                BackupMeta::default()
            }
        };
        self.register_periodic(&meta).await;

        let Some(mut wakes) = self.triggers.subscribe() else {
            tracing::debug!("Host delivers no wake-ups; backups run on explicit checks only");
            return;
        };
        let scheduler: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                let wake = match wakes.recv().await {
                    Ok(wake) => wake,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                let outcome = scheduler.run_due_check().await;
                tracing::debug!(?wake, ?outcome, "Backup check after wake-up");
            }
        });
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    async fn register_periodic(&self, meta: &BackupMeta) {
        let interval = Duration::from_millis(period_ms(meta).unsigned_abs());
        match self.triggers.register_periodic(PERIODIC_TAG, interval).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("Host has no periodic background trigger"),
            Err(e) => tracing::warn!(error = %e, "Periodic backup trigger registration failed"),
        }
    }

    /// Export to the granted destination if the cadence has elapsed.
    ///
    /// Never prompts for permission. Failures are logged and leave `lastBackupAt`
    /// untouched so the next check retries.
    pub async fn run_due_check(&self) -> BackupOutcome {
        let _running = self.running.lock().await;

        if self.store.maintenance().is_active() {
            tracing::debug!("Skipping backup check during restore");
            return BackupOutcome::Busy;
        }

        let meta = match self.read_meta().await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::error!(error = %e, "Could not read backup metadata");
                return BackupOutcome::Failed { message: e.message() };
            }
        };
        let now = Utc::now().timestamp_millis();
        if !is_due(&meta, now) {
            return BackupOutcome::NotDue;
        }

        let destination = match self.destinations.ensure_permissions(PermissionMode::Passive).await {
            Ok(Some(destination)) => destination,
            Ok(None) => {
                tracing::debug!("Backup due but no destination is granted");
                return BackupOutcome::NoDestination;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Backup destination unavailable");
                return BackupOutcome::NoDestination;
            }
        };

        tracing::info!(freq_days = meta.freq_days, "Backup due, exporting");
        let manifest = match self.backup.export_to_directory(destination.as_ref()).await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::error!(error = %e, "Scheduled backup failed");
                return BackupOutcome::Failed { message: e.message() };
            }
        };

        // The frequency may have changed while the export ran.
        let updated = match self.read_meta().await {
            Ok(current) => BackupMeta {
                last_backup_at: now,
                ..current
            },
            Err(e) => {
                tracing::error!(error = %e, "Backup written but its timestamp was not saved");
                return BackupOutcome::Failed { message: e.message() };
            }
        };
        if let Err(e) = self.store.upsert(schema::METADATA, updated.to_record()).await {
            tracing::error!(error = %e, "Backup written but its timestamp was not saved");
            return BackupOutcome::Failed { message: e.message() };
        }

        tracing::info!(files = manifest.files.len(), "Scheduled backup completed");
        BackupOutcome::Completed {
            at: now,
            files: manifest.files.len(),
        }
    }

    /// Change the cadence, keeping `lastBackupAt`.
    pub async fn set_backup_frequency(&self, days: u32) -> Result<BackupMeta, AppError> {
        if days == 0 {
            return Err(AppError::Validation(
                "Backup frequency must be at least one day".to_string(),
            ));
        }
        let mut meta = self.read_meta().await?;
        meta.freq_days = days;
        self.store.upsert(schema::METADATA, meta.to_record()).await?;

        if self.installed.load(Ordering::SeqCst) {
            self.register_periodic(&meta).await;
        }
        tracing::info!(freq_days = days, "Backup frequency updated");
        Ok(meta)
    }

    pub async fn backup_status(&self) -> Result<BackupStatus, AppError> {
        let meta = self.read_meta().await?;
        let destination = self
            .destinations
            .ensure_permissions(PermissionMode::Passive)
            .await
            .unwrap_or_default();
        let destination_bytes = match &destination {
            Some(handle) => total_size(handle.as_ref()).await.ok(),
            None => None,
        };
        Ok(BackupStatus {
            last_backup_at: meta.last_backup_at,
            freq_days: meta.freq_days,
            next_due_at: meta.last_backup_at.saturating_add(period_ms(&meta)),
            has_destination: destination.is_some(),
            destination_bytes,
        })
    }

    async fn read_meta(&self) -> Result<BackupMeta, AppError> {
        let record = self.store.get(schema::METADATA, BACKUP_META_ID).await?;
        Ok(BackupMeta::from_record(record.as_ref()))
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::destination::{HandleStore, MemoryHandleStore};
    use crate::backup::host::{DirEntry, DirectoryHandle, MemoryDirectory, Permission};
    use crate::backup::layout::{encode_data_url, MANIFEST_PATH, URL_FIELD};
    use crate::models::Record;

    struct Fixture {
        store: Arc<TieredStore>,
        handles: Arc<MemoryHandleStore>,
        scheduler: Arc<BackupScheduler>,
    }

    async fn fixture(triggers: Arc<dyn HostTriggers>) -> Fixture {
        let store = Arc::new(TieredStore::in_memory().await.unwrap());
        store
            .upsert("users", Record::new("u1").with("name", "Mario"))
            .await
            .unwrap();
        let handles = Arc::new(MemoryHandleStore::new());
        let destinations = Arc::new(BackupDestinations::new(handles.clone(), "/nonexistent"));
        let backup = Arc::new(BackupService::new(store.clone(), "test"));
        let scheduler = Arc::new(BackupScheduler::new(store.clone(), backup, destinations, triggers));
        Fixture {
            store,
            handles,
            scheduler,
        }
    }

    async fn grant_directory(fixture: &Fixture) -> Arc<MemoryDirectory> {
        let dir = Arc::new(MemoryDirectory::new());
        fixture.handles.save(dir.clone()).await.unwrap();
        dir
    }

    async fn backup_meta(store: &TieredStore) -> BackupMeta {
        let record = store.get("metadata", BACKUP_META_ID).await.unwrap();
        BackupMeta::from_record(record.as_ref())
    }

    #[test]
    fn test_is_due_boundary() {
        let meta = BackupMeta {
            last_backup_at: 1_000,
            freq_days: 1,
        };
        assert!(!is_due(&meta, 1_000 + DAY_MS - 1));
        assert!(is_due(&meta, 1_000 + DAY_MS));
        assert!(is_due(&BackupMeta::default(), Utc::now().timestamp_millis()));
    }

    #[tokio::test]
    async fn test_overdue_backup_runs_once_and_advances_timestamp() {
        let fixture = fixture(Arc::new(NoHostTriggers)).await;
        let dir = grant_directory(&fixture).await;

        fixture.scheduler.set_backup_frequency(1).await.unwrap();
        let two_days_ago = Utc::now().timestamp_millis() - 2 * DAY_MS;
        fixture
            .store
            .upsert(
                "metadata",
                BackupMeta {
                    last_backup_at: two_days_ago,
                    freq_days: 1,
                }
                .to_record(),
            )
            .await
            .unwrap();

        let outcome = fixture.scheduler.run_scheduled_backup().await;
        assert!(matches!(outcome, BackupOutcome::Completed { .. }), "{:?}", outcome);
        assert!(dir.file(MANIFEST_PATH).is_some());
        let writes = dir.write_count();

        let meta = backup_meta(&fixture.store).await;
        assert_eq!(meta.freq_days, 1);
        assert!((Utc::now().timestamp_millis() - meta.last_backup_at).abs() <= 1_000);

        assert_eq!(fixture.scheduler.run_scheduled_backup().await, BackupOutcome::NotDue);
        assert_eq!(dir.write_count(), writes);
    }

    #[tokio::test]
    async fn test_no_granted_destination_skips_without_prompting() {
        let fixture = fixture(Arc::new(NoHostTriggers)).await;
        assert_eq!(fixture.scheduler.run_due_check().await, BackupOutcome::NoDestination);

        let dir = Arc::new(MemoryDirectory::with_permission(Permission::Prompt));
        fixture.handles.save(dir.clone()).await.unwrap();
        assert_eq!(fixture.scheduler.run_due_check().await, BackupOutcome::NoDestination);
        assert_eq!(dir.query_permission().await, Permission::Prompt);
        assert_eq!(backup_meta(&fixture.store).await.last_backup_at, 0);
    }

    #[tokio::test]
    async fn test_failed_export_keeps_last_backup_at() {
        let fixture = fixture(Arc::new(NoHostTriggers)).await;
        grant_directory(&fixture).await;
        // An attachment id that is not a valid file name makes the export fail.
        fixture
            .store
            .upsert(
                "attachments",
                Record::new("bad/id")
                    .with("mime", "image/png")
                    .with(URL_FIELD, encode_data_url("image/png", &[1, 2, 3])),
            )
            .await
            .unwrap();

        let outcome = fixture.scheduler.run_due_check().await;
        assert!(matches!(outcome, BackupOutcome::Failed { .. }), "{:?}", outcome);
        assert_eq!(backup_meta(&fixture.store).await.last_backup_at, 0);
    }

    #[tokio::test]
    async fn test_extreme_last_backup_at_does_not_overflow() {
        let fixture = fixture(Arc::new(NoHostTriggers)).await;
        grant_directory(&fixture).await;

        for last_backup_at in [i64::MAX, i64::MIN] {
            let meta = BackupMeta {
                last_backup_at,
                freq_days: 7,
            };
            fixture.store.upsert("metadata", meta.to_record()).await.unwrap();
            let status = fixture.scheduler.backup_status().await.unwrap();
            assert_eq!(status.last_backup_at, last_backup_at);
        }

        let far_future = BackupMeta {
            last_backup_at: i64::MAX,
            freq_days: 7,
        };
        assert!(!is_due(&far_future, Utc::now().timestamp_millis()));
        fixture.store.upsert("metadata", far_future.to_record()).await.unwrap();
        assert_eq!(fixture.scheduler.backup_status().await.unwrap().next_due_at, i64::MAX);
        assert_eq!(fixture.scheduler.run_due_check().await, BackupOutcome::NotDue);

        let far_past = BackupMeta {
            last_backup_at: i64::MIN,
            freq_days: 7,
        };
        assert!(is_due(&far_past, Utc::now().timestamp_millis()));
        fixture.store.upsert("metadata", far_past.to_record()).await.unwrap();
        let outcome = fixture.scheduler.run_due_check().await;
        assert!(matches!(outcome, BackupOutcome::Completed { .. }), "{:?}", outcome);
    }

    /// Destination that changes the cadence while the backup is being written.
    struct RetuningDirectory {
        inner: MemoryDirectory,
        store: Arc<TieredStore>,
    }

    #[async_trait]
    impl DirectoryHandle for RetuningDirectory {
        async fn read(&self, path: &str) -> Result<Vec<u8>, AppError> {
            self.inner.read(path).await
        }

        async fn write(&self, path: &str, data: &[u8]) -> Result<(), AppError> {
            if path == MANIFEST_PATH {
                let meta = BackupMeta {
                    last_backup_at: 0,
                    freq_days: 5,
                };
                self.store.upsert("metadata", meta.to_record()).await?;
            }
            self.inner.write(path, data).await
        }

        async fn enumerate(&self, dir: &str) -> Result<Vec<DirEntry>, AppError> {
            self.inner.enumerate(dir).await
        }

        async fn query_permission(&self) -> Permission {
            self.inner.query_permission().await
        }

        async fn request_permission(&self) -> Permission {
            self.inner.request_permission().await
        }
    }

    #[tokio::test]
    async fn test_frequency_changed_during_export_is_kept() {
        let fixture = fixture(Arc::new(NoHostTriggers)).await;
        let dir = Arc::new(RetuningDirectory {
            inner: MemoryDirectory::new(),
            store: fixture.store.clone(),
        });
        fixture.handles.save(dir.clone()).await.unwrap();

        let outcome = fixture.scheduler.run_due_check().await;
        assert!(matches!(outcome, BackupOutcome::Completed { .. }), "{:?}", outcome);

        let meta = backup_meta(&fixture.store).await;
        assert_eq!(meta.freq_days, 5);
        assert!(meta.last_backup_at > 0);
    }

    #[tokio::test]
    async fn test_busy_during_restore() {
        let fixture = fixture(Arc::new(NoHostTriggers)).await;
        grant_directory(&fixture).await;
        let _guard = fixture.store.maintenance().enter().unwrap();
        assert_eq!(fixture.scheduler.run_due_check().await, BackupOutcome::Busy);
    }

    #[tokio::test]
    async fn test_frequency_validation_and_status() {
        let fixture = fixture(Arc::new(NoHostTriggers)).await;
        assert!(matches!(
            fixture.scheduler.set_backup_frequency(0).await,
            Err(AppError::Validation(_))
        ));

        let meta = fixture.scheduler.set_backup_frequency(3).await.unwrap();
        assert_eq!(meta.freq_days, 3);

        let status = fixture.scheduler.backup_status().await.unwrap();
        assert_eq!(status.freq_days, 3);
        assert_eq!(status.next_due_at, 3 * DAY_MS);
        assert!(!status.has_destination);

        let dir = grant_directory(&fixture).await;
        fixture.scheduler.run_due_check().await;
        let status = fixture.scheduler.backup_status().await.unwrap();
        assert!(status.has_destination);
        let stored: u64 = dir
            .paths()
            .iter()
            .map(|p| dir.file(p).unwrap().len() as u64)
            .sum();
        assert_eq!(status.destination_bytes, Some(stored));
    }

    #[tokio::test]
    async fn test_focus_wake_runs_check() {
        let triggers = Arc::new(LocalTriggers::new());
        let fixture = fixture(triggers.clone()).await;

        assert_eq!(
            fixture.scheduler.run_scheduled_backup().await,
            BackupOutcome::NoDestination
        );

        let dir = grant_directory(&fixture).await;
        triggers.fire(Wake::Focus);
        for _ in 0..200 {
            if dir.file(MANIFEST_PATH).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dir.file(MANIFEST_PATH).is_some());
        assert!(backup_meta(&fixture.store).await.last_backup_at > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_periodic_trigger_fires() {
        let triggers = LocalTriggers::new();
        let mut wakes = triggers.subscribe().unwrap();
        assert!(triggers
            .register_periodic(PERIODIC_TAG, Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(wakes.recv().await.unwrap(), Wake::Periodic);
        assert!(triggers.register_periodic(PERIODIC_TAG, Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_no_host_triggers_is_not_an_error() {
        let triggers = NoHostTriggers;
        assert!(!triggers
            .register_periodic(PERIODIC_TAG, Duration::from_secs(1))
            .await
            .unwrap());
        assert!(triggers.subscribe().is_none());
    }
}
