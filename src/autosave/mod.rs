//! Autosave coalescer.
//!
//! UI mutations arrive as partial states. They are buffered, debounced, spaced out from
//! the previous save, and flushed to the store as one batch. While a restore holds the
//! maintenance flag nothing is buffered, and anything buffered before the restore is
//! dropped instead of written.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::errors::AppError;
use crate::models::{AppMeta, PartialState};
use crate::notify::{Notifier, StoreEvent};
use crate::storage::{schema, TieredStore};

/// Timing of the coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutosaveConfig {
    /// Idle time after the last notification before a save is scheduled
    pub debounce: Duration,
    /// Minimum time between two completed saves
    pub min_interval: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(600),
            min_interval: Duration::from_millis(3000),
        }
    }
}

/// Delay still owed before the next save may start.
pub fn min_spacing_wait(last_save: Option<Instant>, now: Instant, min_interval: Duration) -> Duration {
    match last_save {
        Some(last) => min_interval.saturating_sub(now.saturating_duration_since(last)),
        None => Duration::ZERO,
    }
}

#[derive(Default)]
struct Pending {
    buffer: PartialState,
    /// Maintenance epoch the buffer was collected under
    epoch: u64,
    /// Bumped by every notification; a timer only proceeds if it is still current
    generation: u64,
    last_reason: Option<String>,
    last_save: Option<Instant>,
}

struct Inner {
    store: Arc<TieredStore>,
    notifier: Notifier,
    config: AutosaveConfig,
    pending: Mutex<Pending>,
    flush_lock: tokio::sync::Mutex<()>,
    saves: AtomicU64,
}

/// Handle to the coalescer; cheap to clone.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<Inner>,
}

impl Coalescer {
    pub fn new(store: Arc<TieredStore>, notifier: Notifier, config: AutosaveConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                notifier,
                config,
                pending: Mutex::new(Pending::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                saves: AtomicU64::new(0),
            }),
        }
    }

    /// Merge `partial` into the pending buffer and (re)start the debounce.
    ///
    /// Returns `false` when the notification was dropped because a restore is running.
    /// Must be called from within a tokio runtime.
    pub fn notify(&self, partial: PartialState, reason: &str) -> bool {
        let gate = self.inner.store.maintenance();
        if gate.is_active() {
            tracing::debug!(reason, "Autosave suppressed during maintenance");
            return false;
        }

        let generation = {
            let mut pending = self.inner.pending();
            let epoch = gate.epoch();
            if pending.epoch != epoch {
                pending.buffer.clear();
                pending.epoch = epoch;
            }
            pending.buffer.extend(partial);
            pending.last_reason = Some(reason.to_string());
            pending.generation += 1;
            pending.generation
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_timer(generation).await;
        });
        true
    }

    /// Flush whatever is buffered right now, skipping the timers.
    pub async fn flush_now(&self) -> Result<usize, AppError> {
        self.inner.flush().await
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.pending().buffer.is_empty()
    }

    /// Number of flushes that completed since construction.
    pub fn completed_saves(&self) -> u64 {
        self.inner.saves.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_timer(self: Arc<Self>, generation: u64) {
        tokio::time::sleep(self.config.debounce).await;

        let wait = {
            let pending = self.pending();
            if pending.generation != generation {
                // A later notification restarted the debounce.
                return;
            }
            min_spacing_wait(pending.last_save, Instant::now(), self.config.min_interval)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        if let Err(e) = self.flush().await {
            tracing::warn!(error = %e, "Autosave flush failed");
        }
    }

    async fn flush(&self) -> Result<usize, AppError> {
        let _flushing = self.flush_lock.lock().await;

        let (buffer, epoch, reason) = {
            let mut pending = self.pending();
            (
                std::mem::take(&mut pending.buffer),
                pending.epoch,
                pending.last_reason.take(),
            )
        };
        if buffer.is_empty() {
            return Ok(0);
        }

        let gate = self.store.maintenance();
        let superseded = || gate.is_active() || gate.epoch() != epoch;
        let mut written = 0;
        for (table, update) in buffer {
            for record in update.into_records() {
                if superseded() {
                    tracing::debug!(written, "Autosave buffer superseded by restore, dropping");
                    return Ok(written);
                }
                // Tables already written stay written if a later one fails.
                self.store.upsert(&table, record).await?;
                written += 1;
            }
        }

        self.pending().last_save = Some(Instant::now());
        if superseded() {
            tracing::debug!(written, "Restore started during autosave, skipping bookkeeping");
            return Ok(written);
        }
        let meta = AppMeta {
            last_autosave_at: Utc::now().timestamp_millis(),
        };
        self.store.upsert(schema::METADATA, meta.to_record()).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.notifier.publish(StoreEvent::StateUpdated);

        tracing::debug!(records = written, reason = reason.as_deref().unwrap_or("unspecified"), "Autosave flushed");
        Ok(written)
    }
}
