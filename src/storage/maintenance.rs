//! Maintenance flag raised while a restore rewrites the store.
//!
//! The flag is the only exclusion between autosave and restore. It is held through an
//! RAII guard so every exit path of a restore lowers it again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::AppError;

#[derive(Debug, Default)]
struct GateState {
    active: AtomicBool,
    epoch: AtomicU64,
}

/// Shared handle to the maintenance flag.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceGate {
    state: Arc<GateState>,
}

impl MaintenanceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Number of times the flag has been raised. Work collected under an older epoch
    /// predates the latest restore.
    pub fn epoch(&self) -> u64 {
        self.state.epoch.load(Ordering::SeqCst)
    }

    /// Raise the flag. Fails if another restore already holds it.
    pub fn enter(&self) -> Result<MaintenanceGuard, AppError> {
        self.state
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| AppError::Maintenance("A restore is already in progress".to_string()))?;
        let epoch = self.state.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(epoch, "Maintenance mode entered");
        Ok(MaintenanceGuard {
            state: self.state.clone(),
        })
    }

    /// Error out when a restore is running; used by outside write paths.
    pub fn ensure_idle(&self) -> Result<(), AppError> {
        if self.is_active() {
            return Err(AppError::Maintenance(
                "The store is being restored; try again shortly".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lowers the maintenance flag when dropped.
#[derive(Debug)]
pub struct MaintenanceGuard {
    state: Arc<GateState>,
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        self.state.active.store(false, Ordering::SeqCst);
        tracing::info!("Maintenance mode released");
    }
}
