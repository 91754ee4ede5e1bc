//! Cometa store
//!
//! Local-first persistence for the Cometa planner: a tiered record store, a coalescing
//! autosave, cross-instance change notification and verified backup archives with a
//! day-based backup schedule. The daemon in `main.rs` exposes it to the UI over HTTP.

pub mod api;
pub mod auth;
pub mod autosave;
pub mod backup;
pub mod config;
pub mod digest;
pub mod errors;
pub mod models;
pub mod notify;
pub mod storage;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use autosave::Coalescer;
use backup::destination::{BackupDestinations, FsHandleStore};
use backup::scheduler::{BackupScheduler, LocalTriggers};
use backup::BackupService;
use config::Config;
use errors::AppError;
use notify::{Notifier, NotifierBus};
use storage::TieredStore;

/// Largest request body accepted, sized for backup archives with photos.
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TieredStore>,
    pub autosave: Coalescer,
    pub notifier: Notifier,
    pub backup: Arc<BackupService>,
    pub destinations: Arc<BackupDestinations>,
    pub scheduler: Arc<BackupScheduler>,
    pub triggers: Arc<LocalTriggers>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Open the configured store and wire every component around it.
    pub async fn build(config: Config, bus: &NotifierBus) -> Result<Self, AppError> {
        let store = Arc::new(TieredStore::open(&config).await?);
        Ok(Self::assemble(config, store, bus))
    }

    /// Wire the components around an already opened store.
    pub fn assemble(config: Config, store: Arc<TieredStore>, bus: &NotifierBus) -> Self {
        let notifier = Notifier::connect(bus);
        notifier.subscribe(|event| {
            tracing::debug!(event = event.as_str(), "Store changed in another instance");
        });

        let autosave = Coalescer::new(store.clone(), notifier.clone(), config.autosave);
        let backup = Arc::new(BackupService::new(store.clone(), config.app_version.clone()));
        let destinations = Arc::new(BackupDestinations::new(
            Arc::new(FsHandleStore::new(&config.handle_store_path)),
            &config.private_backup_dir,
        ));
        let triggers = Arc::new(LocalTriggers::new());
        let scheduler = Arc::new(BackupScheduler::new(
            store.clone(),
            backup.clone(),
            destinations.clone(),
            triggers.clone(),
        ));

        Self {
            store,
            autosave,
            notifier,
            backup,
            destinations,
            scheduler,
            triggers,
            config: Arc::new(config),
        }
    }
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let psk = state.config.api_psk.clone();

    let api_routes = Router::new()
        // Whole state
        .route(
            "/state",
            get(api::get_state).put(api::save_state).delete(api::wipe_state),
        )
        // Records
        .route("/tables/{table}", get(api::list_records))
        .route(
            "/tables/{table}/{id}",
            get(api::get_record)
                .put(api::put_record)
                .delete(api::delete_record),
        )
        // Backup
        .route(
            "/backup/archive",
            get(api::export_archive).post(api::import_archive),
        )
        .route("/backup/directory", post(api::choose_directory))
        .route("/backup/directory/export", post(api::export_directory))
        .route("/backup/directory/import", post(api::import_directory))
        .route("/backup/run", post(api::run_backup))
        .route("/backup/frequency", put(api::set_frequency))
        .route("/backup/status", get(api::backup_status))
        .route("/backup/wake", post(api::wake))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(move |req, next| {
            auth::psk_auth_layer(psk.clone(), req, next)
        }));

    // Health check (no auth required)
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
