//! Cometa store daemon
//!
//! Serves the local store and backup actions to the UI and runs the backup schedule.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cometa_store::config::{Config, LogFormat};
use cometa_store::notify::NotifierBus;
use cometa_store::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);
    match config.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }

    tracing::info!("Starting Cometa store");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Fallback directory: {:?}", config.fallback_dir);
    tracing::info!("Bind address: {}", config.bind_addr);

    if config.api_psk.is_none() {
        tracing::warn!("No API PSK configured (COMETA_API_PSK). Authentication is disabled!");
    }

    let bus = NotifierBus::new();
    let state = AppState::build(config.clone(), &bus).await?;
    tracing::info!(backend = ?state.store.backend_kind(), "Store ready");

    // First scheduled check also installs the periodic and foreground triggers.
    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        let outcome = scheduler.run_scheduled_backup().await;
        tracing::info!(?outcome, "Startup backup check finished");
    });

    let autosave = state.autosave.clone();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Equivalent of the UI's before-unload save.
    match autosave.flush_now().await {
        Ok(records) => tracing::info!(records, "Pending autosave flushed"),
        Err(e) => tracing::error!(error = %e, "Final autosave flush failed"),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
