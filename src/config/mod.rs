//! Configuration module for the Cometa store.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::autosave::AutosaveConfig;

/// Which store backend the process should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPreference {
    /// Structured SQLite backend, falling back to the flat store if it cannot be opened
    Auto,
    /// Always use the flat key/value backend
    Flat,
}

impl BackendPreference {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" | "sqlite" => Ok(BackendPreference::Auto),
            "flat" => Ok(BackendPreference::Flat),
            other => Err(format!("Invalid COMETA_BACKEND value: {}", other)),
        }
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("Invalid COMETA_LOG_FORMAT value: {}", other)),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-shared key for API authentication (unset disables auth)
    pub api_psk: Option<String>,
    /// Path to the SQLite database file
    pub db_path: PathBuf,
    /// Directory backing the flat fallback store
    pub fallback_dir: PathBuf,
    pub backend: BackendPreference,
    /// File remembering the user's chosen backup directory
    pub handle_store_path: PathBuf,
    /// App-private backup directory used when the user picks none
    pub private_backup_dir: PathBuf,
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
    pub autosave: AutosaveConfig,
    /// Version string written into backup manifests
    pub app_version: String,
}

impl Config {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            api_psk: None,
            db_path: data_dir.join("store.sqlite"),
            fallback_dir: data_dir.join("fallback"),
            backend: BackendPreference::Auto,
            handle_store_path: data_dir.join("backup-handle.json"),
            private_backup_dir: data_dir.join("backups"),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            autosave: AutosaveConfig::default(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, String> {
        dotenvy::dotenv().ok();

        let data_dir = env::var("COMETA_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
        let mut config = Self::with_data_dir(&data_dir);

        config.api_psk = env::var("COMETA_API_PSK").ok().filter(|k| !k.is_empty());

        if let Ok(path) = env::var("COMETA_DB_PATH") {
            config.db_path = path.into();
        }
        if let Ok(path) = env::var("COMETA_FALLBACK_DIR") {
            config.fallback_dir = path.into();
        }
        if let Ok(raw) = env::var("COMETA_BACKEND") {
            config.backend = BackendPreference::parse(&raw)?;
        }
        if let Ok(path) = env::var("COMETA_HANDLE_STORE") {
            config.handle_store_path = path.into();
        }
        if let Ok(path) = env::var("COMETA_PRIVATE_BACKUP_DIR") {
            config.private_backup_dir = path.into();
        }
        if let Ok(addr) = env::var("COMETA_BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .map_err(|_| format!("Invalid COMETA_BIND_ADDR format: {}", addr))?;
        }
        if let Ok(level) = env::var("COMETA_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(raw) = env::var("COMETA_LOG_FORMAT") {
            config.log_format = LogFormat::parse(&raw)?;
        }
        if let Some(ms) = millis_var("COMETA_AUTOSAVE_DEBOUNCE_MS")? {
            config.autosave.debounce = ms;
        }
        if let Some(ms) = millis_var("COMETA_AUTOSAVE_MIN_INTERVAL_MS")? {
            config.autosave.min_interval = ms;
        }
        if let Ok(version) = env::var("COMETA_APP_VERSION") {
            config.app_version = version;
        }

        Ok(config)
    }
}

fn millis_var(name: &str) -> Result<Option<Duration>, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| format!("Invalid {} value: {}", name, raw)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "COMETA_API_PSK",
        "COMETA_DATA_DIR",
        "COMETA_DB_PATH",
        "COMETA_FALLBACK_DIR",
        "COMETA_BACKEND",
        "COMETA_HANDLE_STORE",
        "COMETA_PRIVATE_BACKUP_DIR",
        "COMETA_BIND_ADDR",
        "COMETA_LOG_LEVEL",
        "COMETA_LOG_FORMAT",
        "COMETA_AUTOSAVE_DEBOUNCE_MS",
        "COMETA_AUTOSAVE_MIN_INTERVAL_MS",
        "COMETA_APP_VERSION",
    ];

    // Single test so env mutations do not race other tests in this module.
    #[test]
    fn test_config_from_env() {
        for var in VARS {
            env::remove_var(var);
        }

        let config = Config::from_env().unwrap();
        assert!(config.api_psk.is_none());
        assert_eq!(config.db_path, PathBuf::from("./data/store.sqlite"));
        assert_eq!(config.fallback_dir, PathBuf::from("./data/fallback"));
        assert_eq!(config.backend, BackendPreference::Auto);
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8787");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.autosave.debounce, Duration::from_millis(600));
        assert_eq!(config.autosave.min_interval, Duration::from_millis(3000));

        env::set_var("COMETA_DATA_DIR", "/var/lib/cometa");
        env::set_var("COMETA_BACKEND", "flat");
        env::set_var("COMETA_AUTOSAVE_DEBOUNCE_MS", "250");
        env::set_var("COMETA_LOG_FORMAT", "json");
        let config = Config::from_env().unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/cometa/store.sqlite"));
        assert_eq!(config.backend, BackendPreference::Flat);
        assert_eq!(config.autosave.debounce, Duration::from_millis(250));

        env::set_var("COMETA_BACKEND", "postgres");
        assert!(Config::from_env().is_err());

        for var in VARS {
            env::remove_var(var);
        }
    }
}
