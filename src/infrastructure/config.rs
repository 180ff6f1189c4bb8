//! Configuration infrastructure
//!
//! Layered load: serde defaults, then an optional config file (JSON or
//! TOML, picked by extension), then `GLOBAL_UPC__SECTION__KEY` environment
//! overrides. The store list doubles as the registry snapshot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::application::EngineSettings;
use crate::domain::{SchemaCatalog, Store};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

/// Default configuration values
pub mod defaults {
    /// Directory name under the platform config/data dirs
    pub const APP_DIR: &str = "global-upc";
    pub const CONFIG_FILE: &str = "config.json";
    pub const HISTORY_DB_FILE: &str = "history.db";
    pub const ENV_PREFIX: &str = "GLOBAL_UPC";

    pub const BIND_ADDRESS: &str = "127.0.0.1:8787";

    /// Rows per scanner window
    pub const WINDOW_SIZE: u64 = 5000;
    /// Keys bound per `IN (...)` batch on relational stores
    pub const PARAMETER_CEILING: usize = 2000;
    /// Parameters SQL Server accepts in one request
    pub const RELATIONAL_PARAMETER_LIMIT: usize = 2100;
    /// Parameters a batched statement binds besides its key list
    pub const RESERVED_PARAMETERS: usize = 8;
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;
    pub const RECONCILE_CONCURRENCY: usize = 8;
    pub const COLLECTION_CONCURRENCY: usize = 2;
    pub const EVENT_BUFFER: usize = 256;

    pub const CONNECT_TIMEOUT_SECS: u64 = 30;
    pub const MAX_CONNECTIONS: u32 = 4;
    pub const TRUST_SERVER_CERTIFICATE: bool = true;

    pub const COMMERCE_API_VERSION: &str = "2025-01";
    pub const COMMERCE_TIMEOUT_SECS: u64 = 30;
    pub const COMMERCE_REQUESTS_PER_SECOND: u32 = 2;
    pub const COMMERCE_MAX_RETRIES: u32 = 3;
    pub const COMMERCE_PAGE_SIZE: u32 = 100;
    /// Barcodes OR-ed into one existence query
    pub const COMMERCE_EXISTENCE_CEILING: usize = 25;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_MAX_FILES: u32 = 14;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: defaults::BIND_ADDRESS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub window_size: u64,
    pub parameter_ceiling: usize,
    /// Idle interval after which the event stream writes a keep-alive
    pub heartbeat_interval_secs: u64,
    pub reconcile_concurrency: usize,
    pub collection_concurrency: usize,
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size: defaults::WINDOW_SIZE,
            parameter_ceiling: defaults::PARAMETER_CEILING,
            heartbeat_interval_secs: defaults::HEARTBEAT_INTERVAL_SECS,
            reconcile_concurrency: defaults::RECONCILE_CONCURRENCY,
            collection_concurrency: defaults::COLLECTION_CONCURRENCY,
            event_buffer: defaults::EVENT_BUFFER,
        }
    }
}

impl EngineConfig {
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            window_size: self.window_size,
            reconcile_concurrency: self.reconcile_concurrency,
            collection_concurrency: self.collection_concurrency,
            event_buffer: self.event_buffer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalConfig {
    pub connect_timeout_secs: u64,
    pub max_connections: u32,
    /// Encrypt the whole session, not only the login
    pub encrypt: bool,
    pub trust_server_certificate: bool,
    pub schema: SchemaCatalog,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: defaults::CONNECT_TIMEOUT_SECS,
            max_connections: defaults::MAX_CONNECTIONS,
            encrypt: false,
            trust_server_certificate: defaults::TRUST_SERVER_CERTIFICATE,
            schema: SchemaCatalog::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommerceConfig {
    pub api_version: String,
    pub timeout_secs: u64,
    pub requests_per_second: u32,
    pub max_retries: u32,
    pub page_size: u32,
    pub existence_ceiling: usize,
}

impl Default for CommerceConfig {
    fn default() -> Self {
        Self {
            api_version: defaults::COMMERCE_API_VERSION.to_string(),
            timeout_secs: defaults::COMMERCE_TIMEOUT_SECS,
            requests_per_second: defaults::COMMERCE_REQUESTS_PER_SECOND,
            max_retries: defaults::COMMERCE_MAX_RETRIES,
            page_size: defaults::COMMERCE_PAGE_SIZE,
            existence_ceiling: defaults::COMMERCE_EXISTENCE_CEILING,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL for history and exclusions; data dir when absent
    pub url: Option<String>,
}

impl DatabaseConfig {
    pub fn resolved_url(&self) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        let path = ConfigManager::get_app_data_dir()?.join(defaults::HISTORY_DB_FILE);
        Ok(format!("sqlite://{}", path.display()))
    }
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted logs
    pub json_format: bool,

    pub console_output: bool,

    pub file_output: bool,

    /// Log directory; `<data dir>/logs` when absent
    pub log_dir: Option<PathBuf>,

    /// Number of daily log files to keep
    pub max_files: u32,

    /// Delete log files beyond `max_files` on startup
    pub auto_cleanup_logs: bool,

    /// Module-specific log level filters (e.g., "sqlx": "warn", "reqwest": "info")
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            log_dir: None,
            max_files: defaults::LOG_MAX_FILES,
            auto_cleanup_logs: true,
            module_filters: HashMap::new(),
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub relational: RelationalConfig,
    pub commerce: CommerceConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub stores: Vec<Store>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: String| Err(ConfigError::Validation { message });

        if self.engine.window_size == 0 {
            return fail("engine.window_size must be greater than 0".into());
        }
        if self.engine.parameter_ceiling == 0 {
            return fail("engine.parameter_ceiling must be greater than 0".into());
        }
        let hard_limit = defaults::RELATIONAL_PARAMETER_LIMIT - defaults::RESERVED_PARAMETERS;
        if self.engine.parameter_ceiling >= hard_limit {
            return fail(format!(
                "engine.parameter_ceiling must stay below {hard_limit}"
            ));
        }
        if self.engine.reconcile_concurrency == 0 {
            return fail("engine.reconcile_concurrency must be greater than 0".into());
        }
        if self.engine.heartbeat_interval_secs == 0 {
            return fail("engine.heartbeat_interval_secs must be greater than 0".into());
        }
        if self.commerce.existence_ceiling == 0 {
            return fail("commerce.existence_ceiling must be greater than 0".into());
        }
        if let Err(message) = self.relational.schema.validate() {
            return fail(message);
        }

        let mut ids = HashSet::new();
        for store in &self.stores {
            if !ids.insert(store.id) {
                return fail(format!("duplicate store id {}", store.id));
            }
        }
        Ok(())
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(defaults::APP_DIR))
    }

    /// Get application data directory
    pub fn get_app_data_dir() -> Result<PathBuf> {
        Ok(dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join(defaults::APP_DIR))
    }

    pub fn new() -> Result<Self> {
        Ok(Self {
            config_path: Self::get_config_dir()?.join(defaults::CONFIG_FILE),
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Loads defaults, the config file when present, then the environment.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(self.config_path.clone()).required(false))
            .add_source(
                config::Environment::with_prefix(defaults::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        info!(
            "Loaded configuration from {:?} ({} stores)",
            self.config_path,
            config.stores.len()
        );
        Ok(config)
    }

    /// Writes a default config file on first run, then loads.
    pub async fn initialize_on_first_run(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            if let Some(dir) = self.config_path.parent() {
                fs::create_dir_all(dir)
                    .await
                    .context("Failed to create config directory")?;
            }
            info!("First run detected - writing default configuration to {:?}", self.config_path);
            self.save_config(&AppConfig::default()).await?;
        }
        Ok(self.load()?)
    }

    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.config_path, content)
            .await
            .with_context(|| format!("Failed to write config file {:?}", self.config_path))?;
        Ok(())
    }
}
