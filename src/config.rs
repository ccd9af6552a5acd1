use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::{EngineConfig, EngineIdentity};

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Sync engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: u64,
    pub max_retries: u32,
    pub batch_size: usize,
    pub item_delay_ms: u64,
    pub batch_delay_ms: u64,
    pub reconnect_delay_ms: u64,
    /// 0 disables the sync that follows an enqueue
    pub enqueue_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub probe_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_retries: 3,
            batch_size: 10,
            item_delay_ms: 200,
            batch_delay_ms: 1000,
            reconnect_delay_ms: 1000,
            enqueue_delay_ms: 1000,
            request_timeout_secs: 30,
            probe_interval_secs: 15,
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite queue database
    pub database_path: ConfigValue<PathBuf>,
    /// Base URL of the farm API
    pub api_base_url: ConfigValue<String>,
    /// Bearer token sent with every sync request
    #[serde(skip_serializing)]
    pub auth_token: ConfigValue<Option<String>>,
    pub user_id: ConfigValue<Option<String>>,
    pub device_id: ConfigValue<Option<String>>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub sync: SyncSettings,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    api_base_url: Option<String>,
    auth_token: Option<String>,
    user_id: Option<String>,
    device_id: Option<String>,
    sync: Option<SyncSettings>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut database_path = ConfigValue::new(
            Self::default_data_dir().join("queue.db"),
            ConfigSource::Default,
        );
        let mut api_base_url = ConfigValue::new(
            EngineConfig::default().api_base_url,
            ConfigSource::Default,
        );
        let mut auth_token = ConfigValue::new(None, ConfigSource::Default);
        let mut user_id = ConfigValue::new(None, ConfigSource::Default);
        let mut device_id = ConfigValue::new(None, ConfigSource::Default);
        let mut config_file = None;
        let mut sync = SyncSettings::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Resolve relative paths against config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(url) = file_config.api_base_url {
                api_base_url = ConfigValue::new(url, ConfigSource::File);
            }
            if let Some(token) = file_config.auth_token {
                auth_token = ConfigValue::new(Some(token), ConfigSource::File);
            }
            if let Some(user) = file_config.user_id {
                user_id = ConfigValue::new(Some(user), ConfigSource::File);
            }
            if let Some(device) = file_config.device_id {
                device_id = ConfigValue::new(Some(device), ConfigSource::File);
            }
            if let Some(settings) = file_config.sync {
                sync = settings;
            }
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("FARMSYNC_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("FARMSYNC_API_URL") {
            api_base_url = ConfigValue::new(url, ConfigSource::Environment);
        }
        if let Ok(token) = std::env::var("FARMSYNC_AUTH_TOKEN") {
            auth_token = ConfigValue::new(Some(token), ConfigSource::Environment);
        }
        if let Ok(user) = std::env::var("FARMSYNC_USER_ID") {
            user_id = ConfigValue::new(Some(user), ConfigSource::Environment);
        }
        if let Ok(device) = std::env::var("FARMSYNC_DEVICE_ID") {
            device_id = ConfigValue::new(Some(device), ConfigSource::Environment);
        }

        Ok(Self {
            database_path,
            api_base_url,
            auth_token,
            user_id,
            device_id,
            config_file,
            sync,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        let s = &self.sync;
        EngineConfig {
            api_base_url: self.api_base_url.value.clone(),
            batch_size: s.batch_size.max(1),
            max_retries: s.max_retries.max(1),
            sync_interval: Duration::from_secs(s.interval_secs.max(1)),
            item_delay: Duration::from_millis(s.item_delay_ms),
            batch_delay: Duration::from_millis(s.batch_delay_ms),
            reconnect_delay: Duration::from_millis(s.reconnect_delay_ms),
            enqueue_sync_delay: (s.enqueue_delay_ms > 0)
                .then(|| Duration::from_millis(s.enqueue_delay_ms)),
            request_timeout: Duration::from_secs(s.request_timeout_secs.max(1)),
        }
    }

    pub fn identity(&self) -> EngineIdentity {
        EngineIdentity {
            auth_token: self.auth_token.value.clone(),
            user_id: self.user_id.value.clone(),
            device_id: self.device_id.value.clone(),
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.sync.probe_interval_secs.max(1))
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/farmsync/
    /// - macOS: ~/Library/Application Support/farmsync/
    /// - Windows: %APPDATA%/farmsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("farmsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/farmsync/
    /// - macOS: ~/Library/Application Support/farmsync/
    /// - Windows: %APPDATA%/farmsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("farmsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
