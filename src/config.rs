//! Dispatcher configuration.
//!
//! Loaded from YAML files or environment variables, with sane defaults for
//! local development against a localhost broker.

use std::time::Duration;

use serde::Deserialize;

use crate::channel::DeliveryOptions;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "NATSCHAN_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "NATSCHAN";

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URL.
    pub url: String,
    /// Prefix for channel subjects and derived stream names.
    pub subject_prefix: String,
    /// Initial connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            subject_prefix: "natschan".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Deadline for one reconcile or channel-removal call, in seconds.
    pub reconcile_timeout_secs: u64,
    /// Upper bound for delivery retry backoff, in milliseconds.
    pub max_backoff_ms: u64,
    /// Delivery defaults applied when a subscriber omits options.
    pub delivery: DeliveryOptions,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout_secs: 60,
            max_backoff_ms: 30_000,
            delivery: DeliveryOptions::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection configuration.
    pub broker: BrokerConfig,
    /// Dispatcher tuning.
    pub dispatcher: DispatcherConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `NATSCHAN_CONFIG` environment variable (if set)
    /// 4. Environment variables with `NATSCHAN__` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
