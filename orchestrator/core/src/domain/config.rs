// Copyright (c) 2026 DocForge Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Runtime configuration for the orchestration core.
//!
//! ```yaml
//! service:
//!   name: contracts
//!   timeout: 30s
//! event_bus:
//!   max_handlers: 100
//!   timeout: 5s
//!   max_history: 1000
//! repository_factory:
//!   cache_enabled: true
//!   cache_timeout: 5m
//! logging:
//!   level: info
//!   format: compact
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "DOCFORGE_CONFIG_PATH";
pub const LOG_LEVEL_ENV: &str = "DOCFORGE_LOG_LEVEL";
pub const SERVICE_TIMEOUT_ENV: &str = "DOCFORGE_SERVICE_TIMEOUT_MS";
pub const REPOSITORY_CACHE_ENV: &str = "DOCFORGE_REPOSITORY_CACHE";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 2] = ["compact", "json"];

/// Per-service behaviour switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Upper bound for a single operation. The caller stops waiting after
    /// this; the underlying store call is not cancelled.
    #[serde(default = "default_service_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Declared for configuration compatibility; operations are not retried.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    #[serde(default = "default_true")]
    pub enable_validation: bool,

    #[serde(default = "default_true")]
    pub enable_logging: bool,

    /// Capacity of the in-memory metric ring buffer.
    #[serde(default = "default_max_records")]
    pub max_metrics: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            version: default_version(),
            timeout: default_service_timeout(),
            retry_attempts: default_retry_attempts(),
            enable_metrics: true,
            enable_validation: true,
            enable_logging: true,
            max_metrics: default_max_records(),
        }
    }
}

impl ServiceConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default)]
    pub enable_logging: bool,

    /// Maximum handlers per event type.
    #[serde(default = "default_max_handlers")]
    pub max_handlers: usize,

    /// Per-handler delivery timeout. The whole fan-out gets twice this.
    #[serde(default = "default_handler_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Declared for configuration compatibility; deliveries are not retried.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_max_records")]
    pub max_history: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            enable_logging: false,
            max_handlers: default_max_handlers(),
            timeout: default_handler_timeout(),
            retry_attempts: default_retry_attempts(),
            max_history: default_max_records(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryFactoryConfig {
    #[serde(default = "default_true")]
    pub enable_logging: bool,

    #[serde(default = "default_true")]
    pub enable_performance_monitoring: bool,

    /// User id applied when a repository is requested without one.
    #[serde(default)]
    pub default_user_id: Option<String>,

    #[serde(default)]
    pub cache_enabled: bool,

    /// Age after which a cached repository is rebuilt. Only consulted when
    /// `cache_enabled` is set.
    #[serde(default = "default_cache_timeout", with = "humantime_serde")]
    pub cache_timeout: Duration,

    /// Capacity of the shared query log.
    #[serde(default = "default_max_records")]
    pub query_log_capacity: usize,
}

impl Default for RepositoryFactoryConfig {
    fn default() -> Self {
        Self {
            enable_logging: true,
            enable_performance_monitoring: true,
            default_user_id: None,
            cache_enabled: false,
            cache_timeout: default_cache_timeout(),
            query_log_capacity: default_max_records(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub event_bus: EventBusConfig,

    #[serde(default)]
    pub repository_factory: RepositoryFactoryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true() -> bool {
    true
}

fn default_service_name() -> String {
    "service".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_service_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_handler_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_cache_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_max_handlers() -> usize {
    100
}

fn default_max_records() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl RuntimeConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover a configuration file:
    /// 1. `DOCFORGE_CONFIG_PATH` environment variable
    /// 2. `./docforge-config.yaml` (working directory)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./docforge-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(explicit_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = explicit_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::debug!("No configuration file found. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            tracing::info!("Environment override: {}={}", LOG_LEVEL_ENV, level);
            self.logging.level = level.to_lowercase();
        }

        if let Some(val) = lookup(SERVICE_TIMEOUT_ENV) {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => {
                    tracing::info!("Environment override: {}={}", SERVICE_TIMEOUT_ENV, ms);
                    self.service.timeout = Duration::from_millis(ms);
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for {}: '{}'. Expected a positive integer. Ignoring.",
                        SERVICE_TIMEOUT_ENV,
                        val
                    );
                }
            }
        }

        if let Some(val) = lookup(REPOSITORY_CACHE_ENV) {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: {}=true", REPOSITORY_CACHE_ENV);
                    self.repository_factory.cache_enabled = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: {}=false", REPOSITORY_CACHE_ENV);
                    self.repository_factory.cache_enabled = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for {}: '{}'. Expected true/false. Ignoring.",
                        REPOSITORY_CACHE_ENV,
                        val
                    );
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.service.name.trim().is_empty() {
            anyhow::bail!("service.name cannot be empty");
        }

        if self.service.timeout.is_zero() {
            anyhow::bail!("service.timeout must be greater than zero");
        }

        if self.event_bus.max_handlers == 0 {
            anyhow::bail!("event_bus.max_handlers must be at least 1");
        }

        if self.event_bus.timeout.is_zero() {
            anyhow::bail!("event_bus.timeout must be greater than zero");
        }

        if self.repository_factory.cache_enabled && self.repository_factory.cache_timeout.is_zero() {
            anyhow::bail!("repository_factory.cache_timeout must be greater than zero when caching is enabled");
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid logging.level: '{}'. Must be one of {:?}",
                self.logging.level,
                LOG_LEVELS
            );
        }

        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            anyhow::bail!(
                "Invalid logging.format: '{}'. Must be one of {:?}",
                self.logging.format,
                LOG_FORMATS
            );
        }

        Ok(())
    }
}
