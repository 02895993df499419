//! Configuration System
//!
//! Layered configuration: built-in defaults, then an optional TOML file, then
//! `AAE__`-prefixed environment variables (`AAE__COORDINATOR__EXPIRE_AFTER_US=...`).

use crate::error::CoordinatorError;
use crate::hashtree::TreeOptions;
use crate::logging::LoggingConfig;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AaeConfig {
    /// Coordinator settings
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-partition coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Base path for persisted tree segments
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Built trees older than this are discarded on the next poke (microseconds)
    #[serde(default = "default_expire_after_us")]
    pub expire_after_us: u64,

    /// Delay before re-poking after a build was refused a permit (milliseconds)
    #[serde(default = "default_build_retry_delay_ms")]
    pub build_retry_delay_ms: u64,

    /// Tree geometry
    #[serde(default)]
    pub tree: TreeOptions,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/anti_entropy")
}

fn default_expire_after_us() -> u64 {
    10_000_000
}

fn default_build_retry_delay_ms() -> u64 {
    1_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            expire_after_us: default_expire_after_us(),
            build_retry_delay_ms: default_build_retry_delay_ms(),
            tree: TreeOptions::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults rooted at `storage_root`
    pub fn with_storage_root(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    pub fn expire_after(&self) -> Duration {
        Duration::from_micros(self.expire_after_us)
    }

    pub fn build_retry_delay(&self) -> Duration {
        Duration::from_millis(self.build_retry_delay_ms)
    }

    /// Storage root for one partition
    pub fn partition_root(&self, partition: &crate::tree_id::PartitionIndex) -> PathBuf {
        self.storage_root.join(hex::encode(partition.as_bytes()))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.storage_root.as_os_str().is_empty() {
            return Err("Storage root cannot be empty".to_string());
        }
        self.tree.levels().map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Coordinator(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Coordinator(msg) => write!(f, "Coordinator: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl AaeConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.coordinator.validate() {
            errors.push(ValidationError::Coordinator(e));
        }
        if !matches!(self.logging.format.as_str(), "json" | "text") {
            errors.push(ValidationError::Logging(format!(
                "Invalid log format: {}",
                self.logging.format
            )));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Create a Config builder with defaults applied.
fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("coordinator.storage_root", "data/anti_entropy")?
        .set_default("coordinator.expire_after_us", default_expire_after_us())?
        .set_default("coordinator.build_retry_delay_ms", default_build_retry_delay_ms())
}

/// Loads [`AaeConfig`] from defaults, file and environment
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration, reading `path` if given
    pub fn load(path: Option<&Path>) -> Result<AaeConfig, CoordinatorError> {
        let mut builder = builder_with_defaults()?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("AAE")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: AaeConfig = builder.build()?.try_deserialize()?;
        config.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            CoordinatorError::Config(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<AaeConfig, CoordinatorError> {
        Self::load(Some(path))
    }

    /// Render a configuration as TOML
    pub fn to_toml(config: &AaeConfig) -> Result<String, CoordinatorError> {
        toml::to_string_pretty(config).map_err(|e| CoordinatorError::Config(e.to_string()))
    }
}
