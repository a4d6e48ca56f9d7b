//! Configuration management for keyrate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{KeyrateError, Result};
use crate::ratelimit::{LimiterRegistry, PolicySet, DEFAULT_CAPACITY};

/// Prefix for environment variable overrides, e.g. `KEYRATE__REGISTRY__CAPACITY`.
const ENV_PREFIX: &str = "KEYRATE";

/// Main configuration for keyrate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyrateConfig {
    /// Registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Policies for newly seen keys
    #[serde(default)]
    pub policies: PolicySet,
}

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of limiters held before LRU eviction
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl RegistryConfig {
    /// Build an empty registry with this configuration.
    pub fn build(&self) -> Result<LimiterRegistry> {
        LimiterRegistry::new(self.capacity)
    }
}

impl KeyrateConfig {
    /// Load configuration from a YAML file, with `KEYRATE__*` environment
    /// variables taking precedence over values in the file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(KeyrateError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| KeyrateError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
