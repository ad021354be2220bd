//! Configuration management for admission control.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AdmissionError, Result};
use crate::ratelimit::{SlidingWindowMode, DEFAULT_CAPACITY, DEFAULT_KEY_PREFIX, MAX_WINDOW};

/// Prefix for environment overrides, e.g. `ADMISSION__STORE__URL`.
pub const ENV_PREFIX: &str = "ADMISSION";

/// Main configuration for admission control.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Local counter configuration
    #[serde(default)]
    pub local: LocalConfig,

    /// Threshold overrides for catalogue policies, by policy name
    #[serde(default)]
    pub policies: HashMap<String, PolicyOverride>,

    /// Threshold overrides for role ceilings, by role label
    #[serde(default)]
    pub roles: HashMap<String, PolicyOverride>,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; when absent only the local counter is used
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for every key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on one admission round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Whether checks use separate calls or one atomic script
    #[serde(default)]
    pub mode: SlidingWindowMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            mode: SlidingWindowMode::default(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

/// Local counter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Maximum number of keys tracked in process
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
        }
    }
}

fn default_cache_size() -> usize {
    DEFAULT_CAPACITY
}

/// Tunable parameters of one policy. Unset fields keep the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    /// Window length in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,

    /// Admissions allowed per window
    #[serde(default)]
    pub max_events: Option<u64>,

    /// Message returned on rejection
    #[serde(default)]
    pub message: Option<String>,
}

impl PolicyOverride {
    pub fn window(&self) -> Option<Duration> {
        self.window_secs.map(Duration::from_secs)
    }
}

impl AdmissionConfig {
    /// Load configuration from an optional YAML file layered with
    /// `ADMISSION__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading admission configuration");
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;
        let config: AdmissionConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AdmissionConfig = serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse admission config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no policy or counter could run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(AdmissionError::Config("store.timeout_ms must be positive".to_string()));
        }
        if self.local.cache_size == 0 {
            return Err(AdmissionError::Config("local.cache_size must be positive".to_string()));
        }
        for (name, tuning) in self.policies.iter().chain(self.roles.iter()) {
            if tuning.window_secs == Some(0) || tuning.max_events == Some(0) {
                return Err(AdmissionError::InvalidPolicy {
                    name: name.clone(),
                    reason: "window_secs and max_events must be positive".to_string(),
                });
            }
            if tuning.window_secs.is_some_and(|secs| secs > MAX_WINDOW.as_secs()) {
                return Err(AdmissionError::InvalidPolicy {
                    name: name.clone(),
                    reason: format!("window_secs must not exceed {}", MAX_WINDOW.as_secs()),
                });
            }
        }
        Ok(())
    }
}
