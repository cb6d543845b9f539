//! Module F (ambient), layered configuration.
//!
//! Modeled on the teacher's `state::config::KideConfig` /
//! `state::config_loader::ConfigLoader`: a defaulted struct, a small set of
//! candidate TOML file paths, and environment variable overrides under a
//! fixed prefix.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{ConfigError, ConfigResult};

const ENV_PREFIX: &str = "REFLECTOR";

/// Runtime configuration record exposed by the engine (spec.md §6).
#[derive(Debug, Clone, PartialEq)]
pub struct ReflectorConfig {
    /// `watcher.timeout`: seconds before a watch session is force-restarted.
    pub watcher_timeout: Duration,
    /// `watcher.queueCapacity`: bound on the watch-to-reconcile channel.
    pub watcher_queue_capacity: usize,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            watcher_timeout: Duration::from_secs(3600),
            watcher_queue_capacity: 256,
        }
    }
}

/// The subset of [`ReflectorConfig`] that round-trips through a TOML file.
#[derive(Debug, Clone, Deserialize, Default)]
struct FileConfig {
    watcher: Option<FileWatcherConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct FileWatcherConfig {
    timeout: Option<u64>,
    queue_capacity: Option<usize>,
}

pub struct ConfigLoader {
    env_prefix: String,
    config_paths: Vec<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            env_prefix: ENV_PREFIX.to_string(),
            config_paths: vec![
                PathBuf::from("reflector.toml"),
                PathBuf::from("config/reflector.toml"),
            ],
        }
    }

    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn add_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_paths.push(path.into());
        self
    }

    /// Loads defaults, overlays the first config file found, then overlays
    /// environment variables, then validates. Env always wins over file.
    pub fn load(&self) -> ConfigResult<ReflectorConfig> {
        let mut config = ReflectorConfig::default();

        if let Some(file_config) = self.load_from_file()? {
            if let Some(w) = file_config.watcher {
                if let Some(t) = w.timeout {
                    config.watcher_timeout = Duration::from_secs(t);
                }
                if let Some(c) = w.queue_capacity {
                    config.watcher_queue_capacity = c;
                }
            }
        }

        config = self.load_from_env(config)?;
        self.validate(&config)?;
        Ok(config)
    }

    fn load_from_file(&self) -> ConfigResult<Option<FileConfig>> {
        for path in &self.config_paths {
            if !path.exists() {
                continue;
            }
            return self.parse_file(path).map(Some);
        }
        Ok(None)
    }

    fn parse_file(&self, path: &Path) -> ConfigResult<FileConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            error: e.to_string(),
        })
    }

    fn load_from_env(&self, mut config: ReflectorConfig) -> ConfigResult<ReflectorConfig> {
        if let Ok(value) = env::var(format!("{}_WATCHER_TIMEOUT", self.env_prefix)) {
            let secs = value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                field: "watcher.timeout".to_string(),
                value: value.clone(),
                expected: "positive integer (seconds)".to_string(),
            })?;
            config.watcher_timeout = Duration::from_secs(secs);
        }

        if let Ok(value) = env::var(format!("{}_WATCHER_QUEUE_CAPACITY", self.env_prefix)) {
            let cap = value.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                field: "watcher.queueCapacity".to_string(),
                value: value.clone(),
                expected: "positive integer".to_string(),
            })?;
            config.watcher_queue_capacity = cap;
        }

        Ok(config)
    }

    fn validate(&self, config: &ReflectorConfig) -> ConfigResult<()> {
        if config.watcher_timeout.as_secs() == 0 {
            return Err(ConfigError::InvalidValue {
                field: "watcher.timeout".to_string(),
                value: "0".to_string(),
                expected: "positive integer (seconds)".to_string(),
            });
        }
        if config.watcher_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "watcher.queueCapacity".to_string(),
                value: "0".to_string(),
                expected: "positive integer".to_string(),
            });
        }
        Ok(())
    }
}

/// Builds a `kube::Client`, preferring the in-cluster service account config
/// and falling back to the local kubeconfig (spec.md §6).
pub async fn build_client() -> ConfigResult<kube::Client> {
    let config = match kube::Config::incluster() {
        Ok(c) => c,
        Err(_) => kube::Config::infer()
            .await
            .map_err(|e| ConfigError::ClientBuild(e.to_string()))?,
    };
    kube::Client::try_from(config).map_err(|e| ConfigError::ClientBuild(e.to_string()))
}
