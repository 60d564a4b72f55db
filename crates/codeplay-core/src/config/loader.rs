//! Configuration loader for YAML files and environment overrides
//!
//! Values come from three layers: built-in defaults, the YAML document and
//! finally `CODEPLAY_*` environment variables. The merged result is validated
//! before it is handed out.

use crate::config::types::*;
use crate::errors::ExecutionError;
use std::env;
use std::path::Path;
use tokio::fs;

pub const ENV_MAX_CONCURRENT: &str = "CODEPLAY_MAX_CONCURRENT";
pub const ENV_REGISTRY_CAPACITY: &str = "CODEPLAY_REGISTRY_CAPACITY";
pub const ENV_LOG_LEVEL: &str = "CODEPLAY_LOG_LEVEL";
pub const ENV_SECURITY_ENABLED: &str = "CODEPLAY_SECURITY_ENABLED";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<CodeplayConfig, ExecutionError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            ExecutionError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub async fn from_file_or_default<P: AsRef<Path>>(
        path: P,
    ) -> Result<CodeplayConfig, ExecutionError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::from_file(path).await
        } else {
            log::info!(
                "Config file {} not found, using defaults",
                path.display()
            );
            Self::from_defaults()
        }
    }

    pub fn from_defaults() -> Result<CodeplayConfig, ExecutionError> {
        let mut config = CodeplayConfig::default();
        Self::apply_environment(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<CodeplayConfig, ExecutionError> {
        let mut config: CodeplayConfig = if content.trim().is_empty() {
            CodeplayConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                ExecutionError::ConfigError(format!("Failed to parse YAML config: {}", e))
            })?
        };

        Self::apply_environment(&mut config)?;
        config.validate()?;

        Ok(config)
    }

    /// Apply `CODEPLAY_*` overrides on top of the parsed document.
    pub fn apply_environment(config: &mut CodeplayConfig) -> Result<(), ExecutionError> {
        if let Some(value) = Self::read_env(ENV_MAX_CONCURRENT) {
            config.dispatcher.max_concurrent = Self::parse_env(ENV_MAX_CONCURRENT, &value)?;
        }

        if let Some(value) = Self::read_env(ENV_REGISTRY_CAPACITY) {
            config.registry.capacity = Self::parse_env(ENV_REGISTRY_CAPACITY, &value)?;
        }

        if let Some(value) = Self::read_env(ENV_LOG_LEVEL) {
            config.logging.level = value;
        }

        if let Some(value) = Self::read_env(ENV_SECURITY_ENABLED) {
            config.security.enabled = match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ExecutionError::ConfigError(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_SECURITY_ENABLED, other
                    )))
                }
            };
        }

        Ok(())
    }

    fn read_env(key: &str) -> Option<String> {
        env::var(key)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ExecutionError> {
        value.parse().map_err(|_| {
            ExecutionError::ConfigError(format!("{} has an invalid value: '{}'", key, value))
        })
    }
}
