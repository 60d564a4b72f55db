//! Configuration module for the dispatcher
//!
//! Supports YAML configuration files layered over built-in defaults, with
//! `CODEPLAY_*` environment variables taking precedence.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;

use crate::errors::ExecutionError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<CodeplayConfig, ExecutionError> {
    ConfigLoader::from_file(path).await
}

/// Validate a configuration
pub fn validate_config(config: &CodeplayConfig) -> Result<(), ExecutionError> {
    config.validate()
}
