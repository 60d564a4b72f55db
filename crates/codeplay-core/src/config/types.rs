//! Configuration type definitions for the dispatcher.
//!
//! Every section has defaults, so an empty YAML document is a valid
//! configuration. Optional fields let a deployment override only what it
//! needs (a longer Python timeout, a Docker backend for JavaScript, ...).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::core_types::Language;
use crate::errors::ExecutionError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeplayConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Engine invocations allowed to run at the same time; the rest queue.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// How often idle sessions are expired and idle engines evicted.
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

impl DispatcherConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_capacity")]
    pub capacity: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl RegistryConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Idle time after which sessions without an owner are dropped.
    #[serde(default = "default_anonymous_ttl_secs")]
    pub anonymous_ttl_secs: u64,
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Risk scores strictly above this block execution (0-10 scale).
    #[serde(default = "default_risk_threshold")]
    pub risk_threshold: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LimitOverride {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub per_language: HashMap<Language, LimitOverride>,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_max_memory_limit_bytes")]
    pub max_memory_limit_bytes: u64,
}

/// How a language is executed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum EngineBackend {
    /// Child process running a local interpreter.
    Process(ProcessEngineConfig),
    /// Throwaway container per execution.
    Docker(DockerEngineConfig),
    /// In-process engine shipped with the crate (markup, demo).
    Builtin,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessEngineConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub file_extension: String,
    /// Command used to install a package into a session directory.
    /// `{package}` and `{target}` are substituted. Leave unset to rely on
    /// whatever the interpreter already has installed.
    #[serde(default)]
    pub package_install: Option<Vec<String>>,
    /// Command that exits 0 when a package is importable without installing.
    /// `{interpreter}` and `{package}` are substituted. Used when no install
    /// command is set.
    #[serde(default)]
    pub package_check: Option<Vec<String>>,
    /// Environment variable pointing the interpreter at installed packages.
    #[serde(default)]
    pub package_path_env: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl ProcessEngineConfig {
    pub fn python() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["-u".to_string()],
            file_extension: "py".to_string(),
            package_install: None,
            package_check: Some(vec![
                "{interpreter}".to_string(),
                "-c".to_string(),
                "import importlib.util, sys; sys.exit(importlib.util.find_spec(sys.argv[1]) is None)".to_string(),
                "{package}".to_string(),
            ]),
            package_path_env: Some("PYTHONPATH".to_string()),
            env: HashMap::new(),
            max_output_bytes: default_max_output_bytes(),
        }
    }

    pub fn node() -> Self {
        Self {
            command: "node".to_string(),
            args: Vec::new(),
            file_extension: "js".to_string(),
            package_install: None,
            package_check: None,
            package_path_env: None,
            env: HashMap::new(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DockerEngineConfig {
    pub image: String,
    /// Interpreter invocation; the script path is appended.
    pub command: Vec<String>,
    pub file_extension: String,
    #[serde(default = "default_true")]
    pub disable_network: bool,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

/// Per-language backend choice. Languages not listed use the defaults from
/// [`EnginesConfig::backend_for`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnginesConfig {
    #[serde(flatten)]
    pub backends: HashMap<Language, EngineBackend>,
}

impl EnginesConfig {
    pub fn backend_for(&self, language: Language) -> EngineBackend {
        if let Some(backend) = self.backends.get(&language) {
            return backend.clone();
        }
        match language {
            Language::Python => EngineBackend::Process(ProcessEngineConfig::python()),
            Language::JavaScript => EngineBackend::Process(ProcessEngineConfig::node()),
            Language::Html | Language::Markdown | Language::Demo => EngineBackend::Builtin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_registry_capacity() -> usize {
    5
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_history_limit() -> usize {
    10
}

fn default_anonymous_ttl_secs() -> u64 {
    3600
}

fn default_maintenance_interval_secs() -> u64 {
    60
}

fn default_max_tags() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_risk_threshold() -> f32 {
    7.0
}

fn default_max_timeout_ms() -> u64 {
    120_000
}

fn default_max_memory_limit_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: default_registry_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            anonymous_ttl_secs: default_anonymous_ttl_secs(),
            max_tags: default_max_tags(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            risk_threshold: default_risk_threshold(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            per_language: HashMap::new(),
            max_timeout_ms: default_max_timeout_ms(),
            max_memory_limit_bytes: default_max_memory_limit_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CodeplayConfig {
    pub fn validate(&self) -> Result<(), ExecutionError> {
        if self.dispatcher.max_concurrent == 0 {
            return Err(ExecutionError::ConfigError(
                "dispatcher.max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.dispatcher.maintenance_interval_secs == 0 {
            return Err(ExecutionError::ConfigError(
                "dispatcher.maintenance_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.registry.capacity == 0 {
            return Err(ExecutionError::ConfigError(
                "registry.capacity must be greater than 0".to_string(),
            ));
        }

        if self.sessions.history_limit == 0 {
            return Err(ExecutionError::ConfigError(
                "sessions.history_limit must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=10.0).contains(&self.security.risk_threshold) {
            return Err(ExecutionError::ConfigError(format!(
                "security.risk_threshold must be between 0 and 10, got {}",
                self.security.risk_threshold
            )));
        }

        if self.limits.max_timeout_ms == 0 || self.limits.max_memory_limit_bytes == 0 {
            return Err(ExecutionError::ConfigError(
                "limits maxima must be greater than 0".to_string(),
            ));
        }

        for (language, limit) in &self.limits.per_language {
            if let Some(timeout) = limit.timeout_ms {
                if timeout == 0 || timeout > self.limits.max_timeout_ms {
                    return Err(ExecutionError::ConfigError(format!(
                        "limits.per_language.{}.timeout_ms must be between 1 and {}",
                        language, self.limits.max_timeout_ms
                    )));
                }
            }
            if let Some(memory) = limit.memory_limit_bytes {
                if memory == 0 || memory > self.limits.max_memory_limit_bytes {
                    return Err(ExecutionError::ConfigError(format!(
                        "limits.per_language.{}.memory_limit_bytes must be between 1 and {}",
                        language, self.limits.max_memory_limit_bytes
                    )));
                }
            }
        }

        for (language, backend) in &self.engines.backends {
            match backend {
                EngineBackend::Process(process) if process.command.is_empty() => {
                    return Err(ExecutionError::ConfigError(format!(
                        "engines.{}.command cannot be empty",
                        language
                    )));
                }
                EngineBackend::Docker(docker) if docker.image.is_empty() => {
                    return Err(ExecutionError::ConfigError(format!(
                        "engines.{}.image cannot be empty",
                        language
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}
