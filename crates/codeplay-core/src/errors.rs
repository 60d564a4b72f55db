//! Error types for the execution pipeline.
//!
//! `ExecutionError` is what internal components hand each other; it never
//! reaches a caller directly. The dispatcher turns every error into a failed
//! `ExecutionResult` after the classifier has processed it, so the variants
//! carry enough structure for classification (limits, scores) while staying
//! `Clone` for shared engine loads.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Code cannot be empty")]
    EmptyCode,
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Security violation: {message}")]
    SecurityViolation { message: String, risk_score: f32 },
    #[error("Execution timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },
    #[error("Memory limit exceeded: used {used_bytes} bytes, limit is {limit_bytes} bytes")]
    MemoryExceeded { used_bytes: u64, limit_bytes: u64 },
    #[error("Execution was cancelled")]
    Cancelled,
    #[error("Failed to load {language} engine: {message}")]
    EngineLoad { language: String, message: String },
    #[error("{0}")]
    Engine(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Caller does not own session {0}")]
    NotSessionOwner(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ExecutionError {
    fn from(err: std::io::Error) -> Self {
        ExecutionError::IoError(err.to_string())
    }
}

// Specific error for the Docker engine
#[derive(Error, Debug)]
pub enum DockerEngineError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("Container exited with code {exit_code:?}")]
    ContainerFailed {
        exit_code: Option<i64>,
        stdout: String,
        stderr: String,
    },
    #[error("I/O error during Docker operation: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Could not create temporary file/directory: {0}")]
    TempFileError(String),
    #[error("Container execution timed out")]
    Timeout,
}

impl From<DockerEngineError> for ExecutionError {
    fn from(err: DockerEngineError) -> Self {
        match err {
            DockerEngineError::IoError(e) => ExecutionError::IoError(e.to_string()),
            DockerEngineError::ContainerFailed { stderr, exit_code, .. } if !stderr.is_empty() => {
                log::debug!("Container failed with exit code {:?}", exit_code);
                ExecutionError::Engine(stderr)
            }
            other => ExecutionError::Engine(other.to_string()),
        }
    }
}
