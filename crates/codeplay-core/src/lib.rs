//! Execution dispatcher for running untrusted code snippets in several languages.
//!
//! A caller submits source code with a language tag and gets back textual
//! output, rendered visual output or a classified error, without the code
//! being able to harm the host or other concurrent users. The
//! [`ExecutionDispatcher`] routes each request to an isolated engine and
//! applies the same policy to every language.
//!
//! # Architecture Overview
//!
//! - **Engines**: one contract for interpreters in child processes, Docker containers and in-process renderers
//! - **Security validation**: rule-based static screening with a risk score
//! - **Resource governance**: wall-clock timeouts and memory ceilings around every invocation
//! - **Engine registry**: lazy loading, shared cold starts, LRU and idle eviction
//! - **Sessions**: bounded result history, visibility, tags and expiry
//! - **Error classification**: typed taxonomy, sanitized messages, ranked suggestions
//! - **Configuration**: YAML with environment overrides

pub mod classifier;
pub mod config;
pub mod core_types;
pub mod dispatcher;
pub mod engines;
pub mod errors;
pub mod governor;
pub mod metrics;
pub mod registry;
pub mod security;
pub mod session;

pub use classifier::{ErrorClassifier, ErrorContext};
pub use config::*;
pub use core_types::*;
pub use dispatcher::ExecutionDispatcher;
pub use engines::{Engine, EngineCapabilities, EngineFactory};
pub use errors::ExecutionError;
pub use governor::{MemorySampler, ResourceGovernor, ResourceLimits};
pub use metrics::{ExecutionSample, InMemoryMetrics, MetricsSink, MetricsSnapshot};
pub use registry::EngineRegistry;
pub use security::{SecurityReport, SecurityValidator, SecurityViolation};
pub use session::{Session, SessionManager, SessionObserver};
