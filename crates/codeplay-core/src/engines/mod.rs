//! Language engines behind a single contract.
//!
//! Every engine, whether it shells out to an interpreter, runs a container or
//! renders markup in-process, implements [`Engine`]. The dispatcher never
//! branches on the concrete engine type; it asks for [`EngineCapabilities`]
//! instead. Engines are created lazily through an [`EngineFactory`], one per
//! language, and the mapping from language to factory lives in
//! [`factory_for`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::config::EngineBackend;
use crate::core_types::{ExecutionRequest, ExecutionResult, Language};
use crate::errors::ExecutionError;

pub mod demo;
pub mod docker;
pub mod markup;
pub mod process;

pub use demo::{DemoEngine, DemoEngineFactory};
pub use docker::{DockerEngine, DockerEngineFactory};
pub use markup::{MarkupEngine, MarkupEngineFactory};
pub use process::{ProcessEngine, ProcessEngineFactory};

/// What an engine can do beyond plain execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCapabilities {
    pub renders_visual_output: bool,
    pub supports_packages: bool,
    pub stateful_across_calls: bool,
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn language(&self) -> Language;

    fn capabilities(&self) -> EngineCapabilities;

    /// Run the request. Failures are reported as `success: false`; an engine
    /// must not let its own faults escape.
    ///
    /// `request.options` already carries the effective limits chosen by the
    /// resource governor.
    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult;

    /// Cheap pre-check with no side effects.
    fn validate_code(&self, code: &str) -> bool {
        !code.trim().is_empty()
    }

    /// Release per-session resources, or everything when `session_id` is `None`.
    async fn cleanup(&self, session_id: Option<&str>);
}

/// Builds an engine on first use. Loading may be expensive (locating an
/// interpreter, connecting to Docker), which is why the registry caches the
/// result and shares in-flight loads.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    fn language(&self) -> Language;

    async fn create(&self) -> Result<Arc<dyn Engine>, ExecutionError>;
}

/// Explicit language-to-engine mapping table.
///
/// Returns `None` when the backend cannot serve the language, which leaves
/// the language unregistered.
pub fn factory_for(language: Language, backend: &EngineBackend) -> Option<Arc<dyn EngineFactory>> {
    match (language, backend) {
        (_, EngineBackend::Disabled) => None,
        (_, EngineBackend::Process(config)) => {
            Some(Arc::new(ProcessEngineFactory::new(language, config.clone())))
        }
        (_, EngineBackend::Docker(config)) => {
            Some(Arc::new(DockerEngineFactory::new(language, config.clone())))
        }
        (Language::Html | Language::Markdown, EngineBackend::Builtin) => {
            Some(Arc::new(MarkupEngineFactory::new(language)))
        }
        (Language::Demo, EngineBackend::Builtin) => Some(Arc::new(DemoEngineFactory)),
        (Language::Python | Language::JavaScript, EngineBackend::Builtin) => {
            log::warn!("No built-in engine exists for {}; language disabled", language);
            None
        }
    }
}

pub(crate) const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Collects program output up to a byte cap while the stream is read, so a
/// chatty program cannot grow host memory. Bytes past the cap are counted
/// and dropped.
#[derive(Debug)]
pub(crate) struct CappedOutput {
    buffer: Vec<u8>,
    max_bytes: usize,
    dropped_bytes: usize,
}

impl CappedOutput {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_bytes,
            dropped_bytes: 0,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        let room = self.max_bytes.saturating_sub(self.buffer.len());
        let kept = chunk.len().min(room);
        self.buffer.extend_from_slice(&chunk[..kept]);
        self.dropped_bytes += chunk.len() - kept;
    }

    pub(crate) fn truncated(&self) -> bool {
        self.dropped_bytes > 0
    }

    /// Lossy UTF-8 text, with a marker when anything was dropped. A character
    /// split by the cap is trimmed.
    pub(crate) fn into_text(self) -> String {
        let truncated = self.truncated();
        let mut text = match String::from_utf8(self.buffer) {
            Ok(text) => text,
            // An incomplete sequence at the very end was cut by the cap.
            Err(e) if truncated && e.utf8_error().error_len().is_none() => {
                let valid = e.utf8_error().valid_up_to();
                let mut bytes = e.into_bytes();
                bytes.truncate(valid);
                String::from_utf8_lossy(&bytes).into_owned()
            }
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        if truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessEngineConfig;

    #[test]
    fn test_mapping_table() {
        assert!(factory_for(Language::Demo, &EngineBackend::Builtin).is_some());
        assert!(factory_for(Language::Markdown, &EngineBackend::Builtin).is_some());
        assert!(factory_for(Language::Python, &EngineBackend::Builtin).is_none());
        assert!(factory_for(Language::Demo, &EngineBackend::Disabled).is_none());

        let factory = factory_for(
            Language::Python,
            &EngineBackend::Process(ProcessEngineConfig::python()),
        )
        .unwrap();
        assert_eq!(factory.language(), Language::Python);
    }

    #[test]
    fn test_capped_output_drops_bytes_past_the_cap() {
        let mut output = CappedOutput::new(4);
        output.push(b"ab");
        output.push(b"cdef");
        output.push(b"ghij");
        assert!(output.truncated());
        assert_eq!(output.into_text(), format!("abcd{}", TRUNCATION_MARKER));

        let mut short = CappedOutput::new(100);
        short.push(b"short");
        assert!(!short.truncated());
        assert_eq!(short.into_text(), "short");
    }

    #[test]
    fn test_capped_output_trims_split_character() {
        let mut output = CappedOutput::new(2);
        output.push("héllo".as_bytes());
        let text = output.into_text();
        assert_eq!(text, format!("h{}", TRUNCATION_MARKER));
    }
}
