//! Shared request, result and classification types.
//!
//! These are the values that cross component boundaries: callers build an
//! [`ExecutionRequest`], engines produce an [`ExecutionResult`], and the error
//! classifier attaches a [`ProcessedError`] to every failed result before it
//! leaves the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::ExecutionError;

/// Languages the dispatcher knows how to route.
///
/// The set is closed: unknown tags are rejected when parsing instead of
/// falling through to some default engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Language {
    Python,
    JavaScript,
    Html,
    Markdown,
    Demo,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::JavaScript,
        Language::Html,
        Language::Markdown,
        Language::Demo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Html => "html",
            Language::Markdown => "markdown",
            Language::Demo => "demo",
        }
    }

    /// Human-readable name used in user-facing messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::JavaScript => "JavaScript",
            Language::Html => "HTML",
            Language::Markdown => "Markdown",
            Language::Demo => "Demo",
        }
    }

    /// Guess a language from a file extension (without the dot).
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_lowercase().as_str() {
            "py" => Some(Language::Python),
            "js" | "mjs" | "cjs" => Some(Language::JavaScript),
            "html" | "htm" => Some(Language::Html),
            "md" | "markdown" => Some(Language::Markdown),
            "demo" => Some(Language::Demo),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            "html" | "htm" => Ok(Language::Html),
            "markdown" | "md" => Ok(Language::Markdown),
            "demo" | "demolang" => Ok(Language::Demo),
            _ => Err(ExecutionError::UnsupportedLanguage(s.to_string())),
        }
    }
}

impl TryFrom<String> for Language {
    type Error = ExecutionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Per-request knobs. Anything left unset falls back to the per-language
/// defaults held by the resource governor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Who submitted the request. Owned sessions only record their owner's
    /// executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,
    #[serde(default)]
    pub options: ExecutionOptions,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            session_id: None,
            caller: None,
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.options.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.packages = packages.into_iter().map(Into::into).collect();
        self
    }
}

/// A rendered artifact such as an HTML document or an encoded image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualOutput {
    pub mime_type: String,
    pub content: String,
}

impl VisualOutput {
    pub fn html(content: impl Into<String>) -> Self {
        Self {
            mime_type: "text/html".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_output: Option<VisualOutput>,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_error: Option<ProcessedError>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            visual_output: None,
            execution_time_ms: 0,
            metadata: Map::new(),
            processed_error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            visual_output: None,
            execution_time_ms: 0,
            metadata: Map::new(),
            processed_error: None,
        }
    }

    /// Keep whatever the program printed before it failed.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_visual_output(mut self, visual: VisualOutput) -> Self {
        self.visual_output = Some(visual);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_execution_time(mut self, execution_time_ms: u64) -> Self {
        self.execution_time_ms = execution_time_ms;
        self
    }

    /// Peak memory an engine observed for its own work, if it reported one.
    pub fn reported_memory_bytes(&self) -> Option<u64> {
        self.metadata.get("memory_bytes").and_then(Value::as_u64)
    }
}

/// Ordered from least to most severe, so `max()` picks the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Syntax,
    Runtime,
    Timeout,
    Memory,
    Security,
    Network,
    Unknown,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorType::Syntax => "syntax",
            ErrorType::Runtime => "runtime",
            ErrorType::Timeout => "timeout",
            ErrorType::Memory => "memory",
            ErrorType::Security => "security",
            ErrorType::Network => "network",
            ErrorType::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// A failure after classification, ready to show to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedError {
    pub error_type: ErrorType,
    pub severity: Severity,
    pub user_friendly_message: String,
    pub suggestions: Vec<String>,
    pub can_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    pub original_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_url: Option<String>,
}
