//! Turns raw failures into a [`ProcessedError`] a user can act on.
//!
//! Typed failures (timeouts, memory, security, cancellation, request shape)
//! map straight to a category. Anything else is classified from its text by
//! trying the category patterns in a fixed order: security, memory, network,
//! timeout, syntax, runtime. The first match wins; no match is `unknown`.

use regex::Regex;

use crate::core_types::{ErrorType, Language, ProcessedError, Severity};
use crate::errors::ExecutionError;

mod suggestions;

use suggestions::{compile_signatures, help_url, signature_suggestions, type_suggestions, SuggestionSignature};

pub const MAX_SUGGESTIONS: usize = 5;

/// What the classifier knows about the failed request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorContext<'a> {
    pub language: Option<Language>,
    pub code: Option<&'a str>,
    pub session_id: Option<&'a str>,
}

impl<'a> ErrorContext<'a> {
    pub fn new(language: Language) -> Self {
        Self {
            language: Some(language),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: &'a str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_session(mut self, session_id: Option<&'a str>) -> Self {
        self.session_id = session_id;
        self
    }
}

pub fn severity_for(error_type: ErrorType) -> Severity {
    match error_type {
        ErrorType::Syntax => Severity::Low,
        ErrorType::Runtime | ErrorType::Timeout | ErrorType::Network | ErrorType::Unknown => Severity::Medium,
        ErrorType::Memory => Severity::High,
        ErrorType::Security => Severity::Critical,
    }
}

/// Delay before a retry makes sense, or `None` when retrying cannot help.
pub fn retry_delay_ms(error_type: ErrorType) -> Option<u64> {
    match error_type {
        ErrorType::Syntax | ErrorType::Security | ErrorType::Memory => None,
        ErrorType::Runtime | ErrorType::Unknown => Some(1_000),
        ErrorType::Timeout => Some(2_000),
        ErrorType::Network => Some(5_000),
    }
}

struct Sanitizer {
    path: Regex,
    frame: Regex,
}

impl Sanitizer {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            path: Regex::new(r#"(^|[\s"'(=,])(?:[A-Za-z]:\\|/)(?:[\w.\-]+[/\\])+[\w.\-]*"#)?,
            frame: Regex::new(r#"^\s+(File ".*", line \d+|at .+\(.*\)$|at \S+:\d+:\d+$)"#)?,
        })
    }

    fn sanitize(&self, message: &str) -> String {
        let mut kept = Vec::new();
        let mut skip_source_line = false;
        for line in message.lines() {
            if line.trim_start().starts_with("Traceback (most recent call last)") {
                continue;
            }
            if self.frame.is_match(line) {
                // Python frames are followed by an indented copy of the source line.
                skip_source_line = line.trim_start().starts_with("File ");
                continue;
            }
            if skip_source_line && line.starts_with("    ") {
                skip_source_line = false;
                continue;
            }
            skip_source_line = false;
            kept.push(self.path.replace_all(line, "${1}<path>").into_owned());
        }
        kept.join("\n").trim().to_string()
    }
}

struct CategoryPatterns {
    ordered: Vec<(ErrorType, Regex)>,
    line_number: Regex,
}

impl CategoryPatterns {
    fn compile() -> Result<Self, regex::Error> {
        let table: [(ErrorType, &str); 6] = [
            (
                ErrorType::Security,
                r"(?i)security violation|permission denied|operation not permitted|PermissionError|\bEACCES\b|\bEPERM\b",
            ),
            (
                ErrorType::Memory,
                r"(?i)MemoryError|out of memory|heap out of memory|allocation failed|memory limit|cannot allocate memory",
            ),
            (
                ErrorType::Network,
                r"(?i)ConnectionError|ConnectionRefused|ECONNREFUSED|ECONNRESET|ENOTFOUND|ETIMEDOUT|getaddrinfo|network is unreachable|failed to fetch|NetworkError|urlopen error|Name or service not known",
            ),
            (ErrorType::Timeout, r"(?i)timed out|timeout|deadline exceeded"),
            (
                ErrorType::Syntax,
                r"(?i)SyntaxError|IndentationError|TabError|unexpected token|unexpected end of input|unexpected statement|invalid syntax|Code cannot be empty|Unsupported language",
            ),
            (
                ErrorType::Runtime,
                r"\b\w*(Error|Exception)\b|Traceback|Engine crashed|exited with code|panicked",
            ),
        ];
        let ordered = table
            .iter()
            .map(|(error_type, pattern)| Regex::new(pattern).map(|regex| (*error_type, regex)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self {
            ordered,
            line_number: Regex::new(r"(?i)\bline (\d+)")?,
        })
    }

    fn classify(&self, message: &str) -> ErrorType {
        self.ordered
            .iter()
            .find(|(_, pattern)| pattern.is_match(message))
            .map(|(error_type, _)| *error_type)
            .unwrap_or(ErrorType::Unknown)
    }
}

pub struct ErrorClassifier {
    patterns: CategoryPatterns,
    sanitizer: Sanitizer,
    signatures: Vec<SuggestionSignature>,
}

impl ErrorClassifier {
    pub fn new() -> Result<Self, ExecutionError> {
        let compile_error = |e: regex::Error| ExecutionError::ConfigError(format!("invalid classifier pattern: {}", e));
        Ok(Self {
            patterns: CategoryPatterns::compile().map_err(compile_error)?,
            sanitizer: Sanitizer::compile().map_err(compile_error)?,
            signatures: compile_signatures(),
        })
    }

    /// Strip host paths and traceback frames from raw error text.
    pub fn sanitize_message(&self, message: &str) -> String {
        self.sanitizer.sanitize(message)
    }

    pub fn classify(&self, error: &ExecutionError, context: &ErrorContext<'_>) -> ProcessedError {
        let original = self.sanitize_message(&error.to_string());
        let (error_type, friendly) = match error {
            ExecutionError::Timeout { limit_ms } => (
                ErrorType::Timeout,
                format!(
                    "Execution took longer than the {} limit and was stopped.",
                    format_duration(*limit_ms)
                ),
            ),
            ExecutionError::MemoryExceeded { limit_bytes, .. } => (
                ErrorType::Memory,
                format!(
                    "Your code used more memory than the {} MiB limit.",
                    limit_bytes / (1024 * 1024)
                ),
            ),
            ExecutionError::SecurityViolation { message, .. } => (
                ErrorType::Security,
                format!("This code was blocked for security reasons: {}.", message),
            ),
            ExecutionError::Cancelled => (
                ErrorType::Unknown,
                "Execution was cancelled before it finished.".to_string(),
            ),
            ExecutionError::EmptyCode => (ErrorType::Syntax, "Code cannot be empty.".to_string()),
            ExecutionError::UnsupportedLanguage(tag) => {
                (ErrorType::Syntax, format!("Unsupported language: {}.", tag))
            }
            _ => {
                let error_type = self.patterns.classify(&original);
                let friendly = self.friendly_message(error_type, &original, context);
                (error_type, friendly)
            }
        };
        self.build(error_type, friendly, original, context)
    }

    /// Classify a failure that is only known by its text, such as the error
    /// an engine put in a failed result.
    pub fn classify_message(&self, message: &str, context: &ErrorContext<'_>) -> ProcessedError {
        let original = self.sanitize_message(message);
        let error_type = self.patterns.classify(&original);
        let friendly = self.friendly_message(error_type, &original, context);
        self.build(error_type, friendly, original, context)
    }

    fn build(
        &self,
        error_type: ErrorType,
        user_friendly_message: String,
        original_message: String,
        context: &ErrorContext<'_>,
    ) -> ProcessedError {
        let suggestions = self.suggestions(error_type, &original_message, context.language);
        let retry_delay_ms = retry_delay_ms(error_type);
        log::debug!(
            "Classified failure as {} (session {:?})",
            error_type,
            context.session_id
        );
        ProcessedError {
            error_type,
            severity: severity_for(error_type),
            user_friendly_message,
            suggestions,
            can_retry: retry_delay_ms.is_some(),
            retry_delay_ms,
            original_message,
            help_url: help_url(context.language).map(str::to_string),
        }
    }

    fn suggestions(&self, error_type: ErrorType, message: &str, language: Option<Language>) -> Vec<String> {
        let mut ranked = signature_suggestions(&self.signatures, message, language);
        ranked.extend(type_suggestions(error_type).iter().map(|s| s.to_string()));
        if let Some(language) = language {
            if help_url(Some(language)).is_some() {
                ranked.push(format!(
                    "See the {} documentation linked below for more help",
                    language.display_name()
                ));
            }
        }

        let mut unique: Vec<String> = Vec::new();
        for suggestion in ranked {
            if !unique.contains(&suggestion) {
                unique.push(suggestion);
            }
        }
        unique.truncate(MAX_SUGGESTIONS);
        unique
    }

    fn friendly_message(&self, error_type: ErrorType, message: &str, context: &ErrorContext<'_>) -> String {
        let language = context
            .language
            .map(|language| language.display_name())
            .unwrap_or("your");
        let summary = message
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or(message)
            .trim();

        match error_type {
            ErrorType::Syntax => {
                let location = self.offending_line(message, context.code);
                format!("There is a syntax error in the {} code{}: {}", language, location, summary)
            }
            ErrorType::Runtime => format!("The {} code stopped with an error: {}", language, summary),
            ErrorType::Timeout => "Execution took too long and was stopped.".to_string(),
            ErrorType::Memory => "Your code ran out of memory.".to_string(),
            ErrorType::Security => format!("This code was blocked for security reasons: {}", summary),
            ErrorType::Network => {
                "Your code tried to use the network, which failed or is not allowed here.".to_string()
            }
            ErrorType::Unknown => format!("Something went wrong while running the code: {}", summary),
        }
    }

    /// " at line N" plus the source line itself when the code is known.
    fn offending_line(&self, message: &str, code: Option<&str>) -> String {
        let Some(number) = self
            .patterns
            .line_number
            .captures(message)
            .and_then(|caps| caps[1].parse::<usize>().ok())
        else {
            return String::new();
        };
        let source = code
            .and_then(|code| code.lines().nth(number.saturating_sub(1)))
            .map(str::trim)
            .filter(|line| !line.is_empty());
        match source {
            Some(line) => format!(" at line {} (`{}`)", number, line),
            None => format!(" at line {}", number),
        }
    }
}

fn format_duration(ms: u64) -> String {
    if ms >= 1000 && ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}
