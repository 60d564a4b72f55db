//! Built-in demo language.
//!
//! A deliberately tiny language used for smoke tests and health checks of the
//! whole pipeline without any external interpreter:
//!
//! ```text
//! // comments are ignored
//! emit('hello')      // appends a line of output
//! sleep(250)         // waits, in milliseconds
//! fail('boom')       // raises a runtime error
//! ```

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::{Engine, EngineCapabilities, EngineFactory};
use crate::core_types::{ExecutionRequest, ExecutionResult, Language};
use crate::errors::ExecutionError;

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Emit(String),
    Sleep(u64),
    Fail(String),
}

pub struct DemoEngine {
    statement: Regex,
}

impl DemoEngine {
    pub fn new() -> Result<Self, ExecutionError> {
        let statement = Regex::new(r#"^(\w+)\s*\(\s*(?:'([^']*)'|"([^"]*)"|(\d+))\s*\)\s*;?$"#)
            .map_err(|e| ExecutionError::EngineLoad {
                language: Language::Demo.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { statement })
    }

    fn parse(&self, code: &str) -> Result<Vec<Statement>, String> {
        let mut statements = Vec::new();
        for (index, raw) in code.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let line_number = index + 1;
            let caps = self.statement.captures(line).ok_or_else(|| {
                format!("SyntaxError: unexpected statement at line {}", line_number)
            })?;
            let name = &caps[1];
            let text = caps.get(2).or_else(|| caps.get(3)).map(|m| m.as_str());
            let number = caps.get(4).map(|m| m.as_str());

            let statement = match (name, text, number) {
                ("emit", Some(text), _) => Statement::Emit(text.to_string()),
                ("emit", None, Some(number)) => Statement::Emit(number.to_string()),
                ("fail", Some(text), _) => Statement::Fail(text.to_string()),
                ("sleep", None, Some(number)) => Statement::Sleep(number.parse().map_err(|_| {
                    format!("SyntaxError: invalid duration at line {}", line_number)
                })?),
                _ => {
                    return Err(format!(
                        "SyntaxError: unknown call '{}' at line {}",
                        name, line_number
                    ))
                }
            };
            statements.push(statement);
        }
        Ok(statements)
    }
}

#[async_trait]
impl Engine for DemoEngine {
    fn language(&self) -> Language {
        Language::Demo
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }

    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let statements = match self.parse(&request.code) {
            Ok(statements) => statements,
            Err(message) => return ExecutionResult::failure(message),
        };

        let count = statements.len();
        let mut lines: Vec<String> = Vec::new();
        for statement in statements {
            match statement {
                Statement::Emit(text) => lines.push(text),
                Statement::Sleep(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                Statement::Fail(message) => {
                    return ExecutionResult::failure(format!("RuntimeError: {}", message))
                        .with_output(lines.join("\n"))
                        .with_metadata("statements", json!(count));
                }
            }
        }

        ExecutionResult::success(lines.join("\n")).with_metadata("statements", json!(count))
    }

    fn validate_code(&self, code: &str) -> bool {
        !code.trim().is_empty() && self.parse(code).is_ok()
    }

    async fn cleanup(&self, _session_id: Option<&str>) {}
}

pub struct DemoEngineFactory;

#[async_trait]
impl EngineFactory for DemoEngineFactory {
    fn language(&self) -> Language {
        Language::Demo
    }

    async fn create(&self) -> Result<Arc<dyn Engine>, ExecutionError> {
        Ok(Arc::new(DemoEngine::new()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(code: &str) -> ExecutionRequest {
        ExecutionRequest::new(code, Language::Demo)
    }

    #[tokio::test]
    async fn test_emit_echoes_text() {
        let engine = DemoEngine::new().unwrap();
        let result = engine.execute(&request("emit('hello')")).await;
        assert!(result.success);
        assert_eq!(result.output, "hello");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_multiple_statements_and_comments() {
        let engine = DemoEngine::new().unwrap();
        let code = "// greet\nemit(\"a\");\n\nemit(42)\nsleep(1)\nemit('b')";
        let result = engine.execute(&request(code)).await;
        assert!(result.success);
        assert_eq!(result.output, "a\n42\nb");
        assert_eq!(result.metadata["statements"], json!(4));
    }

    #[tokio::test]
    async fn test_fail_keeps_partial_output() {
        let engine = DemoEngine::new().unwrap();
        let result = engine.execute(&request("emit('before')\nfail('boom')\nemit('after')")).await;
        assert!(!result.success);
        assert_eq!(result.output, "before");
        assert_eq!(result.error.as_deref(), Some("RuntimeError: boom"));
    }

    #[tokio::test]
    async fn test_syntax_error_reports_line() {
        let engine = DemoEngine::new().unwrap();
        let result = engine.execute(&request("emit('ok')\nprint hello")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("line 2"));
    }

    #[test]
    fn test_validate_code_is_pure() {
        let engine = DemoEngine::new().unwrap();
        assert!(!engine.validate_code("   \n\t"));
        assert!(engine.validate_code("emit('x')"));
        assert!(!engine.validate_code("launch('x')"));
        assert_eq!(engine.validate_code("emit('x')"), engine.validate_code("emit('x')"));
    }
}
