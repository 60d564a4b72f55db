//! In-process renderer for HTML and Markdown.
//!
//! Markup never "runs"; executing it means producing the document a browser
//! frame would show. The rendered page is returned as visual output and
//! carries a restrictive Content-Security-Policy so scripts inside it stay
//! inert when the caller displays it.

use async_trait::async_trait;
use pulldown_cmark::{html, Options, Parser};
use regex::Regex;
use serde_json::json;
use std::sync::Arc;

use super::{Engine, EngineCapabilities, EngineFactory};
use crate::core_types::{ExecutionRequest, ExecutionResult, Language, VisualOutput};
use crate::errors::ExecutionError;

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; style-src 'unsafe-inline'; img-src data:; font-src data:";

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

struct FeaturePatterns {
    heading: Regex,
    link: Regex,
    image: Regex,
    script: Regex,
    style: Regex,
    tag: Regex,
}

impl FeaturePatterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            heading: Regex::new(r"(?i)<h[1-6][\s>]")?,
            link: Regex::new(r"(?i)<a\s[^>]*href")?,
            image: Regex::new(r"(?i)<img[\s>/]")?,
            script: Regex::new(r"(?i)<script[\s>]")?,
            style: Regex::new(r"(?i)<style[\s>]|\sstyle\s*=")?,
            tag: Regex::new(r"<(/?)([A-Za-z][A-Za-z0-9-]*)[^>]*?(/?)>")?,
        })
    }
}

pub struct MarkupEngine {
    language: Language,
    patterns: FeaturePatterns,
}

impl MarkupEngine {
    pub fn new(language: Language) -> Result<Self, ExecutionError> {
        let patterns = FeaturePatterns::compile().map_err(|e| ExecutionError::EngineLoad {
            language: language.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { language, patterns })
    }

    fn render_markdown(source: &str) -> String {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);
        let parser = Parser::new_ext(source, options);
        let mut body = String::new();
        html::push_html(&mut body, parser);
        body
    }

    fn wrap_document(body: &str) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
             <meta http-equiv=\"Content-Security-Policy\" content=\"{}\">\n</head>\n<body>\n{}\n</body>\n</html>\n",
            CONTENT_SECURITY_POLICY, body
        )
    }

    /// Tags opened but never closed, in opening order. Void elements and
    /// self-closing tags are ignored.
    fn unclosed_tags(&self, document: &str) -> Vec<String> {
        let mut stack: Vec<String> = Vec::new();
        for caps in self.patterns.tag.captures_iter(document) {
            let closing = !caps[1].is_empty();
            let name = caps[2].to_lowercase();
            let self_closing = !caps[3].is_empty();
            if self_closing || VOID_ELEMENTS.contains(&name.as_str()) {
                continue;
            }
            if closing {
                if let Some(pos) = stack.iter().rposition(|open| *open == name) {
                    stack.truncate(pos);
                }
            } else {
                stack.push(name);
            }
        }
        stack
    }

    fn summarize(&self, body: &str) -> serde_json::Value {
        json!({
            "headings": self.patterns.heading.find_iter(body).count(),
            "links": self.patterns.link.find_iter(body).count(),
            "images": self.patterns.image.find_iter(body).count(),
            "scripts": self.patterns.script.find_iter(body).count(),
            "styles": self.patterns.style.find_iter(body).count(),
        })
    }
}

#[async_trait]
impl Engine for MarkupEngine {
    fn language(&self) -> Language {
        self.language
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            renders_visual_output: true,
            ..Default::default()
        }
    }

    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let source = request.code.as_str();
        let (body, is_full_document) = match self.language {
            Language::Markdown => (Self::render_markdown(source), false),
            _ => {
                let lowered = source.to_lowercase();
                let full = lowered.contains("<html") || lowered.contains("<!doctype");
                (source.to_string(), full)
            }
        };

        let document = if is_full_document {
            body.clone()
        } else {
            Self::wrap_document(&body)
        };

        let features = self.summarize(&body);
        let mut result = ExecutionResult::success(format!(
            "Rendered {} document ({} bytes)",
            self.language.display_name(),
            document.len()
        ))
        .with_visual_output(VisualOutput::html(document))
        .with_metadata("features", features);

        if self.language == Language::Html {
            let unclosed = self.unclosed_tags(&body);
            if !unclosed.is_empty() {
                result = result.with_metadata("unclosed_tags", json!(unclosed));
            }
        }

        result
    }

    async fn cleanup(&self, _session_id: Option<&str>) {}
}

pub struct MarkupEngineFactory {
    language: Language,
}

impl MarkupEngineFactory {
    pub fn new(language: Language) -> Self {
        Self { language }
    }
}

#[async_trait]
impl EngineFactory for MarkupEngineFactory {
    fn language(&self) -> Language {
        self.language
    }

    async fn create(&self) -> Result<Arc<dyn Engine>, ExecutionError> {
        Ok(Arc::new(MarkupEngine::new(self.language)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_markdown_renders_visual_output() {
        let engine = MarkupEngine::new(Language::Markdown).unwrap();
        let request = ExecutionRequest::new("# Title\n\nSome [link](https://example.com)", Language::Markdown);
        let result = engine.execute(&request).await;

        assert!(result.success);
        let visual = result.visual_output.unwrap();
        assert_eq!(visual.mime_type, "text/html");
        assert!(visual.content.contains("<h1>Title</h1>"));
        assert!(visual.content.contains("Content-Security-Policy"));
        assert_eq!(result.metadata["features"]["headings"], json!(1));
        assert_eq!(result.metadata["features"]["links"], json!(1));
    }

    #[tokio::test]
    async fn test_html_fragment_is_wrapped_and_checked() {
        let engine = MarkupEngine::new(Language::Html).unwrap();
        let request = ExecutionRequest::new("<div><p>hi<br></p><section>", Language::Html);
        let result = engine.execute(&request).await;

        assert!(result.success);
        assert!(result.visual_output.unwrap().content.starts_with("<!DOCTYPE html>"));
        assert_eq!(result.metadata["unclosed_tags"], json!(["div", "section"]));
    }

    #[tokio::test]
    async fn test_full_html_document_is_kept() {
        let engine = MarkupEngine::new(Language::Html).unwrap();
        let page = "<!DOCTYPE html><html><body><h2>x</h2></body></html>";
        let result = engine.execute(&ExecutionRequest::new(page, Language::Html)).await;
        assert_eq!(result.visual_output.unwrap().content, page);
        assert!(result.metadata.get("unclosed_tags").is_none());
    }

    #[test]
    fn test_capabilities() {
        let engine = MarkupEngine::new(Language::Html).unwrap();
        let caps = engine.capabilities();
        assert!(caps.renders_visual_output);
        assert!(!caps.supports_packages);
        assert!(!engine.validate_code(" "));
    }
}
