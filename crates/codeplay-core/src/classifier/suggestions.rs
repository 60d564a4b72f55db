//! Known error signatures and the fixes to suggest for them.
//!
//! Each row is `(languages, pattern, suggestions)`. `{1}`, `{2}`, ... in a
//! suggestion are replaced with the pattern's capture groups. Rows are tried
//! in order and every matching row contributes, most specific rows first.

use regex::Regex;

use crate::core_types::{ErrorType, Language};

type SignatureRow = (&'static [Language], &'static str, &'static [&'static str]);

const PY: &[Language] = &[Language::Python];
const JS: &[Language] = &[Language::JavaScript];
const ANY: &[Language] = &[];

const SIGNATURES: &[SignatureRow] = &[
    (
        PY,
        r"name '(\w+)' is not defined",
        &[
            "Check that `{1}` is spelled correctly",
            "Define `{1}` before the line that uses it",
            "If `{1}` comes from a module, import it first",
        ],
    ),
    (
        PY,
        r"No module named '([\w.]+)'",
        &[
            "The module `{1}` is not installed in this environment",
            "Add `{1}` to the packages of your request",
            "Check the spelling of `{1}`",
        ],
    ),
    (
        PY,
        r"IndentationError|TabError",
        &[
            "Indent each block with 4 spaces",
            "Do not mix tabs and spaces in one file",
        ],
    ),
    (
        PY,
        r"ZeroDivisionError",
        &["Check that the divisor is not zero before dividing"],
    ),
    (
        PY,
        r"unsupported operand type\(s\) for [^:]+: '(\w+)' and '(\w+)'",
        &["Convert the values to a common type before combining `{1}` and `{2}`"],
    ),
    (
        PY,
        r"(list|tuple|string) index out of range",
        &["Check the {1} length with len() before indexing"],
    ),
    (
        PY,
        r"KeyError: '([^'\n]+)'",
        &["The key `{1}` does not exist; use .get('{1}') to fall back to a default"],
    ),
    (
        PY,
        r"'(\w+)' object has no attribute '(\w+)'",
        &["`{1}` values have no attribute `{2}`; check the spelling and the value's type"],
    ),
    (
        PY,
        r"RecursionError",
        &["Make sure your recursive function reaches a base case"],
    ),
    (
        JS,
        r"ReferenceError: (\w+) is not defined",
        &[
            "Declare `{1}` with let or const before using it",
            "Check the spelling of `{1}`",
        ],
    ),
    (
        JS,
        r"Cannot read properties of (undefined|null)(?: \(reading '(\w+)'\))?",
        &["Make sure the value is not {1} before reading its properties"],
    ),
    (
        JS,
        r"TypeError: (\S+) is not a function",
        &["`{1}` is not a function; check its name and what it holds"],
    ),
    (
        JS,
        r"Unexpected end of input",
        &["A block or string is never closed; check matching braces and quotes"],
    ),
    (
        JS,
        r"Unexpected token",
        &["Look for a missing bracket, parenthesis or comma near the reported position"],
    ),
    (
        JS,
        r"Maximum call stack size exceeded",
        &["Make sure your recursive function reaches a base case"],
    ),
    (
        &[Language::Demo],
        r"unexpected statement at line (\d+)",
        &["Line {1} is not a valid statement; use emit('text'), sleep(ms) or fail('message')"],
    ),
    (ANY, r"Code cannot be empty", &["Write some code before running it"]),
    (
        ANY,
        r"Unsupported language: (\S+)",
        &["`{1}` is not supported; choose python, javascript, html, markdown or demo"],
    ),
];

const HELP_LINKS: &[(Language, &str)] = &[
    (Language::Python, "https://docs.python.org/3/tutorial/errors.html"),
    (
        Language::JavaScript,
        "https://developer.mozilla.org/en-US/docs/Web/JavaScript/Reference/Errors",
    ),
    (Language::Html, "https://developer.mozilla.org/en-US/docs/Web/HTML"),
    (Language::Markdown, "https://commonmark.org/help/"),
];

pub(crate) struct SuggestionSignature {
    languages: &'static [Language],
    pattern: Regex,
    suggestions: &'static [&'static str],
}

impl SuggestionSignature {
    fn applies_to(&self, language: Option<Language>) -> bool {
        match language {
            Some(language) => self.languages.is_empty() || self.languages.contains(&language),
            None => self.languages.is_empty(),
        }
    }

    fn render(&self, message: &str) -> Option<Vec<String>> {
        let caps = self.pattern.captures(message)?;
        Some(
            self.suggestions
                .iter()
                .map(|template| {
                    let mut text = template.to_string();
                    for index in 1..caps.len() {
                        let value = caps.get(index).map(|m| m.as_str()).unwrap_or("");
                        text = text.replace(&format!("{{{}}}", index), value);
                    }
                    text
                })
                .collect(),
        )
    }
}

pub(crate) fn compile_signatures() -> Vec<SuggestionSignature> {
    SIGNATURES
        .iter()
        .filter_map(|(languages, pattern, suggestions)| match Regex::new(pattern) {
            Ok(compiled) => Some(SuggestionSignature {
                languages: *languages,
                pattern: compiled,
                suggestions: *suggestions,
            }),
            Err(e) => {
                log::error!("Skipping error signature '{}': {}", pattern, e);
                None
            }
        })
        .collect()
}

/// Fixes from every signature that matches `message`, in table order.
pub(crate) fn signature_suggestions(
    signatures: &[SuggestionSignature],
    message: &str,
    language: Option<Language>,
) -> Vec<String> {
    signatures
        .iter()
        .filter(|signature| signature.applies_to(language))
        .filter_map(|signature| signature.render(message))
        .flatten()
        .collect()
}

/// Generic advice for a class of failure.
pub(crate) fn type_suggestions(error_type: ErrorType) -> &'static [&'static str] {
    match error_type {
        ErrorType::Syntax => &["Check for missing brackets, quotes or colons near the reported line"],
        ErrorType::Runtime => &[
            "Read the last line of the error for the exact cause",
            "Print intermediate values to find where they stop matching your expectations",
        ],
        ErrorType::Timeout => &[
            "Look for loops that never reach their exit condition",
            "Try a smaller input first",
            "Remove long sleep or wait calls",
        ],
        ErrorType::Memory => &[
            "Process data in smaller chunks instead of loading it all at once",
            "Avoid building very large lists or strings",
        ],
        ErrorType::Security => &[
            "Remove access to system files, processes and the network",
            "Sandboxed code cannot evaluate strings as code or load remote scripts",
        ],
        ErrorType::Network => &[
            "Network access is restricted here; use inline sample data instead",
            "Check the address, then try again later",
        ],
        ErrorType::Unknown => &["Try running the code again"],
    }
}

pub(crate) fn help_url(language: Option<Language>) -> Option<&'static str> {
    let language = language?;
    HELP_LINKS
        .iter()
        .find(|(candidate, _)| *candidate == language)
        .map(|(_, url)| *url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_signatures_compile() {
        assert_eq!(compile_signatures().len(), SIGNATURES.len());
    }

    #[test]
    fn test_capture_substitution() {
        let signatures = compile_signatures();
        let found = signature_suggestions(
            &signatures,
            "NameError: name 'totl' is not defined",
            Some(Language::Python),
        );
        assert_eq!(found[0], "Check that `totl` is spelled correctly");
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn test_signatures_are_language_scoped() {
        let signatures = compile_signatures();
        let message = "ReferenceError: total is not defined";
        assert!(signature_suggestions(&signatures, message, Some(Language::Python)).is_empty());
        assert!(!signature_suggestions(&signatures, message, Some(Language::JavaScript)).is_empty());
    }

    #[test]
    fn test_optional_group_may_be_absent() {
        let signatures = compile_signatures();
        let found = signature_suggestions(
            &signatures,
            "TypeError: Cannot read properties of null",
            Some(Language::JavaScript),
        );
        assert_eq!(found, vec!["Make sure the value is not null before reading its properties"]);
    }

    #[test]
    fn test_help_links() {
        assert!(help_url(Some(Language::Python)).is_some());
        assert!(help_url(Some(Language::Demo)).is_none());
        assert!(help_url(None).is_none());
    }
}
