//! Built-in rule table.
//!
//! Each row is `(id, languages, pattern, severity, category, message)`. An
//! empty language list applies the rule to every language. Critical rows are
//! reserved for patterns with no plausible use in a teaching snippet; anything
//! a legitimate program might do is high or lower so it only contributes to
//! the risk score.

use crate::core_types::{Language, Severity};

use super::ThreatCategory;

pub(crate) type RuleRow = (
    &'static str,
    &'static [Language],
    &'static str,
    Severity,
    ThreatCategory,
    &'static str,
);

const PY: &[Language] = &[Language::Python];
const JS: &[Language] = &[Language::JavaScript];
const BROWSER: &[Language] = &[Language::JavaScript, Language::Html];
const MARKUP: &[Language] = &[Language::Html, Language::Markdown];
const ANY: &[Language] = &[];

pub(crate) const DEFAULT_RULES: &[RuleRow] = &[
    // Language-agnostic
    (
        "sensitive-system-file",
        ANY,
        r"/etc/(passwd|shadow|sudoers)|/proc/self/|\.ssh/id_",
        Severity::Critical,
        ThreatCategory::Filesystem,
        "Unrestricted filesystem access to sensitive system files",
    ),
    (
        "recursive-root-delete",
        ANY,
        r"rm\s+-[rRf]+\s+/",
        Severity::Critical,
        ThreatCategory::Process,
        "Recursive deletion from the filesystem root",
    ),
    (
        "fork-bomb",
        ANY,
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        Severity::Critical,
        ThreatCategory::Process,
        "Fork bomb",
    ),
    // Python
    (
        "py-os-command",
        PY,
        r"\bos\.(system|popen|exec[lv]p?e?|spawn\w*|fork)\s*\(",
        Severity::Critical,
        ThreatCategory::Process,
        "Spawning shell commands through the os module",
    ),
    (
        "py-subprocess",
        PY,
        r"\bsubprocess\b",
        Severity::Critical,
        ThreatCategory::Process,
        "Spawning processes through subprocess",
    ),
    (
        "py-native-code",
        PY,
        r"\bimport\s+ctypes\b|\bfrom\s+ctypes\b|\bcffi\b",
        Severity::Critical,
        ThreatCategory::Process,
        "Loading native code",
    ),
    (
        "py-open-absolute-path",
        PY,
        r#"\bopen\s*\(\s*[rRbBfF]?['"](/|~|[A-Za-z]:\\)"#,
        Severity::Critical,
        ThreatCategory::Filesystem,
        "Unrestricted filesystem access through an absolute path",
    ),
    (
        "py-recursive-delete",
        PY,
        r"\bshutil\.(rmtree|move|chown)\s*\(",
        Severity::Critical,
        ThreatCategory::Filesystem,
        "Recursive filesystem modification",
    ),
    (
        "py-file-mutation",
        PY,
        r"\bos\.(remove|unlink|rmdir|removedirs|chmod|chown|rename)\s*\(",
        Severity::High,
        ThreatCategory::Filesystem,
        "Modifying files through the os module",
    ),
    (
        "py-dynamic-eval",
        PY,
        r"(?m)(?:^|[^.\w\n])(eval|exec|compile)\s*\(",
        Severity::High,
        ThreatCategory::DynamicEvaluation,
        "Dynamic code evaluation",
    ),
    (
        "py-dynamic-import",
        PY,
        r"__import__\s*\(|\bimportlib\b",
        Severity::High,
        ThreatCategory::DynamicEvaluation,
        "Dynamic module import",
    ),
    (
        "py-introspection",
        PY,
        r"__builtins__|__globals__|__subclasses__|__code__",
        Severity::High,
        ThreatCategory::GlobalMutation,
        "Access to interpreter internals",
    ),
    (
        "py-raw-socket",
        PY,
        r"\bimport\s+socket\b|\bsocket\.socket\s*\(",
        Severity::High,
        ThreatCategory::Network,
        "Raw network socket",
    ),
    (
        "py-http-client",
        PY,
        r"\b(urllib|requests|httpx|aiohttp)\b|\bhttp\.client\b",
        Severity::Medium,
        ThreatCategory::Network,
        "Outbound HTTP request",
    ),
    // JavaScript
    (
        "js-child-process",
        JS,
        r#"require\s*\(\s*['"](node:)?child_process['"]\s*\)|from\s+['"](node:)?child_process['"]"#,
        Severity::Critical,
        ThreatCategory::Process,
        "Spawning processes through child_process",
    ),
    (
        "js-filesystem-module",
        JS,
        r#"require\s*\(\s*['"](node:)?fs(/promises)?['"]\s*\)|from\s+['"](node:)?fs(/promises)?['"]"#,
        Severity::Critical,
        ThreatCategory::Filesystem,
        "Unrestricted filesystem access through the fs module",
    ),
    (
        "js-process-internals",
        JS,
        r"\bprocess\.(binding|dlopen|kill)\s*\(",
        Severity::Critical,
        ThreatCategory::Process,
        "Access to Node.js process internals",
    ),
    (
        "js-network-module",
        JS,
        r#"require\s*\(\s*['"](node:)?(http|https|net|dgram|tls)['"]\s*\)"#,
        Severity::High,
        ThreatCategory::Network,
        "Raw network module",
    ),
    (
        "js-eval",
        BROWSER,
        r"\beval\s*\(",
        Severity::High,
        ThreatCategory::DynamicEvaluation,
        "Dynamic code evaluation",
    ),
    (
        "js-function-constructor",
        BROWSER,
        r"\bnew\s+Function\s*\(",
        Severity::High,
        ThreatCategory::DynamicEvaluation,
        "Function constructor",
    ),
    (
        "js-string-timer",
        BROWSER,
        r#"\bset(Timeout|Interval)\s*\(\s*['"`]"#,
        Severity::Medium,
        ThreatCategory::DynamicEvaluation,
        "Timer with a string body",
    ),
    (
        "js-outbound-request",
        BROWSER,
        r"\bfetch\s*\(|\bXMLHttpRequest\b|\bnew\s+WebSocket\s*\(|\bnavigator\.sendBeacon\b",
        Severity::Medium,
        ThreatCategory::Network,
        "Outbound network request",
    ),
    (
        "js-storage-access",
        BROWSER,
        r"\b(localStorage|sessionStorage|indexedDB)\b|\bdocument\.cookie\b",
        Severity::Medium,
        ThreatCategory::Storage,
        "Browser storage or cookie access",
    ),
    (
        "js-prototype-pollution",
        BROWSER,
        r"__proto__|\bObject\.prototype\.\w+\s*=|\bObject\.setPrototypeOf\s*\(",
        Severity::High,
        ThreatCategory::GlobalMutation,
        "Prototype mutation",
    ),
    (
        "js-global-assignment",
        BROWSER,
        r"\b(globalThis|window|global)\.\w+\s*=[^=]",
        Severity::Low,
        ThreatCategory::GlobalMutation,
        "Assignment to a global object",
    ),
    (
        "js-remote-import",
        BROWSER,
        r#"\bimport\s*\(\s*['"`]https?://|\bimportScripts\s*\("#,
        Severity::High,
        ThreatCategory::ExternalResource,
        "Loading remote code",
    ),
    // Markup
    (
        "markup-external-script",
        MARKUP,
        r#"(?i)<script[^>]+src\s*=\s*['"]?(https?:)?//"#,
        Severity::High,
        ThreatCategory::ExternalResource,
        "External script",
    ),
    (
        "markup-javascript-url",
        MARKUP,
        r"(?i)javascript\s*:",
        Severity::High,
        ThreatCategory::DynamicEvaluation,
        "javascript: URL",
    ),
    (
        "markup-embedded-frame",
        MARKUP,
        r"(?i)<(iframe|object|embed|frame)\b",
        Severity::Medium,
        ThreatCategory::ExternalResource,
        "Embedded frame or plugin",
    ),
    (
        "markup-meta-refresh",
        MARKUP,
        r#"(?i)<meta[^>]+http-equiv\s*=\s*['"]?refresh"#,
        Severity::Medium,
        ThreatCategory::ExternalResource,
        "Automatic redirect",
    ),
    (
        "markup-event-handler",
        MARKUP,
        r"(?i)\son(load|error|click|mouseover|focus|submit)\s*=",
        Severity::Low,
        ThreatCategory::DynamicEvaluation,
        "Inline event handler",
    ),
    (
        "markup-remote-asset",
        MARKUP,
        r#"(?i)<(link|img)[^>]+(href|src)\s*=\s*['"]?https?://"#,
        Severity::Low,
        ThreatCategory::ExternalResource,
        "Remote asset",
    ),
    (
        "markdown-raw-script",
        &[Language::Markdown],
        r"(?i)<script\b",
        Severity::High,
        ThreatCategory::DynamicEvaluation,
        "Raw script tag in Markdown",
    ),
];

/// Pairs of categories that are more dangerous together than apart, with the
/// score bonus applied when both appear in one snippet.
pub(crate) const COMBINATION_BONUSES: &[(ThreatCategory, ThreatCategory, f32)] = &[
    (ThreatCategory::DynamicEvaluation, ThreatCategory::Network, 3.0),
    (ThreatCategory::Process, ThreatCategory::Network, 3.0),
    (ThreatCategory::Filesystem, ThreatCategory::Network, 2.0),
    (ThreatCategory::Storage, ThreatCategory::Network, 1.5),
];
