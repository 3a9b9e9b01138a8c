//! Request screening that runs before any registry lookup or execution.
//!
//! Checks are heuristic. They reject obviously hostile input early and keep
//! it out of logs and backends, but they are not a sandbox.

use std::fmt;
use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::RegexSet;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use super::error::{ErrorCode, ToolExecutionError};
use super::types::{ExecutionOptions, ExecutionRequest};
use super::value::{ParamValue, Parameters, parameters_from_map};

const MAX_IDENTIFIER_CHARS: usize = 100;
const BLOCKED_NAME_FRAGMENTS: [&str; 8] = ["..", "/", "\\", "script", "eval", "exec", "system", "cmd"];

const SENSITIVE_COMPONENTS: [&str; 16] = [
    ".ssh",
    ".aws",
    ".gnupg",
    ".git",
    ".svn",
    ".hg",
    ".env",
    ".npmrc",
    ".netrc",
    "id_rsa",
    "package.json",
    "package-lock.json",
    "cargo.toml",
    "cargo.lock",
    "credentials",
    ".docker",
];

const EXECUTABLE_EXTENSIONS: [&str; 13] = [
    "exe", "bat", "cmd", "sh", "ps1", "dll", "so", "dylib", "com", "msi", "vbs", "jar", "scr",
];

const PATH_FRAGMENTS: [&str; 4] = ["path", "file", "dir", "folder"];

/// Words that contain a path fragment but never name a location.
const PATH_LOOKALIKES: [&str; 10] = [
    "profile",
    "profiles",
    "direct",
    "direction",
    "directions",
    "directive",
    "directives",
    "director",
    "indirect",
    "sympathy",
];

const TRAVERSAL_MARKERS: [&str; 9] = [
    "..", "%2e%2e", "%2e.", ".%2e", "%252e", "%c0%ae", "..%2f", "%2f..", "..%5c",
];

static CONTROL_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    compile(&[
        r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]",
        r"%00",
        r"\\x00",
        r"(?i)\\u0000",
    ])
});

static SCRIPT_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    compile(&[
        r"(?i)<\s*/?\s*script\b",
        r"(?i)\b(java|vb)script\s*:",
        r"(?i)\bon(load|error|click|mouseover|mouseenter|focus|blur|submit|change|keydown|keyup|input)\s*=",
        r"(?i)<\s*(iframe|object|embed|svg|img|link|meta|style|base|form)\b",
        r"(?i)\beval\s*\(",
        r"(?i)\bdocument\s*\.\s*(cookie|write|location|domain)",
        r"(?i)\bwindow\s*\.\s*location",
        r"(?i)\bdata\s*:\s*text/html",
        r"(?i)\bexpression\s*\(",
    ])
});

static TEMPLATE_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    compile(&[
        r"\{\{.*\}\}",
        r"\$\{[^}]*\}",
        r"\{%.*%\}",
        r"<%.*%>",
        r"#\{[^}]*\}",
    ])
});

static COMMAND_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    compile(&[
        r"(?i)(;|&&|\|\|?|&)\s*(rm|curl|wget|bash|sh|zsh|nc|ncat|netcat|python[0-9.]*|perl|ruby|php|powershell|cmd|chmod|chown|kill|sudo|mkfifo|telnet|whoami)\b",
        r"\$\([^)]*\)",
        r"(?i)`\s*(rm|curl|wget|bash|sh|cat|ls|id|whoami|nc|python[0-9.]*|perl|uname)\b",
        r"(?i)\brm\s+-[a-z]*[rf]",
        r"(?i)/bin/(ba|z|da|k)?sh\b",
        r"(?i)\bnc\s+-[a-z]*e\b",
        r"(?i)>\s*/dev/(tcp|udp)/",
        r"(?i)\b(wget|curl)\s+(-\S+\s+)*https?://",
    ])
});

static SQL_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    compile(&[
        r"(?i)\bunion\s+(all\s+)?select\b",
        r"(?i)\bselect\s+\*\s+from\b",
        r"(?i)\bselect\s+[\w,\s]+\s+from\s+\w+\s+where\b",
        r"(?i)\binsert\s+into\s+\w+",
        r"(?i)\bdelete\s+from\s+\w+",
        r"(?i)\bdrop\s+(table|database|schema)\b",
        r"(?i)\btruncate\s+table\b",
        r"(?i)\balter\s+table\b",
        r"(?i)'\s*or\s+'?\w+'?\s*=\s*'?\w+",
        r"(?i)\bor\s+1\s*=\s*1\b",
        r"(;|')\s*--",
        r"(?i)\bxp_cmdshell\b",
        r"(?i)\bwaitfor\s+delay\b",
        r"(?i)\bsleep\s*\(\s*\d+\s*\)",
        r"(?i)\bbenchmark\s*\(",
    ])
});

fn compile(patterns: &[&str]) -> RegexSet {
    // Static literals; `patterns_compile` exercises every set.
    RegexSet::new(patterns).expect("static validation patterns must compile")
}

/// Kind of hostile content detected. Logged for operators only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    SqlInjection,
    CommandInjection,
    ScriptInjection,
    TemplateInjection,
    ControlCharacters,
    PathTraversal,
    AbsolutePath,
    SensitivePath,
    ExecutableExtension,
}

impl ThreatCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SqlInjection => "sql_injection",
            Self::CommandInjection => "command_injection",
            Self::ScriptInjection => "script_injection",
            Self::TemplateInjection => "template_injection",
            Self::ControlCharacters => "control_characters",
            Self::PathTraversal => "path_traversal",
            Self::AbsolutePath => "absolute_path",
            Self::SensitivePath => "sensitive_path",
            Self::ExecutableExtension => "executable_extension",
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationFailure {
    #[error("request body is {size} bytes, limit is {limit}")]
    RequestTooLarge { size: usize, limit: usize },
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("invalid tool name: {0}")]
    InvalidToolName(String),
    #[error("invalid parameter '{path}': {reason}")]
    InvalidParameters { path: String, reason: String },
    #[error("parameter '{path}' exceeds the limit of {limit} {unit}")]
    ParameterTooLarge {
        path: String,
        limit: usize,
        unit: &'static str,
    },
    #[error("parameter '{path}' contains potentially malicious content")]
    MaliciousContent {
        path: String,
        category: ThreatCategory,
    },
}

impl ValidationFailure {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RequestTooLarge { .. } | Self::ParameterTooLarge { .. } => {
                ErrorCode::ParameterTooLarge
            }
            Self::Malformed(_) => ErrorCode::MalformedRequest,
            Self::InvalidToolName(_) => ErrorCode::InvalidToolName,
            Self::InvalidParameters { .. } => ErrorCode::InvalidParameters,
            Self::MaliciousContent { .. } => ErrorCode::MaliciousInput,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::RequestTooLarge { size, limit } => Some(json!({"size": size, "limit": limit})),
            Self::InvalidParameters { path, reason } => {
                Some(json!({"parameter": path, "reason": reason}))
            }
            Self::ParameterTooLarge { path, limit, unit } => {
                Some(json!({"parameter": path, "limit": limit, "unit": unit}))
            }
            Self::MaliciousContent { path, .. } => Some(json!({"parameter": path})),
            Self::Malformed(_) | Self::InvalidToolName(_) => None,
        }
    }
}

impl From<ValidationFailure> for ToolExecutionError {
    fn from(failure: ValidationFailure) -> Self {
        let err = ToolExecutionError::new(failure.code(), failure.to_string());
        match failure.details() {
            Some(details) => err.with_details(details),
            None => err,
        }
    }
}

/// Size limits applied by [`SecurityValidator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    pub max_request_bytes: usize,
    pub max_string_chars: usize,
    pub max_content_chars: usize,
    pub max_path_chars: usize,
    pub max_list_len: usize,
    pub max_depth: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_request_bytes: 1024 * 1024,
            max_string_chars: 10_000,
            max_content_chars: 100_000,
            max_path_chars: 1_024,
            max_list_len: 1_000,
            max_depth: 16,
        }
    }
}

/// How a parameter key shapes the checks applied to its string values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyClass {
    General,
    Content,
    Path,
}

impl KeyClass {
    fn of(key: &str) -> Self {
        let words = key_words(key);
        if words.iter().any(|w| is_path_word(w)) {
            Self::Path
        } else if words.iter().any(|w| is_content_word(w)) {
            Self::Content
        } else {
            Self::General
        }
    }
}

/// Splits `fileName`, `file_name` and `file-name` into lowercase words.
fn key_words(key: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in key.chars() {
        if c == '_' || c == '-' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_ascii_uppercase() && prev_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        current.push(c.to_ascii_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn is_path_word(word: &str) -> bool {
    !PATH_LOOKALIKES.contains(&word) && PATH_FRAGMENTS.iter().any(|f| word.contains(f))
}

fn is_content_word(word: &str) -> bool {
    matches!(
        word,
        "content" | "contents" | "body" | "text" | "notes" | "note" | "message" | "description"
    )
}

/// Checks the shared identifier rule used for tool and parameter names.
pub(crate) fn check_identifier(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("must not be empty".to_owned());
    }
    if name.chars().count() > MAX_IDENTIFIER_CHARS {
        return Err(format!("exceeds {MAX_IDENTIFIER_CHARS} characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err("may only contain letters, digits, '_' and '-'".to_owned());
    }
    Ok(())
}

/// Validates a tool name, including the blocked-fragment list.
pub fn validate_tool_name(name: &str) -> Result<(), ValidationFailure> {
    check_identifier(name).map_err(ValidationFailure::InvalidToolName)?;
    let lower = name.to_lowercase();
    if let Some(fragment) = BLOCKED_NAME_FRAGMENTS
        .iter()
        .find(|fragment| lower.contains(*fragment))
    {
        return Err(ValidationFailure::InvalidToolName(format!(
            "contains blocked fragment '{fragment}'"
        )));
    }
    Ok(())
}

fn screen_text(s: &str) -> Option<ThreatCategory> {
    [
        (&*CONTROL_PATTERNS, ThreatCategory::ControlCharacters),
        (&*SCRIPT_PATTERNS, ThreatCategory::ScriptInjection),
        (&*TEMPLATE_PATTERNS, ThreatCategory::TemplateInjection),
        (&*COMMAND_PATTERNS, ThreatCategory::CommandInjection),
        (&*SQL_PATTERNS, ThreatCategory::SqlInjection),
    ]
    .into_iter()
    .find_map(|(set, category)| set.is_match(s).then_some(category))
}

/// Screens a path value as given and after one and two rounds of
/// percent-decoding.
fn screen_path(s: &str) -> Option<ThreatCategory> {
    let once = percent_decode_str(s).decode_utf8_lossy().into_owned();
    let twice = percent_decode_str(&once).decode_utf8_lossy().into_owned();
    [s, once.as_str(), twice.as_str()]
        .into_iter()
        .find_map(screen_decoded_path)
}

fn screen_decoded_path(s: &str) -> Option<ThreatCategory> {
    let mut chars = s.chars();
    let drive_letter = matches!(
        (chars.next(), chars.next()),
        (Some(c), Some(':')) if c.is_ascii_alphabetic()
    );
    if s.starts_with('/') || s.starts_with('\\') || s.starts_with('~') || drive_letter {
        return Some(ThreatCategory::AbsolutePath);
    }

    let lower = s.to_lowercase();
    if TRAVERSAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(ThreatCategory::PathTraversal);
    }

    let normalized = lower.replace('\\', "/");
    if normalized.contains("etc/passwd") || normalized.contains("etc/shadow") {
        return Some(ThreatCategory::SensitivePath);
    }
    let components: Vec<&str> = normalized.split('/').filter(|c| !c.is_empty()).collect();
    let sensitive = components.iter().any(|component| {
        SENSITIVE_COMPONENTS.contains(component)
            || component.starts_with("id_rsa")
            || component.starts_with(".env.")
    });
    if sensitive {
        return Some(ThreatCategory::SensitivePath);
    }

    let executable = components
        .last()
        .and_then(|file| file.rsplit_once('.'))
        .is_some_and(|(stem, ext)| !stem.is_empty() && EXECUTABLE_EXTENSIONS.contains(&ext));
    executable.then_some(ThreatCategory::ExecutableExtension)
}

/// Screens raw execution requests.
#[derive(Debug, Clone, Default)]
pub struct SecurityValidator {
    limits: ValidationLimits,
}

impl SecurityValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    /// Parses and screens a raw request body for `tool_name`.
    pub fn validate_request(
        &self,
        tool_name: &str,
        body: &[u8],
    ) -> Result<ExecutionRequest, ValidationFailure> {
        let result = self.parse_and_check(tool_name, body);
        if let Err(failure) = &result {
            match failure {
                ValidationFailure::MaliciousContent { path, category } => warn!(
                    name: "gateway.validation.malicious",
                    tool = %tool_name,
                    parameter = %path,
                    category = %category,
                    "Rejected potentially malicious input"
                ),
                other => debug!(
                    name: "gateway.validation.rejected",
                    tool = %tool_name,
                    code = %other.code(),
                    reason = %other,
                    "Rejected invalid request"
                ),
            }
        }
        result
    }

    fn parse_and_check(
        &self,
        tool_name: &str,
        body: &[u8],
    ) -> Result<ExecutionRequest, ValidationFailure> {
        if body.len() > self.limits.max_request_bytes {
            return Err(ValidationFailure::RequestTooLarge {
                size: body.len(),
                limit: self.limits.max_request_bytes,
            });
        }

        let (parameters, options) = parse_body(body)?;
        validate_tool_name(tool_name)?;
        self.validate_parameters(&parameters)?;

        Ok(ExecutionRequest {
            tool_name: tool_name.to_owned(),
            parameters,
            options,
        })
    }

    /// Recursively validates parameter keys and values.
    pub fn validate_parameters(&self, parameters: &Parameters) -> Result<(), ValidationFailure> {
        for (key, value) in parameters {
            self.validate_entry(key, key, value, 1)?;
        }
        Ok(())
    }

    fn validate_entry(
        &self,
        path: &str,
        key: &str,
        value: &ParamValue,
        depth: usize,
    ) -> Result<(), ValidationFailure> {
        check_identifier(key).map_err(|reason| ValidationFailure::InvalidParameters {
            path: path.to_owned(),
            reason: format!("key {reason}"),
        })?;
        self.validate_value(path, KeyClass::of(key), value, depth)
    }

    fn validate_value(
        &self,
        path: &str,
        class: KeyClass,
        value: &ParamValue,
        depth: usize,
    ) -> Result<(), ValidationFailure> {
        if depth > self.limits.max_depth {
            return Err(ValidationFailure::InvalidParameters {
                path: path.to_owned(),
                reason: format!("nesting exceeds {} levels", self.limits.max_depth),
            });
        }

        match value {
            ParamValue::String(s) => self.validate_string(path, class, s),
            ParamValue::List(items) => {
                if items.len() > self.limits.max_list_len {
                    return Err(ValidationFailure::ParameterTooLarge {
                        path: path.to_owned(),
                        limit: self.limits.max_list_len,
                        unit: "elements",
                    });
                }
                items.iter().enumerate().try_for_each(|(i, item)| {
                    self.validate_value(&format!("{path}[{i}]"), class, item, depth + 1)
                })
            }
            ParamValue::Map(map) => map.iter().try_for_each(|(key, item)| {
                self.validate_entry(&format!("{path}.{key}"), key, item, depth + 1)
            }),
            ParamValue::Null | ParamValue::Bool(_) | ParamValue::Number(_) => Ok(()),
        }
    }

    fn validate_string(&self, path: &str, class: KeyClass, s: &str) -> Result<(), ValidationFailure> {
        let limit = match class {
            KeyClass::General => self.limits.max_string_chars,
            KeyClass::Content => self.limits.max_content_chars,
            KeyClass::Path => self.limits.max_path_chars,
        };
        if s.chars().count() > limit {
            return Err(ValidationFailure::ParameterTooLarge {
                path: path.to_owned(),
                limit,
                unit: "characters",
            });
        }

        let threat = if class == KeyClass::Path {
            screen_path(s).or_else(|| screen_text(s))
        } else {
            screen_text(s)
        };
        match threat {
            Some(category) => Err(ValidationFailure::MaliciousContent {
                path: path.to_owned(),
                category,
            }),
            None => Ok(()),
        }
    }
}

fn parse_body(body: &[u8]) -> Result<(Parameters, ExecutionOptions), ValidationFailure> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok((Parameters::new(), ExecutionOptions::default()));
    }

    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ValidationFailure::Malformed(format!("body is not valid JSON: {e}")))?;
    let Value::Object(mut object) = value else {
        return Err(ValidationFailure::Malformed(
            "body must be a JSON object".to_owned(),
        ));
    };

    let parameters = match object.remove("parameters") {
        None | Some(Value::Null) => Parameters::new(),
        Some(Value::Object(map)) => parameters_from_map(map),
        Some(_) => {
            return Err(ValidationFailure::InvalidParameters {
                path: "parameters".to_owned(),
                reason: "must be an object".to_owned(),
            });
        }
    };

    let options = match object.remove("options") {
        None | Some(Value::Null) => ExecutionOptions::default(),
        Some(raw) => serde_json::from_value(raw)
            .map_err(|e| ValidationFailure::Malformed(format!("invalid options: {e}")))?,
    };

    Ok((parameters, options))
}
