//! Redaction of parameters before they reach logs or error payloads.

use super::value::{ParamValue, Parameters, parameters_to_json};

const REDACTED: &str = "[REDACTED]";
const TRUNCATED_MARKER: &str = "…[truncated]";
const MAX_LOGGED_CHARS: usize = 256;
const SENSITIVE_KEY_FRAGMENTS: [&str; 6] =
    ["password", "token", "secret", "key", "credential", "auth"];

/// Returns a copy of `parameters` safe to log.
///
/// Values under sensitive keys are replaced wholesale, long strings are
/// truncated. Applying it twice yields the same result as applying it once.
pub fn sanitize_for_logging(parameters: &Parameters) -> Parameters {
    parameters
        .iter()
        .map(|(key, value)| (key.clone(), sanitize_entry(key, value)))
        .collect()
}

/// Sanitized parameters rendered as compact JSON.
pub fn loggable(parameters: &Parameters) -> String {
    parameters_to_json(&sanitize_for_logging(parameters)).to_string()
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}

fn sanitize_entry(key: &str, value: &ParamValue) -> ParamValue {
    if is_sensitive_key(key) {
        ParamValue::String(REDACTED.to_owned())
    } else {
        sanitize_value(value)
    }
}

fn sanitize_value(value: &ParamValue) -> ParamValue {
    match value {
        ParamValue::String(s) => ParamValue::String(truncate(s)),
        ParamValue::List(items) => ParamValue::List(items.iter().map(sanitize_value).collect()),
        ParamValue::Map(map) => ParamValue::Map(
            map.iter()
                .map(|(key, value)| (key.clone(), sanitize_entry(key, value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_LOGGED_CHARS {
        return s.to_owned();
    }
    // Already-truncated strings keep their prefix.
    if s.ends_with(TRUNCATED_MARKER)
        && s.chars().count() == MAX_LOGGED_CHARS + TRUNCATED_MARKER.chars().count()
    {
        return s.to_owned();
    }
    let mut out: String = s.chars().take(MAX_LOGGED_CHARS).collect();
    out.push_str(TRUNCATED_MARKER);
    out
}
