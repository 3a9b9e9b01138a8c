//! Error taxonomy shared by every gateway component.
//!
//! Each failure is a [`ToolExecutionError`] carrying one [`ErrorCode`]. The
//! code fixes both the category and the HTTP status, so the response mapper
//! never has to guess.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::redact::sanitize_for_logging;
use super::types::{ErrorBody, ErrorEnvelope};
use super::value::{Parameters, parameters_to_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    InvalidToolName,
    InvalidParameters,
    MaliciousInput,
    ParameterTooLarge,
    MalformedRequest,
    ToolNotFound,
    AuthenticationRequired,
    InvalidCredentials,
    InsufficientPermissions,
    ExecutionFailed,
    ExecutionCancelled,
    ExecutionTimeout,
    RateLimitExceeded,
    ConcurrencyLimitExceeded,
    ResourceExhausted,
    ServiceUnavailable,
    InternalError,
    ConfigurationError,
    DependencyFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Authentication,
    Execution,
    RateLimit,
    System,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InvalidToolName => "INVALID_TOOL_NAME",
            Self::InvalidParameters => "INVALID_PARAMETERS",
            Self::MaliciousInput => "MALICIOUS_INPUT",
            Self::ParameterTooLarge => "PARAMETER_TOO_LARGE",
            Self::MalformedRequest => "MALFORMED_REQUEST",
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::ExecutionCancelled => "EXECUTION_CANCELLED",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::ConcurrencyLimitExceeded => "CONCURRENCY_LIMIT_EXCEEDED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::DependencyFailure => "DEPENDENCY_FAILURE",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            Self::ValidationError
            | Self::InvalidToolName
            | Self::InvalidParameters
            | Self::MaliciousInput
            | Self::ParameterTooLarge
            | Self::MalformedRequest
            | Self::ToolNotFound => ErrorCategory::Validation,
            Self::AuthenticationRequired
            | Self::InvalidCredentials
            | Self::InsufficientPermissions => ErrorCategory::Authentication,
            Self::ExecutionFailed | Self::ExecutionCancelled | Self::ExecutionTimeout => {
                ErrorCategory::Execution
            }
            Self::RateLimitExceeded | Self::ConcurrencyLimitExceeded | Self::ResourceExhausted => {
                ErrorCategory::RateLimit
            }
            Self::ServiceUnavailable
            | Self::InternalError
            | Self::ConfigurationError
            | Self::DependencyFailure => ErrorCategory::System,
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            Self::ValidationError
            | Self::InvalidToolName
            | Self::InvalidParameters
            | Self::MaliciousInput
            | Self::ParameterTooLarge
            | Self::MalformedRequest
            | Self::ExecutionCancelled => StatusCode::BAD_REQUEST,
            Self::ToolNotFound => StatusCode::NOT_FOUND,
            Self::AuthenticationRequired | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::InsufficientPermissions => StatusCode::FORBIDDEN,
            Self::ExecutionTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::RateLimitExceeded | Self::ConcurrencyLimitExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::ResourceExhausted | Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExecutionFailed
            | Self::InternalError
            | Self::ConfigurationError
            | Self::DependencyFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn generic_message(self) -> &'static str {
        match self {
            Self::ServiceUnavailable => "Service temporarily unavailable",
            Self::ConfigurationError => "Gateway is misconfigured",
            Self::DependencyFailure => "A required dependency failed",
            _ => "Internal server error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// A taxonomized gateway failure.
///
/// Built by value: every `with_*` call consumes the error and returns the
/// enriched copy.
#[derive(Debug, Clone)]
pub struct ToolExecutionError {
    code: ErrorCode,
    message: String,
    details: Option<Value>,
    tool_name: Option<String>,
    parameters: Option<Parameters>,
    request_id: Option<String>,
    timestamp: DateTime<Utc>,
    duration: Option<Duration>,
    trace: Option<String>,
    source: Option<Cause>,
}

impl ToolExecutionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            tool_name: None,
            parameters: None,
            request_id: None,
            timestamp: Utc::now(),
            duration: None,
            trace: None,
            source: None,
        }
    }

    pub fn tool_not_found(name: &str) -> Self {
        Self::new(ErrorCode::ToolNotFound, format!("Tool '{name}' not found"))
            .with_tool(name)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn timeout(timeout: Duration, phase: &str) -> Self {
        Self::new(
            ErrorCode::ExecutionTimeout,
            format!("Execution exceeded {}ms", timeout.as_millis()),
        )
        .with_details(json!({
            "timeoutMs": u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "phase": phase,
        }))
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::ExecutionCancelled, "Execution was cancelled")
    }

    #[must_use]
    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// Attaches a redacted snapshot of the call parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: &Parameters) -> Self {
        self.parameters = Some(sanitize_for_logging(parameters));
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    #[must_use]
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.tool_name.as_deref()
    }

    /// The redacted parameter snapshot, if one was attached.
    pub fn parameters(&self) -> Option<&Parameters> {
        self.parameters.as_ref()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    /// Message safe to show callers. System failures are replaced by a
    /// generic text.
    pub fn public_message(&self) -> &str {
        if self.category() == ErrorCategory::System {
            self.code.generic_message()
        } else {
            &self.message
        }
    }

    fn public_details(&self) -> Option<Value> {
        if self.category() == ErrorCategory::System {
            None
        } else {
            self.details.clone()
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                code: self.code.as_str().to_owned(),
                message: self.public_message().to_owned(),
                details: self.public_details(),
            },
            request_id: self.request_id.clone().unwrap_or_default(),
            timestamp: self.timestamp,
        }
    }

    /// Emits the operator-facing log line for this error.
    pub fn log(&self) {
        let parameters = self.parameters.as_ref().map(parameters_to_json);
        let duration_ms = self.duration.map(|d| d.as_millis());
        if self.category() == ErrorCategory::System {
            tracing::error!(
                name: "gateway.error.system",
                code = %self.code,
                message = %self.message,
                tool = ?self.tool_name,
                request_id = ?self.request_id,
                duration_ms = ?duration_ms,
                parameters = ?parameters,
                trace = ?self.trace,
                source = ?self.source.as_ref().map(ToString::to_string),
                "System error"
            );
        } else {
            tracing::debug!(
                name: "gateway.error",
                code = %self.code,
                message = %self.message,
                tool = ?self.tool_name,
                request_id = ?self.request_id,
                duration_ms = ?duration_ms,
                "Request failed"
            );
        }
    }
}

impl fmt::Display for ToolExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl StdError for ToolExecutionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl IntoResponse for ToolExecutionError {
    fn into_response(self) -> Response {
        self.log();
        (self.status(), Json(self.to_envelope())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::value::ParamValue;

    #[test]
    fn status_follows_code() {
        assert_eq!(ErrorCode::ToolNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::ExecutionTimeout.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(ErrorCode::ExecutionCancelled.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::ConcurrencyLimitExceeded.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(ErrorCode::ServiceUnavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::ConfigurationError.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ErrorCode::InsufficientPermissions.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn code_serializes_screaming_snake() {
        let encoded = serde_json::to_value(ErrorCode::MaliciousInput).unwrap();
        assert_eq!(encoded, json!("MALICIOUS_INPUT"));
        assert_eq!(ErrorCode::MaliciousInput.as_str(), "MALICIOUS_INPUT");
    }

    #[test]
    fn builder_enriches_by_value() {
        let mut params = Parameters::new();
        params.insert("api_key".into(), ParamValue::from("abc123"));

        let err = ToolExecutionError::validation("bad input")
            .with_tool("update-logbook")
            .with_parameters(&params)
            .with_request_id("req-1")
            .with_duration(Duration::from_millis(12));

        assert_eq!(err.tool_name(), Some("update-logbook"));
        assert_eq!(err.request_id(), Some("req-1"));
        assert_eq!(err.duration(), Some(Duration::from_millis(12)));
        assert_eq!(
            err.parameters().unwrap()["api_key"],
            ParamValue::from("[REDACTED]")
        );
    }

    #[test]
    fn system_errors_hide_internal_message() {
        let err = ToolExecutionError::internal("backend panicked: index out of bounds")
            .with_trace("thread panicked at src/tools.rs:10");
        let envelope = err.to_envelope();
        assert_eq!(envelope.error.code, "INTERNAL_ERROR");
        assert_eq!(envelope.error.message, "Internal server error");
        assert!(envelope.error.details.is_none());
    }

    #[test]
    fn timeout_carries_phase_details() {
        let err = ToolExecutionError::timeout(Duration::from_secs(1), "running");
        let details = err.details().unwrap();
        assert_eq!(details["timeoutMs"], 1000);
        assert_eq!(details["phase"], "running");
    }

    #[test]
    fn source_is_exposed() {
        let io = std::io::Error::other("disk gone");
        let err = ToolExecutionError::internal("write failed").with_source(io);
        assert_eq!(err.source().unwrap().to_string(), "disk gone");
    }
}
