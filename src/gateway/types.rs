//! Tool definitions, schemas and the wire envelopes returned to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::value::{ParamValue, Parameters};

/// Declared type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    /// Accepts any non-null value.
    Any,
}

impl ParameterKind {
    /// Whether `value` satisfies this kind. Integers must have no
    /// fractional part.
    pub fn accepts(self, value: &ParamValue) -> bool {
        match (self, value) {
            (_, ParamValue::Null) => false,
            (Self::Any, _) => true,
            (Self::String, ParamValue::String(_)) => true,
            (Self::Integer, v @ ParamValue::Number(_)) => v.is_integer(),
            (Self::Number, ParamValue::Number(_)) => true,
            (Self::Boolean, ParamValue::Bool(_)) => true,
            (Self::Array, ParamValue::List(_)) => true,
            (Self::Object, ParamValue::Map(_)) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        }
    }
}

/// A single declared parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParameterKind,
    pub required: bool,
    pub description: String,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>, kind: ParameterKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: description.into(),
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParameterKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            description: description.into(),
        }
    }
}

/// Example request/response pair shown in a tool's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExample {
    pub request: Value,
    pub response: Value,
}

/// Static description of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<ToolExample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            examples: Vec::new(),
            required_role: None,
        }
    }

    #[must_use]
    pub fn param(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    #[must_use]
    pub fn example(mut self, request: Value, response: Value) -> Self {
        self.examples.push(ToolExample { request, response });
        self
    }

    /// Restricts the tool to callers holding `role`.
    #[must_use]
    pub fn requires_role(mut self, role: impl Into<String>) -> Self {
        self.required_role = Some(role.into());
        self
    }
}

/// Caller-facing schema derived from a [`ToolDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON-Schema object describing the parameters.
    pub parameters: Value,
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub examples: Vec<ToolExample>,
}

impl ToolSchema {
    pub fn from_definition(definition: &ToolDefinition) -> Self {
        let mut properties = Map::new();
        let mut required = Vec::new();
        let mut optional = Vec::new();

        for spec in &definition.parameters {
            let mut property = Map::new();
            if spec.kind != ParameterKind::Any {
                property.insert("type".into(), Value::from(spec.kind.as_str()));
            }
            property.insert("description".into(), Value::from(spec.description.clone()));
            properties.insert(spec.name.clone(), Value::Object(property));

            if spec.required {
                required.push(spec.name.clone());
            } else {
                optional.push(spec.name.clone());
            }
        }

        Self {
            name: definition.name.clone(),
            description: definition.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
            required,
            optional,
            examples: definition.examples.clone(),
        }
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionOptions {
    /// Timeout in seconds. Absent or non-positive selects the default.
    pub timeout: Option<f64>,
    pub streaming: bool,
    pub buffered: bool,
}

/// A validated request to run one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub tool_name: String,
    pub parameters: Parameters,
    pub options: ExecutionOptions,
}

/// Outcome of a single successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub tool_name: String,
    pub job_id: String,
    pub success: bool,
    pub data: Value,
    /// Chunks emitted by the backend in buffered mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<Value>,
    pub response_size_bytes: usize,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// `{status:"success", result, metadata}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessEnvelope {
    pub status: String,
    pub result: ExecutionResult,
    pub metadata: ResponseMetadata,
}

impl SuccessEnvelope {
    pub fn new(result: ExecutionResult, request_id: String, duration_ms: u64) -> Self {
        Self {
            status: "success".to_owned(),
            result,
            metadata: ResponseMetadata {
                request_id,
                timestamp: Utc::now(),
                duration_ms,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

/// `{error:{code, message, details}, requestId, timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolList {
    pub tools: Vec<ToolDefinition>,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity_tool() -> ToolDefinition {
        ToolDefinition::new("get-activity-details", "Fetch one activity")
            .param(ParameterSpec::required(
                "activity_id",
                ParameterKind::Integer,
                "Activity identifier",
            ))
            .param(ParameterSpec::optional(
                "include_laps",
                ParameterKind::Boolean,
                "Include lap splits",
            ))
    }

    #[test]
    fn schema_splits_required_and_optional() {
        let schema = ToolSchema::from_definition(&activity_tool());
        assert_eq!(schema.name, "get-activity-details");
        assert_eq!(schema.required, vec!["activity_id"]);
        assert_eq!(schema.optional, vec!["include_laps"]);
        assert_eq!(schema.parameters["properties"]["activity_id"]["type"], "integer");
        assert_eq!(schema.parameters["required"], json!(["activity_id"]));
    }

    #[test]
    fn kinds_reject_null_and_fractional_integers() {
        assert!(!ParameterKind::Any.accepts(&ParamValue::Null));
        assert!(ParameterKind::Integer.accepts(&ParamValue::from(json!(12))));
        assert!(!ParameterKind::Integer.accepts(&ParamValue::from(json!(12.5))));
        assert!(ParameterKind::Number.accepts(&ParamValue::from(json!(12.5))));
        assert!(!ParameterKind::String.accepts(&ParamValue::from(true)));
    }

    #[test]
    fn options_default_when_fields_missing() {
        let options: ExecutionOptions = serde_json::from_value(json!({"streaming": true})).unwrap();
        assert!(options.streaming);
        assert!(!options.buffered);
        assert_eq!(options.timeout, None);
    }
}
