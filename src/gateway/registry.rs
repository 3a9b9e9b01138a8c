//! Registry of tool definitions and their execution backends.
//!
//! Tools are registered once through [`ToolRegistryBuilder`]; afterwards the
//! registry is immutable and shared behind an `Arc`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;

use super::error::{ErrorCode, ToolExecutionError};
use super::executor::ToolBackend;
use super::types::{ToolDefinition, ToolSchema};
use super::validation::{check_identifier, validate_tool_name};
use super::value::Parameters;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
    #[error("invalid definition for tool '{tool}': {reason}")]
    InvalidDefinition { tool: String, reason: String },
}

impl From<RegistryError> for ToolExecutionError {
    fn from(err: RegistryError) -> Self {
        ToolExecutionError::new(ErrorCode::ConfigurationError, err.to_string()).with_source(err)
    }
}

struct RegisteredTool {
    definition: ToolDefinition,
    schema: ToolSchema,
    backend: Arc<dyn ToolBackend>,
}

/// Immutable catalogue of tools.
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field(
                "tools",
                &self
                    .tools
                    .iter()
                    .map(|t| t.definition.name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl fmt::Debug for ToolRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistryBuilder")
            .field("tool_count", &self.tools.len())
            .finish()
    }
}

impl ToolRegistryBuilder {
    /// Adds a tool. Fails on duplicate names or malformed definitions.
    pub fn register(
        mut self,
        definition: ToolDefinition,
        backend: Arc<dyn ToolBackend>,
    ) -> Result<Self, RegistryError> {
        check_definition(&definition)?;
        if self.index.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateTool(definition.name));
        }

        let schema = ToolSchema::from_definition(&definition);
        self.index.insert(definition.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            definition,
            schema,
            backend,
        });
        Ok(self)
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry {
            tools: self.tools,
            index: self.index,
        }
    }
}

fn check_definition(definition: &ToolDefinition) -> Result<(), RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidDefinition {
        tool: definition.name.clone(),
        reason,
    };

    validate_tool_name(&definition.name).map_err(|failure| invalid(failure.to_string()))?;

    let mut seen = HashSet::new();
    for spec in &definition.parameters {
        check_identifier(&spec.name)
            .map_err(|reason| invalid(format!("parameter '{}' {reason}", spec.name)))?;
        if !seen.insert(spec.name.as_str()) {
            return Err(invalid(format!("parameter '{}' declared twice", spec.name)));
        }
    }
    Ok(())
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    /// All definitions in registration order.
    pub fn get_available_tools(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    pub fn get_tool_schema(&self, name: &str) -> Result<ToolSchema, ToolExecutionError> {
        self.entry(name)
            .map(|t| t.schema.clone())
            .ok_or_else(|| ToolExecutionError::tool_not_found(name))
    }

    pub fn is_tool_available(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.entry(name).map(|t| &t.definition)
    }

    pub fn backend(&self, name: &str) -> Option<Arc<dyn ToolBackend>> {
        self.entry(name).map(|t| Arc::clone(&t.backend))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Checks `params` against the declared parameters of `name`.
    ///
    /// Reports the first problem in declaration order. Null counts as
    /// absent; undeclared parameters are ignored.
    pub fn validate_tool_call(
        &self,
        name: &str,
        params: &Parameters,
    ) -> Result<(), ToolExecutionError> {
        let tool = self
            .entry(name)
            .ok_or_else(|| ToolExecutionError::tool_not_found(name))?;

        for spec in &tool.definition.parameters {
            match params.get(&spec.name).filter(|v| !v.is_null()) {
                None if spec.required => {
                    return Err(ToolExecutionError::validation(format!(
                        "Missing required parameter '{}'",
                        spec.name
                    ))
                    .with_tool(name)
                    .with_details(json!({
                        "parameter": spec.name,
                        "reason": "missing_required",
                    })));
                }
                None => {}
                Some(value) if !spec.kind.accepts(value) => {
                    return Err(ToolExecutionError::validation(format!(
                        "Parameter '{}' must be of type {}",
                        spec.name,
                        spec.kind.as_str()
                    ))
                    .with_tool(name)
                    .with_details(json!({
                        "parameter": spec.name,
                        "reason": "type_mismatch",
                        "expected": spec.kind.as_str(),
                        "actual": value.kind().as_str(),
                    })));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn entry(&self, name: &str) -> Option<&RegisteredTool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::executor::{BackendError, BackendOutput, CallContext, backend_fn};
    use crate::gateway::types::{ParameterKind, ParameterSpec};
    use serde_json::Value;

    fn noop() -> Arc<dyn ToolBackend> {
        backend_fn(|_ctx: CallContext, _params: Parameters| async {
            Ok::<_, BackendError>(BackendOutput::new(Value::Null))
        })
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::builder()
            .register(
                ToolDefinition::new("get-athlete-profile", "Profile of the current athlete"),
                noop(),
            )
            .unwrap()
            .register(
                ToolDefinition::new("get-activity-details", "One activity")
                    .param(ParameterSpec::required(
                        "activity_id",
                        ParameterKind::Integer,
                        "Activity id",
                    ))
                    .param(ParameterSpec::optional(
                        "include_laps",
                        ParameterKind::Boolean,
                        "Include laps",
                    )),
                noop(),
            )
            .unwrap()
            .build()
    }

    fn params(value: Value) -> Parameters {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn lists_in_registration_order() {
        let names: Vec<_> = registry()
            .get_available_tools()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["get-athlete-profile", "get-activity-details"]);
    }

    #[test]
    fn schema_lookup() {
        let registry = registry();
        let schema = registry.get_tool_schema("get-activity-details").unwrap();
        assert_eq!(schema.required, vec!["activity_id"]);
        let err = registry.get_tool_schema("nope").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ToolNotFound);
        assert!(!registry.is_tool_available("nope"));
    }

    #[test]
    fn rejects_duplicates_and_bad_names() {
        let dup = ToolRegistry::builder()
            .register(ToolDefinition::new("a", ""), noop())
            .unwrap()
            .register(ToolDefinition::new("a", ""), noop());
        assert!(matches!(dup, Err(RegistryError::DuplicateTool(_))));

        let bad = ToolRegistry::builder().register(ToolDefinition::new("../x", ""), noop());
        assert!(matches!(bad, Err(RegistryError::InvalidDefinition { .. })));

        let twice = ToolRegistry::builder().register(
            ToolDefinition::new("b", "")
                .param(ParameterSpec::optional("x", ParameterKind::Any, ""))
                .param(ParameterSpec::optional("x", ParameterKind::Any, "")),
            noop(),
        );
        assert!(matches!(twice, Err(RegistryError::InvalidDefinition { .. })));

        let err: ToolExecutionError = RegistryError::DuplicateTool("a".into()).into();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn validate_reports_missing_required() {
        let err = registry()
            .validate_tool_call("get-activity-details", &params(serde_json::json!({})))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(err.details().unwrap()["parameter"], "activity_id");
        assert_eq!(err.details().unwrap()["reason"], "missing_required");
    }

    #[test]
    fn validate_treats_null_as_absent() {
        let registry = registry();
        let err = registry
            .validate_tool_call(
                "get-activity-details",
                &params(serde_json::json!({"activity_id": null})),
            )
            .unwrap_err();
        assert_eq!(err.details().unwrap()["reason"], "missing_required");

        registry
            .validate_tool_call(
                "get-activity-details",
                &params(serde_json::json!({"activity_id": 7, "include_laps": null})),
            )
            .unwrap();
    }

    #[test]
    fn validate_reports_type_mismatch() {
        let err = registry()
            .validate_tool_call(
                "get-activity-details",
                &params(serde_json::json!({"activity_id": 1.5})),
            )
            .unwrap_err();
        let details = err.details().unwrap();
        assert_eq!(details["reason"], "type_mismatch");
        assert_eq!(details["expected"], "integer");
        assert_eq!(details["actual"], "number");
    }

    #[test]
    fn validate_ignores_unknown_parameters() {
        registry()
            .validate_tool_call(
                "get-athlete-profile",
                &params(serde_json::json!({"extra": "ignored"})),
            )
            .unwrap();
    }
}
