//! Tool execution gateway.
//!
//! A request flows through [`validation`] (raw body screening), the
//! [`registry`] (schema checks), the [`executor`] (timeouts, cancellation,
//! bounded concurrency) under [`monitoring`], and comes back as one of the
//! envelopes in [`types`] or a [`error::ToolExecutionError`].
//!
//! The HTTP surface in [`api`] only exists in development mode.

pub mod api;
pub mod controller;
pub mod error;
pub mod executor;
pub mod monitoring;
pub mod redact;
pub mod registry;
pub mod types;
pub mod validation;
pub mod value;

pub use controller::{PreparedExecution, StreamEvent, ToolGateway};
pub use error::{ErrorCategory, ErrorCode, ToolExecutionError};
pub use executor::{
    BackendError, BackendOutput, CallContext, CallerContext, ExecutorConfig, ToolBackend,
    ToolExecutor, backend_fn,
};
pub use monitoring::{ExecutionMonitor, NoopMonitor, PerformanceMonitor, monitor};
pub use redact::sanitize_for_logging;
pub use registry::{RegistryError, ToolRegistry};
pub use types::{ExecutionOptions, ParameterKind, ParameterSpec, ToolDefinition, ToolSchema};
pub use validation::{SecurityValidator, ValidationLimits};
pub use value::{ParamValue, Parameters};
