//! Request orchestration: screen, check, authorize, execute, respond.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::error::{ErrorCode, ToolExecutionError};
use super::executor::{CallerContext, ChunkForwarder, ExecutorConfig, JobInfo, ToolExecutor};
use super::monitoring::{self, ExecutionMonitor, PerformanceMetrics};
use super::registry::ToolRegistry;
use super::types::{
    ErrorEnvelope, ExecutionRequest, ExecutionResult, SuccessEnvelope, ToolList, ToolSchema,
};
use super::validation::{SecurityValidator, ValidationLimits, validate_tool_name};
use crate::config::AppConfig;
use crate::security::claims::CallerIdentity;

/// Chunks held for a stream consumer before the job is cancelled.
pub const STREAM_BUFFER: usize = 256;

/// A request that passed screening, schema checks and authorization.
#[derive(Debug, Clone)]
pub struct PreparedExecution {
    pub request_id: String,
    pub request: ExecutionRequest,
    pub identity: CallerIdentity,
    started: Instant,
}

impl PreparedExecution {
    pub fn is_streaming(&self) -> bool {
        self.request.options.streaming
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Event delivered to a streaming caller.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(Value),
    Result(Box<SuccessEnvelope>),
    Error(ErrorEnvelope),
}

pub struct ToolGateway {
    registry: Arc<ToolRegistry>,
    validator: SecurityValidator,
    executor: Arc<ToolExecutor>,
    monitor: Arc<dyn ExecutionMonitor>,
}

impl fmt::Debug for ToolGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolGateway")
            .field("registry", &self.registry)
            .field("executor", &self.executor)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl ToolGateway {
    pub fn new(
        registry: Arc<ToolRegistry>,
        validator: SecurityValidator,
        monitor: Arc<dyn ExecutionMonitor>,
        executor_config: ExecutorConfig,
    ) -> Self {
        let executor = Arc::new(ToolExecutor::new(
            Arc::clone(&registry),
            Arc::clone(&monitor),
            executor_config,
        ));
        Self {
            registry,
            validator,
            executor,
            monitor,
        }
    }

    /// Builds the gateway and its monitor from configuration.
    ///
    /// Must be called inside a Tokio runtime when monitoring is enabled.
    pub fn from_config(registry: ToolRegistry, config: &AppConfig) -> Self {
        let validator = SecurityValidator::new(ValidationLimits {
            max_request_bytes: config.gateway.max_request_bytes,
            ..ValidationLimits::default()
        });
        Self::new(
            Arc::new(registry),
            validator,
            monitoring::from_config(&config.monitoring),
            ExecutorConfig::from(&config.gateway),
        )
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    pub fn list_tools(&self) -> ToolList {
        let tools = self.registry.get_available_tools();
        ToolList {
            count: tools.len(),
            tools,
        }
    }

    pub fn get_schema(&self, name: &str) -> Result<ToolSchema, ToolExecutionError> {
        validate_tool_name(name)?;
        self.registry.get_tool_schema(name)
    }

    pub fn metrics(&self) -> Option<PerformanceMetrics> {
        self.monitor.snapshot()
    }

    pub fn active_jobs(&self) -> Vec<JobInfo> {
        self.executor.active_jobs()
    }

    pub fn cancel_job(&self, job_id: &str) -> bool {
        self.executor.cancel_job(job_id)
    }

    /// Screens the raw body, checks it against the tool schema and the
    /// caller's roles. Nothing is recorded when this fails.
    pub fn prepare(
        &self,
        tool_name: &str,
        body: &[u8],
        identity: &CallerIdentity,
    ) -> Result<PreparedExecution, ToolExecutionError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let request = self.validator.validate_request(tool_name, body).map_err(|failure| {
            ToolExecutionError::from(failure).with_request_id(request_id.clone())
        })?;

        self.registry
            .validate_tool_call(tool_name, &request.parameters)
            .map_err(|err| {
                err.with_parameters(&request.parameters)
                    .with_request_id(request_id.clone())
            })?;

        let required_role = self
            .registry
            .definition(tool_name)
            .and_then(|definition| definition.required_role.as_deref());
        if let Some(role) = required_role {
            if !identity.has_role(role) {
                return Err(ToolExecutionError::new(
                    ErrorCode::InsufficientPermissions,
                    format!("Tool '{tool_name}' requires role '{role}'"),
                )
                .with_tool(tool_name)
                .with_request_id(request_id));
            }
        }

        Ok(PreparedExecution {
            request_id,
            request,
            identity: identity.clone(),
            started,
        })
    }

    /// Validates and runs a request, returning the buffered envelope.
    #[instrument(name = "gateway.execute", skip_all, fields(tool = %tool_name, user = %identity.user_id))]
    pub async fn execute(
        &self,
        tool_name: &str,
        body: &[u8],
        identity: &CallerIdentity,
    ) -> Result<SuccessEnvelope, ToolExecutionError> {
        let prepared = self.prepare(tool_name, body, identity)?;
        self.execute_prepared(prepared).await
    }

    /// Runs a prepared request to completion.
    ///
    /// Dropping the returned future cancels the job.
    pub async fn execute_prepared(
        &self,
        prepared: PreparedExecution,
    ) -> Result<SuccessEnvelope, ToolExecutionError> {
        let token = CancellationToken::new();
        let _abandon = token.clone().drop_guard();

        let handle = self.spawn(&prepared, token, None);
        let result = join(handle)
            .await
            .map_err(|err| finish_error(err, &prepared))?;

        info!(
            name: "gateway.request.completed",
            request_id = %prepared.request_id,
            tool = %result.tool_name,
            job_id = %result.job_id,
            "Tool request completed"
        );
        let duration_ms = prepared.elapsed_ms();
        Ok(SuccessEnvelope::new(result, prepared.request_id, duration_ms))
    }

    /// Runs a prepared request, delivering chunks as they are emitted and
    /// then exactly one terminal event.
    ///
    /// Dropping the receiver cancels the job, and so does a consumer that
    /// falls more than [`STREAM_BUFFER`] chunks behind.
    pub fn stream_prepared(&self, prepared: PreparedExecution) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let chunk_tx = tx.clone();
        let request_id = prepared.request_id.clone();
        let forward: ChunkForwarder = Arc::new(move |chunk: Value| {
            match chunk_tx.try_send(StreamEvent::Chunk(chunk)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        name: "gateway.stream.overflow",
                        request_id = %request_id,
                        capacity = STREAM_BUFFER,
                        "Stream consumer fell behind, cancelling job"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });

        let token = CancellationToken::new();
        let handle = self.spawn(&prepared, token.clone(), Some(forward));

        tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = join(handle) => outcome,
                () = tx.closed() => {
                    token.cancel();
                    return;
                }
            };
            let event = match outcome {
                Ok(result) => {
                    let duration_ms = prepared.elapsed_ms();
                    StreamEvent::Result(Box::new(SuccessEnvelope::new(
                        result,
                        prepared.request_id.clone(),
                        duration_ms,
                    )))
                }
                Err(err) => {
                    let err = finish_error(err, &prepared);
                    err.log();
                    StreamEvent::Error(err.to_envelope())
                }
            };
            // A receiver that went away after the last chunk needs no result.
            let _ = tx.send(event).await;
        });

        rx
    }

    fn spawn(
        &self,
        prepared: &PreparedExecution,
        token: CancellationToken,
        stream: Option<ChunkForwarder>,
    ) -> JoinHandle<Result<ExecutionResult, ToolExecutionError>> {
        let executor = Arc::clone(&self.executor);
        let ExecutionRequest {
            tool_name,
            parameters,
            options,
        } = prepared.request.clone();

        let mut caller = CallerContext::new(prepared.request_id.clone())
            .with_user(prepared.identity.user_id.clone())
            .with_workspace(prepared.identity.workspace.clone())
            .with_cancellation(token);
        if let Some(forward) = stream {
            caller = caller.with_stream(forward);
        }

        tokio::spawn(async move {
            executor
                .execute_tool_with_options(&tool_name, parameters, caller, options)
                .await
        })
    }
}

async fn join(
    handle: JoinHandle<Result<ExecutionResult, ToolExecutionError>>,
) -> Result<ExecutionResult, ToolExecutionError> {
    match handle.await {
        Ok(result) => result,
        Err(err) => Err(task_failure(err)),
    }
}

fn finish_error(err: ToolExecutionError, prepared: &PreparedExecution) -> ToolExecutionError {
    let err = if err.tool_name().is_none() {
        err.with_tool(prepared.request.tool_name.clone())
            .with_parameters(&prepared.request.parameters)
    } else {
        err
    };
    err.with_request_id(prepared.request_id.clone())
        .with_duration(prepared.started.elapsed())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Converts a failed execution task into a system error.
fn task_failure(err: JoinError) -> ToolExecutionError {
    let trace = if err.is_panic() {
        format!("panic: {}", panic_message(err.into_panic().as_ref()))
    } else {
        "execution task was aborted".to_string()
    };
    ToolExecutionError::internal("Tool execution task failed").with_trace(trace)
}
