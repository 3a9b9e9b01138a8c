//! Tool dispatch under deadline, cancellation and parallelism control.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{ErrorCode, ToolExecutionError};
use super::monitoring::{self, ExecutionMonitor};
use super::registry::ToolRegistry;
use super::types::{ExecutionOptions, ExecutionResult};
use super::value::Parameters;
use crate::config::GatewayConfig;

/// Receives streamed chunks. Returning `false` means the consumer is gone.
pub type ChunkForwarder = Arc<dyn Fn(Value) -> bool + Send + Sync>;

/// Who is calling and how they want output delivered.
#[derive(Clone, Default)]
pub struct CallerContext {
    pub request_id: String,
    pub user_id: Option<String>,
    pub workspace: Option<String>,
    /// Parent token; cancelling it cancels the job.
    pub cancellation: Option<CancellationToken>,
    /// Stream consumer, used when the request asks for streaming.
    pub stream: Option<ChunkForwarder>,
}

impl fmt::Debug for CallerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerContext")
            .field("request_id", &self.request_id)
            .field("user_id", &self.user_id)
            .field("workspace", &self.workspace)
            .field("streaming", &self.stream.is_some())
            .finish()
    }
}

impl CallerContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_workspace(mut self, workspace: Option<String>) -> Self {
        self.workspace = workspace;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    #[must_use]
    pub fn with_stream(mut self, forwarder: ChunkForwarder) -> Self {
        self.stream = Some(forwarder);
        self
    }
}

/// Where a job is when its deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPhase {
    Queued,
    Running,
    Streaming,
}

impl ExecutionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Streaming => "streaming",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Queued,
            1 => Self::Running,
            _ => Self::Streaming,
        }
    }
}

#[derive(Debug, Clone)]
struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    fn new(phase: ExecutionPhase) -> Self {
        Self(Arc::new(AtomicU8::new(phase as u8)))
    }

    fn set(&self, phase: ExecutionPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    fn get(&self) -> ExecutionPhase {
        ExecutionPhase::from_u8(self.0.load(Ordering::Acquire))
    }
}

#[derive(Clone)]
enum OutputSink {
    Buffered(Arc<Mutex<Vec<Value>>>),
    Streaming(ChunkForwarder),
}

/// Per-call context handed to a [`ToolBackend`].
#[derive(Clone)]
pub struct CallContext {
    request_id: String,
    job_id: String,
    user_id: Option<String>,
    workspace: Option<String>,
    deadline: Instant,
    cancellation: CancellationToken,
    sink: OutputSink,
    phase: PhaseCell,
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("request_id", &self.request_id)
            .field("job_id", &self.job_id)
            .field("user_id", &self.user_id)
            .field("workspace", &self.workspace)
            .field("streaming", &self.is_streaming())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CallContext {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn workspace(&self) -> Option<&str> {
        self.workspace.as_deref()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the job is cancelled or timed out.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.sink, OutputSink::Streaming(_))
    }

    /// Emits one output chunk.
    ///
    /// Streaming chunks go straight to the consumer; buffered chunks end up
    /// in [`ExecutionResult::output`]. Returns `false` once the stream
    /// consumer has gone away, which also cancels the job.
    pub fn emit(&self, chunk: Value) -> bool {
        match &self.sink {
            OutputSink::Buffered(buffer) => {
                lock(buffer).push(chunk);
                true
            }
            OutputSink::Streaming(forward) => {
                self.phase.set(ExecutionPhase::Streaming);
                if forward(chunk) {
                    true
                } else {
                    self.cancellation.cancel();
                    false
                }
            }
        }
    }
}

/// Successful backend output.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutput {
    pub data: Value,
    pub response_size_bytes: usize,
}

impl BackendOutput {
    /// Wraps `data`, measuring its serialized size.
    pub fn new(data: Value) -> Self {
        let response_size_bytes = data.to_string().len();
        Self {
            data,
            response_size_bytes,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("{0}")]
    Failed(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("execution cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Failed(_) => ErrorCode::ExecutionFailed,
            Self::Unavailable(_) => ErrorCode::ServiceUnavailable,
            Self::InvalidInput(_) => ErrorCode::ValidationError,
            Self::RateLimited(_) => ErrorCode::RateLimitExceeded,
            Self::Cancelled => ErrorCode::ExecutionCancelled,
        }
    }
}

impl From<BackendError> for ToolExecutionError {
    fn from(err: BackendError) -> Self {
        ToolExecutionError::new(err.code(), err.to_string()).with_source(err)
    }
}

/// An execution backend for one tool.
#[async_trait]
pub trait ToolBackend: Send + Sync + fmt::Debug {
    async fn execute(
        &self,
        ctx: &CallContext,
        params: &Parameters,
    ) -> Result<BackendOutput, BackendError>;
}

/// Backend built from an async closure.
pub struct FnBackend<F>(F);

impl<F> fmt::Debug for FnBackend<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnBackend")
    }
}

#[async_trait]
impl<F, Fut> ToolBackend for FnBackend<F>
where
    F: Fn(CallContext, Parameters) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BackendOutput, BackendError>> + Send + 'static,
{
    async fn execute(
        &self,
        ctx: &CallContext,
        params: &Parameters,
    ) -> Result<BackendOutput, BackendError> {
        (self.0)(ctx.clone(), params.clone()).await
    }
}

pub fn backend_fn<F, Fut>(f: F) -> Arc<dyn ToolBackend>
where
    F: Fn(CallContext, Parameters) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BackendOutput, BackendError>> + Send + 'static,
{
    Arc::new(FnBackend(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub max_parallel: usize,
    pub max_pending: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(300),
            max_parallel: 64,
            max_pending: 256,
        }
    }
}

impl From<&GatewayConfig> for ExecutorConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(config.default_timeout_secs),
            max_timeout: Duration::from_secs(config.max_timeout_secs),
            max_parallel: config.max_parallel_executions,
            max_pending: config.max_pending_executions,
        }
    }
}

struct JobHandle {
    tool_name: String,
    started_at: DateTime<Utc>,
    cancellation: CancellationToken,
    phase: PhaseCell,
}

/// Snapshot of a running job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub job_id: String,
    pub tool_name: String,
    pub started_at: DateTime<Utc>,
    pub phase: ExecutionPhase,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a job from the table on every exit path.
struct JobGuard<'a> {
    jobs: &'a Mutex<HashMap<String, JobHandle>>,
    job_id: String,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        lock(self.jobs).remove(&self.job_id);
    }
}

/// Keeps the pending counter and queue-depth gauge balanced while waiting
/// for a slot.
struct QueueGuard<'a> {
    pending: &'a AtomicUsize,
    monitor: &'a dyn ExecutionMonitor,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.monitor.record_dequeued();
    }
}

/// Bounds `work` by the job's cancellation token and deadline.
async fn guard<T>(
    cancellation: &CancellationToken,
    deadline: Instant,
    timeout: Duration,
    phase: &PhaseCell,
    work: impl Future<Output = Result<T, ToolExecutionError>>,
) -> Result<T, ToolExecutionError> {
    tokio::select! {
        biased;
        () = cancellation.cancelled() => Err(ToolExecutionError::cancelled()),
        result = tokio::time::timeout_at(deadline, work) => match result {
            Ok(result) => result,
            Err(_elapsed) => {
                cancellation.cancel();
                Err(ToolExecutionError::timeout(timeout, phase.get().as_str()))
            }
        },
    }
}

/// Runs registered tools.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    monitor: Arc<dyn ExecutionMonitor>,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    pending: AtomicUsize,
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("config", &self.config)
            .field("active_jobs", &self.active_job_count())
            .field("pending", &self.pending.load(Ordering::Acquire))
            .finish()
    }
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        monitor: Arc<dyn ExecutionMonitor>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            monitor,
            permits: Arc::new(Semaphore::new(config.max_parallel.max(1))),
            config,
            pending: AtomicUsize::new(0),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Clamps a requested timeout in seconds.
    ///
    /// Absent, non-positive and NaN values select the default; values above
    /// the maximum are capped.
    pub fn effective_timeout(&self, requested: Option<f64>) -> Duration {
        match requested {
            Some(secs) if secs > 0.0 => {
                if secs >= self.config.max_timeout.as_secs_f64() {
                    self.config.max_timeout
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
            _ => self.config.default_timeout,
        }
    }

    pub async fn execute_tool(
        &self,
        tool_name: &str,
        params: Parameters,
        caller: CallerContext,
    ) -> Result<ExecutionResult, ToolExecutionError> {
        self.execute_tool_with_options(tool_name, params, caller, ExecutionOptions::default())
            .await
    }

    pub async fn execute_tool_with_options(
        &self,
        tool_name: &str,
        params: Parameters,
        caller: CallerContext,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, ToolExecutionError> {
        let started = Instant::now();
        let enrich = |err: ToolExecutionError| {
            err.with_tool(tool_name)
                .with_parameters(&params)
                .with_request_id(caller.request_id.clone())
                .with_duration(started.elapsed())
        };

        let Some(backend) = self.registry.backend(tool_name) else {
            return Err(enrich(ToolExecutionError::tool_not_found(tool_name)));
        };

        let timeout = self.effective_timeout(options.timeout);
        let deadline = started + timeout;
        let job_id = Uuid::new_v4().to_string();
        let cancellation = caller
            .cancellation
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let phase = PhaseCell::new(ExecutionPhase::Queued);
        let _job = self.register_job(&job_id, tool_name, &cancellation, &phase);

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = match &caller.stream {
            Some(forward) if options.streaming => OutputSink::Streaming(Arc::clone(forward)),
            _ => OutputSink::Buffered(Arc::clone(&buffer)),
        };
        let ctx = CallContext {
            request_id: caller.request_id.clone(),
            job_id: job_id.clone(),
            user_id: caller.user_id.clone(),
            workspace: caller.workspace.clone(),
            deadline,
            cancellation: cancellation.clone(),
            sink,
            phase: phase.clone(),
        };

        debug!(
            name: "gateway.execution.dispatch",
            tool = %tool_name,
            job_id = %job_id,
            request_id = %caller.request_id,
            timeout_ms = timeout.as_millis(),
            streaming = ctx.is_streaming(),
            "Dispatching tool"
        );

        let user = caller.user_id.as_deref();
        let outcome: Result<BackendOutput, ToolExecutionError> = async {
            let _permit = guard(
                &cancellation,
                deadline,
                timeout,
                &phase,
                self.acquire_slot(),
            )
            .await?;
            // Queue time counts against the deadline but is not an execution.
            monitoring::monitor(
                self.monitor.as_ref(),
                tool_name,
                &params,
                user,
                guard(&cancellation, deadline, timeout, &phase, async {
                    phase.set(ExecutionPhase::Running);
                    backend
                        .execute(&ctx, &params)
                        .await
                        .map_err(ToolExecutionError::from)
                }),
            )
            .await
        }
        .await;

        let duration = started.elapsed();
        match outcome {
            Ok(output) => {
                let chunks = std::mem::take(&mut *lock(&buffer));
                info!(
                    name: "gateway.execution.completed",
                    tool = %tool_name,
                    job_id = %job_id,
                    duration_ms = duration.as_millis(),
                    response_size_bytes = output.response_size_bytes,
                    "Tool execution completed"
                );
                Ok(ExecutionResult {
                    tool_name: tool_name.to_owned(),
                    job_id,
                    success: true,
                    data: output.data,
                    output: chunks,
                    response_size_bytes: output.response_size_bytes,
                    duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    timestamp: Utc::now(),
                    error: None,
                })
            }
            Err(err) => {
                warn!(
                    name: "gateway.execution.failed",
                    tool = %tool_name,
                    job_id = %job_id,
                    code = %err.code(),
                    duration_ms = duration.as_millis(),
                    "Tool execution failed"
                );
                Err(enrich(err))
            }
        }
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, ToolExecutionError> {
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(permit);
        }

        let waiting = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if waiting > self.config.max_pending {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(ToolExecutionError::new(
                ErrorCode::ConcurrencyLimitExceeded,
                "Too many executions waiting for a slot",
            )
            .with_details(json!({
                "maxParallel": self.config.max_parallel,
                "maxPending": self.config.max_pending,
            })));
        }

        self.monitor.record_enqueued();
        let _queued = QueueGuard {
            pending: &self.pending,
            monitor: self.monitor.as_ref(),
        };
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| ToolExecutionError::internal("execution slots closed").with_source(e))
    }

    fn register_job(
        &self,
        job_id: &str,
        tool_name: &str,
        cancellation: &CancellationToken,
        phase: &PhaseCell,
    ) -> JobGuard<'_> {
        lock(&self.jobs).insert(
            job_id.to_owned(),
            JobHandle {
                tool_name: tool_name.to_owned(),
                started_at: Utc::now(),
                cancellation: cancellation.clone(),
                phase: phase.clone(),
            },
        );
        JobGuard {
            jobs: &self.jobs,
            job_id: job_id.to_owned(),
        }
    }

    pub fn active_job_count(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn active_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = lock(&self.jobs)
            .iter()
            .map(|(job_id, handle)| JobInfo {
                job_id: job_id.clone(),
                tool_name: handle.tool_name.clone(),
                started_at: handle.started_at,
                phase: handle.phase.get(),
            })
            .collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    /// Signals cancellation to a running job. Returns `false` for unknown ids.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let jobs = lock(&self.jobs);
        let Some(handle) = jobs.get(job_id) else {
            return false;
        };
        handle.cancellation.cancel();
        info!(
            name: "gateway.execution.cancel_requested",
            job_id = %job_id,
            tool = %handle.tool_name,
            "Job cancellation requested"
        );
        true
    }
}
