//! Execution telemetry with threshold alerting.
//!
//! A monitor is an explicit instance passed by `Arc` to whoever records
//! executions. [`PerformanceMonitor`] keeps counters under one `RwLock` and
//! ships alerts through a bounded channel to a background processor;
//! [`NoopMonitor`] records nothing.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{ErrorCode, ToolExecutionError};
use super::redact::loggable;
use super::value::Parameters;
use crate::config::MonitoringConfig;

/// Minimum executions of a tool before rate alerts are evaluated.
const MIN_EXECUTIONS_FOR_RATES: u64 = 10;

pub mod alert_types {
    pub const SLOW_EXECUTION: &str = "slow_execution";
    pub const HIGH_CONCURRENT_EXECUTIONS: &str = "high_concurrent_executions";
    pub const HIGH_QUEUE_DEPTH: &str = "high_queue_depth";
    pub const HIGH_ERROR_RATE: &str = "high_error_rate";
    pub const HIGH_TIMEOUT_RATE: &str = "high_timeout_rate";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOutcome {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl ExecutionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn of<T>(result: &Result<T, ToolExecutionError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(err) => match err.code() {
                ErrorCode::ExecutionTimeout => Self::Timeout,
                ErrorCode::ExecutionCancelled => Self::Cancelled,
                _ => Self::Failure,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub alert_type: String,
    pub tool_name: Option<String>,
    pub user_id: Option<String>,
    pub message: String,
    pub severity: AlertSeverity,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetrics {
    pub executions: u64,
    pub successes: u64,
    /// Every execution that did not succeed, timeouts and cancellations
    /// included.
    pub errors: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub total_duration_ms: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: f64,
    pub active_jobs: u64,
    pub last_execution: Option<DateTime<Utc>>,
}

impl ToolMetrics {
    fn percent(part: u64, whole: u64) -> f64 {
        if whole == 0 {
            0.0
        } else {
            part as f64 * 100.0 / whole as f64
        }
    }

    pub fn error_rate_percent(&self) -> f64 {
        Self::percent(self.errors, self.executions)
    }

    pub fn timeout_rate_percent(&self) -> f64 {
        Self::percent(self.timeouts, self.executions)
    }

    fn record(&mut self, duration_ms: f64, outcome: ExecutionOutcome) {
        self.executions += 1;
        match outcome {
            ExecutionOutcome::Success => self.successes += 1,
            ExecutionOutcome::Failure => self.errors += 1,
            ExecutionOutcome::Timeout => {
                self.errors += 1;
                self.timeouts += 1;
            }
            ExecutionOutcome::Cancelled => {
                self.errors += 1;
                self.cancellations += 1;
            }
        }
        self.total_duration_ms += duration_ms;
        self.avg_duration_ms = self.total_duration_ms / self.executions as f64;
        self.min_duration_ms = Some(self.min_duration_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);
        self.active_jobs = self.active_jobs.saturating_sub(1);
        self.last_execution = Some(Utc::now());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_executions: u64,
    pub concurrent_executions: u64,
    pub peak_concurrent_executions: u64,
    pub queue_depth: u64,
    pub tools: BTreeMap<String, ToolMetrics>,
    pub user_executions: BTreeMap<String, u64>,
    pub alerts: VecDeque<Alert>,
    pub started_at: DateTime<Utc>,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            total_executions: 0,
            concurrent_executions: 0,
            peak_concurrent_executions: 0,
            queue_depth: 0,
            tools: BTreeMap::new(),
            user_executions: BTreeMap::new(),
            alerts: VecDeque::new(),
            started_at: Utc::now(),
        }
    }
}

/// Sink for execution telemetry.
pub trait ExecutionMonitor: Send + Sync + fmt::Debug {
    fn record_start(&self, tool: &str, user: Option<&str>);
    fn record_end(&self, tool: &str, user: Option<&str>, duration: Duration, outcome: ExecutionOutcome);
    fn record_enqueued(&self);
    fn record_dequeued(&self);
    /// Current metrics, or `None` when monitoring is disabled.
    fn snapshot(&self) -> Option<PerformanceMetrics>;
}

/// Monitor used when monitoring is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl ExecutionMonitor for NoopMonitor {
    fn record_start(&self, _tool: &str, _user: Option<&str>) {}
    fn record_end(&self, _tool: &str, _user: Option<&str>, _duration: Duration, _outcome: ExecutionOutcome) {}
    fn record_enqueued(&self) {}
    fn record_dequeued(&self) {}
    fn snapshot(&self) -> Option<PerformanceMetrics> {
        None
    }
}

/// Picks the monitor implementation for `config`.
///
/// Must be called inside a Tokio runtime when monitoring is enabled.
pub fn from_config(config: &MonitoringConfig) -> Arc<dyn ExecutionMonitor> {
    if config.enabled {
        PerformanceMonitor::start(config)
    } else {
        Arc::new(NoopMonitor)
    }
}

/// Matches one `record_start` with exactly one `record_end`.
struct ExecutionSpan<'a> {
    monitor: &'a dyn ExecutionMonitor,
    tool: &'a str,
    user: Option<&'a str>,
    started: Instant,
    finished: bool,
}

impl<'a> ExecutionSpan<'a> {
    fn start(monitor: &'a dyn ExecutionMonitor, tool: &'a str, user: Option<&'a str>) -> Self {
        monitor.record_start(tool, user);
        Self {
            monitor,
            tool,
            user,
            started: Instant::now(),
            finished: false,
        }
    }

    fn finish(mut self, outcome: ExecutionOutcome) {
        self.finished = true;
        self.monitor
            .record_end(self.tool, self.user, self.started.elapsed(), outcome);
    }
}

impl Drop for ExecutionSpan<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let outcome = if std::thread::panicking() {
                ExecutionOutcome::Failure
            } else {
                ExecutionOutcome::Cancelled
            };
            self.monitor
                .record_end(self.tool, self.user, self.started.elapsed(), outcome);
        }
    }
}

/// Runs `execution` under `monitor`.
///
/// Exactly one end is recorded, also when the future is dropped before
/// completion or panics.
pub async fn monitor<T, F>(
    monitor: &dyn ExecutionMonitor,
    tool: &str,
    params: &Parameters,
    user: Option<&str>,
    execution: F,
) -> Result<T, ToolExecutionError>
where
    F: Future<Output = Result<T, ToolExecutionError>>,
{
    debug!(
        name: "gateway.monitor.start",
        tool = %tool,
        user = ?user,
        parameters = %loggable(params),
        "Execution started"
    );
    let span = ExecutionSpan::start(monitor, tool, user);
    let result = execution.await;
    span.finish(ExecutionOutcome::of(&result));
    result
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Counter-based monitor with background alert processing.
pub struct PerformanceMonitor {
    config: MonitoringConfig,
    metrics: Arc<RwLock<PerformanceMetrics>>,
    alerts_tx: mpsc::Sender<Alert>,
    shutdown: CancellationToken,
}

impl fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl PerformanceMonitor {
    /// Creates the monitor and spawns its alert processor and sweeper.
    pub fn start(config: &MonitoringConfig) -> Arc<Self> {
        let metrics = Arc::new(RwLock::new(PerformanceMetrics::default()));
        let (alerts_tx, alerts_rx) = mpsc::channel(config.alert_queue_capacity.max(1));
        let shutdown = CancellationToken::new();

        tokio::spawn(process_alerts(
            alerts_rx,
            Arc::clone(&metrics),
            config.max_stored_alerts,
            shutdown.clone(),
        ));
        tokio::spawn(sweep_alerts(
            Arc::clone(&metrics),
            Duration::from_secs(config.cleanup_interval_secs.max(1)),
            retention(config),
            shutdown.clone(),
        ));

        info!(
            name: "gateway.monitor.started",
            max_execution_time_ms = config.max_execution_time_ms,
            max_concurrent_executions = config.max_concurrent_executions,
            max_queue_depth = config.max_queue_depth,
            "Performance monitor started"
        );

        Arc::new(Self {
            config: config.clone(),
            metrics,
            alerts_tx,
            shutdown,
        })
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        read(&self.metrics).clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        read(&self.metrics).alerts.iter().cloned().collect()
    }

    /// Drops alerts older than the retention window. Returns how many went.
    pub fn prune_expired_alerts(&self) -> usize {
        prune(&self.metrics, retention(&self.config))
    }

    fn emit(&self, alert: Alert) {
        counter!("tool_gateway_alerts_total", "type" => alert.alert_type.clone()).increment(1);
        match self.alerts_tx.try_send(alert) {
            Ok(()) => {}
            Err(TrySendError::Full(alert)) => warn!(
                name: "gateway.monitor.alert_dropped",
                alert_type = %alert.alert_type,
                "Alert queue full, dropping alert"
            ),
            Err(TrySendError::Closed(alert)) => debug!(
                name: "gateway.monitor.alert_dropped",
                alert_type = %alert.alert_type,
                "Alert processor stopped"
            ),
        }
    }
}

fn retention(config: &MonitoringConfig) -> chrono::Duration {
    i64::try_from(config.alert_retention_hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .unwrap_or(chrono::Duration::MAX)
}

fn alert(
    alert_type: &str,
    severity: AlertSeverity,
    tool: Option<&str>,
    user: Option<&str>,
    message: String,
    value: f64,
    threshold: f64,
) -> Alert {
    Alert {
        timestamp: Utc::now(),
        alert_type: alert_type.to_owned(),
        tool_name: tool.map(str::to_owned),
        user_id: user.map(str::to_owned),
        message,
        severity,
        value,
        threshold,
    }
}

impl ExecutionMonitor for PerformanceMonitor {
    fn record_start(&self, tool: &str, user: Option<&str>) {
        let concurrent = {
            let mut metrics = write(&self.metrics);
            metrics.concurrent_executions += 1;
            metrics.peak_concurrent_executions = metrics
                .peak_concurrent_executions
                .max(metrics.concurrent_executions);
            metrics.tools.entry(tool.to_owned()).or_default().active_jobs += 1;
            metrics.concurrent_executions
        };
        gauge!("tool_gateway_concurrent_executions").set(concurrent as f64);

        let limit = self.config.max_concurrent_executions;
        if concurrent > limit {
            self.emit(alert(
                alert_types::HIGH_CONCURRENT_EXECUTIONS,
                AlertSeverity::Warning,
                Some(tool),
                user,
                format!("{concurrent} concurrent executions exceed {limit}"),
                concurrent as f64,
                limit as f64,
            ));
        }
    }

    fn record_end(&self, tool: &str, user: Option<&str>, duration: Duration, outcome: ExecutionOutcome) {
        let duration_ms = duration.as_secs_f64() * 1000.0;
        let mut pending = Vec::new();

        let concurrent = {
            let mut metrics = write(&self.metrics);
            metrics.total_executions += 1;
            metrics.concurrent_executions = metrics.concurrent_executions.saturating_sub(1);
            if let Some(user) = user {
                *metrics.user_executions.entry(user.to_owned()).or_default() += 1;
            }
            let stats = metrics.tools.entry(tool.to_owned()).or_default();
            stats.record(duration_ms, outcome);

            if stats.executions >= MIN_EXECUTIONS_FOR_RATES {
                let error_rate = stats.error_rate_percent();
                if error_rate > self.config.max_error_rate_percent {
                    pending.push(alert(
                        alert_types::HIGH_ERROR_RATE,
                        AlertSeverity::Critical,
                        Some(tool),
                        None,
                        format!("Error rate {error_rate:.1}% over {} executions", stats.executions),
                        error_rate,
                        self.config.max_error_rate_percent,
                    ));
                }
                let timeout_rate = stats.timeout_rate_percent();
                if timeout_rate > self.config.max_timeout_rate_percent {
                    pending.push(alert(
                        alert_types::HIGH_TIMEOUT_RATE,
                        AlertSeverity::Warning,
                        Some(tool),
                        None,
                        format!("Timeout rate {timeout_rate:.1}% over {} executions", stats.executions),
                        timeout_rate,
                        self.config.max_timeout_rate_percent,
                    ));
                }
            }
            metrics.concurrent_executions
        };

        let threshold = self.config.max_execution_time_ms as f64;
        if duration_ms > threshold {
            let severity = if duration_ms > threshold * 2.0 {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            pending.push(alert(
                alert_types::SLOW_EXECUTION,
                severity,
                Some(tool),
                user,
                format!("Execution took {duration_ms:.0}ms"),
                duration_ms,
                threshold,
            ));
        }

        counter!(
            "tool_gateway_executions_total",
            "tool" => tool.to_owned(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        histogram!("tool_gateway_execution_duration_ms", "tool" => tool.to_owned()).record(duration_ms);
        gauge!("tool_gateway_concurrent_executions").set(concurrent as f64);

        for alert in pending {
            self.emit(alert);
        }
    }

    fn record_enqueued(&self) {
        let depth = {
            let mut metrics = write(&self.metrics);
            metrics.queue_depth += 1;
            metrics.queue_depth
        };
        gauge!("tool_gateway_queue_depth").set(depth as f64);

        let limit = self.config.max_queue_depth;
        if depth > limit {
            self.emit(alert(
                alert_types::HIGH_QUEUE_DEPTH,
                AlertSeverity::Warning,
                None,
                None,
                format!("{depth} executions waiting, limit {limit}"),
                depth as f64,
                limit as f64,
            ));
        }
    }

    fn record_dequeued(&self) {
        let depth = {
            let mut metrics = write(&self.metrics);
            metrics.queue_depth = metrics.queue_depth.saturating_sub(1);
            metrics.queue_depth
        };
        gauge!("tool_gateway_queue_depth").set(depth as f64);
    }

    fn snapshot(&self) -> Option<PerformanceMetrics> {
        Some(self.metrics())
    }
}

fn log_alert(alert: &Alert) {
    match alert.severity {
        AlertSeverity::Critical => error!(
            name: "gateway.monitor.alert",
            alert_type = %alert.alert_type,
            tool = ?alert.tool_name,
            user = ?alert.user_id,
            value = alert.value,
            threshold = alert.threshold,
            "{}", alert.message
        ),
        AlertSeverity::Warning => warn!(
            name: "gateway.monitor.alert",
            alert_type = %alert.alert_type,
            tool = ?alert.tool_name,
            user = ?alert.user_id,
            value = alert.value,
            threshold = alert.threshold,
            "{}", alert.message
        ),
        AlertSeverity::Info => info!(
            name: "gateway.monitor.alert",
            alert_type = %alert.alert_type,
            tool = ?alert.tool_name,
            value = alert.value,
            threshold = alert.threshold,
            "{}", alert.message
        ),
    }
}

async fn process_alerts(
    mut alerts_rx: mpsc::Receiver<Alert>,
    metrics: Arc<RwLock<PerformanceMetrics>>,
    max_stored: usize,
    shutdown: CancellationToken,
) {
    loop {
        let alert = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            alert = alerts_rx.recv() => match alert {
                Some(alert) => alert,
                None => break,
            },
        };
        log_alert(&alert);

        let mut metrics = write(&metrics);
        metrics.alerts.push_back(alert);
        while metrics.alerts.len() > max_stored {
            metrics.alerts.pop_front();
        }
    }
    debug!(name: "gateway.monitor.processor_stopped", "Alert processor stopped");
}

async fn sweep_alerts(
    metrics: Arc<RwLock<PerformanceMetrics>>,
    every: Duration,
    retention: chrono::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = prune(&metrics, retention);
                if removed > 0 {
                    debug!(name: "gateway.monitor.alerts_pruned", removed, "Pruned expired alerts");
                }
            }
        }
    }
}

fn prune(metrics: &RwLock<PerformanceMetrics>, retention: chrono::Duration) -> usize {
    let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
        return 0;
    };
    let mut metrics = write(metrics);
    let before = metrics.alerts.len();
    metrics.alerts.retain(|alert| alert.timestamp > cutoff);
    before - metrics.alerts.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MonitoringConfig {
        MonitoringConfig {
            max_execution_time_ms: 100,
            max_concurrent_executions: 2,
            max_queue_depth: 1,
            ..MonitoringConfig::default()
        }
    }

    async fn wait_for_alerts(monitor: &PerformanceMonitor, count: usize) -> Vec<Alert> {
        for _ in 0..200 {
            let alerts = monitor.alerts();
            if alerts.len() >= count {
                return alerts;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        monitor.alerts()
    }

    #[tokio::test]
    async fn gauge_returns_to_zero() {
        let monitor = PerformanceMonitor::start(&config());
        for _ in 0..5 {
            monitor.record_start("echo", Some("ada"));
        }
        assert_eq!(monitor.metrics().concurrent_executions, 5);
        for _ in 0..5 {
            monitor.record_end("echo", Some("ada"), Duration::from_millis(1), ExecutionOutcome::Success);
        }
        let metrics = monitor.metrics();
        assert_eq!(metrics.concurrent_executions, 0);
        assert_eq!(metrics.peak_concurrent_executions, 5);
        assert_eq!(metrics.total_executions, 5);
        assert_eq!(metrics.user_executions["ada"], 5);
        assert_eq!(metrics.tools["echo"].active_jobs, 0);
    }

    #[tokio::test]
    async fn slow_execution_only_above_threshold() {
        let monitor = PerformanceMonitor::start(&config());
        monitor.record_start("echo", None);
        monitor.record_end("echo", None, Duration::from_millis(100), ExecutionOutcome::Success);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(monitor.alerts().is_empty());

        monitor.record_start("echo", None);
        monitor.record_end("echo", None, Duration::from_millis(150), ExecutionOutcome::Success);
        monitor.record_start("echo", None);
        monitor.record_end("echo", None, Duration::from_millis(250), ExecutionOutcome::Success);
        let alerts = wait_for_alerts(&monitor, 2).await;
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.alert_type == alert_types::SLOW_EXECUTION));
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(alerts[1].severity, AlertSeverity::Critical);
        assert!(alerts[0].value > alerts[0].threshold);
    }

    #[tokio::test]
    async fn error_rate_needs_minimum_sample() {
        let monitor = PerformanceMonitor::start(&MonitoringConfig {
            max_execution_time_ms: 60_000,
            ..config()
        });
        for _ in 0..9 {
            monitor.record_start("flaky", None);
            monitor.record_end("flaky", None, Duration::from_millis(1), ExecutionOutcome::Failure);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(monitor.alerts().is_empty());

        monitor.record_start("flaky", None);
        monitor.record_end("flaky", None, Duration::from_millis(1), ExecutionOutcome::Timeout);
        let alerts = wait_for_alerts(&monitor, 2).await;
        let types: Vec<_> = alerts.iter().map(|a| a.alert_type.as_str()).collect();
        assert!(types.contains(&alert_types::HIGH_ERROR_RATE));
        assert!(types.contains(&alert_types::HIGH_TIMEOUT_RATE));
        let stats = &monitor.metrics().tools["flaky"];
        assert_eq!(stats.errors, 10);
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test]
    async fn queue_depth_alert() {
        let monitor = PerformanceMonitor::start(&config());
        monitor.record_enqueued();
        monitor.record_enqueued();
        assert_eq!(monitor.metrics().queue_depth, 2);
        monitor.record_dequeued();
        monitor.record_dequeued();
        assert_eq!(monitor.metrics().queue_depth, 0);
        let alerts = wait_for_alerts(&monitor, 1).await;
        assert_eq!(alerts[0].alert_type, alert_types::HIGH_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn full_queue_drops_newest() {
        let monitor = PerformanceMonitor::start(&MonitoringConfig {
            alert_queue_capacity: 1,
            ..config()
        });
        // The processor cannot run before this task yields.
        for ms in [200, 300, 400] {
            monitor.record_start("echo", None);
            monitor.record_end("echo", None, Duration::from_millis(ms), ExecutionOutcome::Success);
        }
        let alerts = wait_for_alerts(&monitor, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(monitor.alerts().len(), 1);
        assert!((alerts[0].value - 200.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn stored_alerts_are_bounded_and_pruned() {
        let monitor = PerformanceMonitor::start(&MonitoringConfig {
            max_stored_alerts: 2,
            alert_retention_hours: 0,
            ..config()
        });
        for _ in 0..4 {
            monitor.record_enqueued();
            monitor.record_enqueued();
            monitor.record_dequeued();
            monitor.record_dequeued();
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(monitor.alerts().len(), 2);
        assert_eq!(monitor.prune_expired_alerts(), 2);
        assert!(monitor.alerts().is_empty());
    }

    #[tokio::test]
    async fn monitor_records_exactly_one_end() {
        let perf = PerformanceMonitor::start(&config());
        let params = Parameters::new();

        let ok: Result<u8, ToolExecutionError> =
            monitor(perf.as_ref(), "echo", &params, None, async { Ok(1) }).await;
        assert!(ok.is_ok());
        let err: Result<u8, ToolExecutionError> = monitor(perf.as_ref(), "echo", &params, None, async {
            Err(ToolExecutionError::timeout(Duration::from_secs(1), "running"))
        })
        .await;
        assert!(err.is_err());

        // Dropped before completion.
        let pending = monitor(perf.as_ref(), "echo", &params, None, async {
            std::future::pending::<Result<u8, ToolExecutionError>>().await
        });
        let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;

        let metrics = perf.metrics();
        let echo = &metrics.tools["echo"];
        assert_eq!(echo.executions, 3);
        assert_eq!(echo.successes, 1);
        assert_eq!(echo.timeouts, 1);
        assert_eq!(echo.cancellations, 1);
        assert_eq!(metrics.concurrent_executions, 0);
    }

    #[test]
    fn noop_has_no_snapshot() {
        let noop = NoopMonitor;
        noop.record_start("x", None);
        noop.record_end("x", None, Duration::ZERO, ExecutionOutcome::Success);
        assert!(noop.snapshot().is_none());
    }
}
