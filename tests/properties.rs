use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use serde_json::{Value, json};
use tool_gateway::config::MonitoringConfig;
use tool_gateway::gateway::monitoring::{ExecutionOutcome, alert_types};
use tool_gateway::gateway::{
    BackendError, BackendOutput, CallContext, CallerContext, ErrorCode, ExecutionMonitor,
    ExecutorConfig, NoopMonitor, ParamValue, Parameters, PerformanceMonitor, SecurityValidator,
    ToolDefinition, ToolExecutor, ToolGateway, ToolRegistry, backend_fn, sanitize_for_logging,
};
use tool_gateway::security::claims::CallerIdentity;
use tool_gateway::tools::builtin_registry;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn counting_registry(names: &[&str], calls: &Arc<AtomicUsize>) -> ToolRegistry {
    names
        .iter()
        .fold(ToolRegistry::builder(), |builder, name| {
            let calls = Arc::clone(calls);
            builder
                .register(
                    ToolDefinition::new(*name, "counted"),
                    backend_fn(move |_ctx: CallContext, _params: Parameters| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Ok::<_, BackendError>(BackendOutput::new(Value::Null)) }
                    }),
                )
                .unwrap()
        })
        .build()
}

#[test]
fn builtin_schemas_are_consistent() {
    let registry = builtin_registry().unwrap();
    for definition in registry.get_available_tools() {
        let schema = registry.get_tool_schema(&definition.name).unwrap();
        assert_eq!(schema.name, definition.name);
        for required in &schema.required {
            assert!(!schema.optional.contains(required));
            assert!(schema.parameters["properties"].get(required).is_some());
        }
        let declared = definition.parameters.len();
        assert_eq!(schema.required.len() + schema.optional.len(), declared);
    }
}

const PAYLOADS: [&str; 10] = [
    "<script>alert(1)</script>",
    "javascript:alert(1)",
    "<img src=x onerror=alert(1)>",
    "{{7*7}}",
    "${jndi:ldap://x}",
    "; rm -rf /",
    "$(whoami)",
    "' OR '1'='1",
    "1 UNION SELECT password",
    "x'; DROP TABLE users; --",
];

proptest! {
    #[test]
    fn effective_timeout_is_clamped(requested in -1_000.0f64..1_000.0) {
        let executor = ToolExecutor::new(
            Arc::new(ToolRegistry::builder().build()),
            Arc::new(NoopMonitor),
            ExecutorConfig {
                default_timeout: Duration::from_secs(30),
                max_timeout: Duration::from_secs(300),
                ..ExecutorConfig::default()
            },
        );
        let effective = executor.effective_timeout(Some(requested));
        if requested <= 0.0 {
            prop_assert_eq!(effective, Duration::from_secs(30));
        } else if requested > 300.0 {
            prop_assert_eq!(effective, Duration::from_secs(300));
        } else {
            prop_assert_eq!(effective, Duration::from_secs_f64(requested));
        }
    }

    #[test]
    fn concurrency_gauge_returns_to_zero(outcomes in prop::collection::vec(0u8..4, 1..40)) {
        runtime().block_on(async {
            let monitor = PerformanceMonitor::start(&MonitoringConfig::default());
            let mut tasks = Vec::new();
            for (i, code) in outcomes.iter().copied().enumerate() {
                let monitor = Arc::clone(&monitor);
                tasks.push(tokio::spawn(async move {
                    let tool = format!("tool-{}", i % 3);
                    monitor.record_start(&tool, Some("athlete"));
                    tokio::task::yield_now().await;
                    let outcome = match code {
                        0 => ExecutionOutcome::Success,
                        1 => ExecutionOutcome::Failure,
                        2 => ExecutionOutcome::Timeout,
                        _ => ExecutionOutcome::Cancelled,
                    };
                    monitor.record_end(&tool, Some("athlete"), Duration::from_millis(1), outcome);
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }

            let metrics = monitor.metrics();
            assert_eq!(metrics.concurrent_executions, 0);
            assert_eq!(metrics.total_executions, outcomes.len() as u64);
            assert!(metrics.tools.values().all(|t| t.active_jobs == 0));
            assert_eq!(metrics.user_executions["athlete"], outcomes.len() as u64);
        });
    }

    #[test]
    fn malicious_strings_never_reach_backend(
        index in 0..PAYLOADS.len(),
        prefix in "([a-zA-Z]{1,12} )?",
        suffix in "( [a-zA-Z]{1,12})?",
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(counting_registry(&["update-logbook"], &calls));
        let gateway = ToolGateway::new(
            registry,
            SecurityValidator::default(),
            Arc::new(NoopMonitor),
            ExecutorConfig::default(),
        );
        let content = format!("{prefix}{}{suffix}", PAYLOADS[index]);
        let body = json!({"parameters": {"content": content}}).to_string();

        let result = runtime().block_on(gateway.execute(
            "update-logbook",
            body.as_bytes(),
            &CallerIdentity::anonymous(),
        ));
        prop_assert!(result.is_err());
        prop_assert_eq!(result.unwrap_err().code(), ErrorCode::MaliciousInput);
        prop_assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_tools_are_never_dispatched(name in "[a-z][a-z0-9_-]{0,30}") {
        prop_assume!(name != "registered");
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = ToolExecutor::new(
            Arc::new(counting_registry(&["registered"], &calls)),
            Arc::new(NoopMonitor),
            ExecutorConfig::default(),
        );

        let result = runtime().block_on(executor.execute_tool(
            &name,
            Parameters::new(),
            CallerContext::new("req"),
        ));
        prop_assert_eq!(result.unwrap_err().code(), ErrorCode::ToolNotFound);
        prop_assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn slow_alert_iff_above_threshold(duration_ms in 0u64..400, threshold_ms in 1u64..300) {
        let alerts = runtime().block_on(async {
            let monitor = PerformanceMonitor::start(&MonitoringConfig {
                max_execution_time_ms: threshold_ms,
                ..MonitoringConfig::default()
            });
            monitor.record_start("measured", None);
            monitor.record_end(
                "measured",
                None,
                Duration::from_millis(duration_ms),
                ExecutionOutcome::Success,
            );
            // A sentinel far above the threshold; once it is stored, every
            // earlier alert has been processed too.
            monitor.record_start("sentinel", None);
            monitor.record_end(
                "sentinel",
                None,
                Duration::from_secs(3_600),
                ExecutionOutcome::Success,
            );
            loop {
                let alerts = monitor.alerts();
                if alerts.iter().any(|a| a.tool_name.as_deref() == Some("sentinel")) {
                    break alerts;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let measured_slow = alerts.iter().any(|a| {
            a.alert_type == alert_types::SLOW_EXECUTION && a.tool_name.as_deref() == Some("measured")
        });
        prop_assert_eq!(measured_slow, duration_ms > threshold_ms);
    }

    #[test]
    fn sanitize_is_idempotent(
        entries in prop::collection::btree_map(
            "[a-z_]{1,12}",
            prop_oneof![
                ".{0,300}".prop_map(ParamValue::from),
                any::<i64>().prop_map(ParamValue::from),
                any::<bool>().prop_map(ParamValue::from),
                Just(ParamValue::Null),
            ],
            0..8,
        )
    ) {
        let params: Parameters = entries;
        let once = sanitize_for_logging(&params);
        let twice = sanitize_for_logging(&once);
        prop_assert_eq!(once, twice);
    }
}
