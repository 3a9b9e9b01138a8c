use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    middleware::Next,
    response::IntoResponse,
};
use std::sync::Arc;
use std::time::Duration;

use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::AppState;
use crate::config::AppConfig;
use crate::gateway::error::{ErrorCode, ToolExecutionError};
use crate::gateway::{ToolGateway, api};
use crate::security::middleware::JwtIdentityProvider;
use crate::security::rate_limit::GatewayRateLimiter;
use crate::tools::builtin_registry;

/// Headroom over the validator's own limit so oversized bodies reach it and
/// get a proper envelope.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

/// Grace period past the longest tool timeout before the HTTP layer gives up.
const REQUEST_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

/// Wires the gateway, identity provider and rate limiter for `config`.
///
/// Must be called inside a Tokio runtime.
pub fn build_state(config: Arc<AppConfig>, gateway: ToolGateway) -> AppState {
    AppState {
        gateway: Arc::new(gateway),
        identity: Arc::new(JwtIdentityProvider::new(&config.security)),
        rate_limiter: Arc::new(GatewayRateLimiter::new(
            config.resilience.requests_per_second,
            config.resilience.burst_size,
        )),
        config,
    }
}

/// Full application router with the global layers applied.
pub fn build_app(state: AppState) -> Router {
    let config = Arc::clone(&state.config);
    let timeout_duration =
        Duration::from_secs(config.gateway.max_timeout_secs) + REQUEST_TIMEOUT_SLACK;
    let body_limit = config.gateway.max_request_bytes.saturating_add(BODY_LIMIT_SLACK);

    Router::new()
        .merge(api::router(&state))
        .layer(axum::middleware::from_fn(
            move |req: Request, next: Next| async move {
                match tokio::time::timeout(timeout_duration, next.run(req)).await {
                    Ok(res) => res,
                    Err(_) => ToolExecutionError::new(
                        ErrorCode::ExecutionTimeout,
                        "Request timed out",
                    )
                    .with_request_id(uuid::Uuid::new_v4().to_string())
                    .into_response(),
                }
            },
        ))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(body_limit)),
        )
        .with_state(state)
}

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let registry = builtin_registry()?;
    for tool in registry.get_available_tools() {
        info!(name: "gateway.tool.registered", tool = %tool.name, "Tool registered");
    }

    let gateway = ToolGateway::from_config(registry, &config);
    let state = build_state(Arc::clone(&config), gateway);

    if config.gateway.dev_mode {
        let tools = state.gateway.registry();
        info!(
            name: "gateway.enabled",
            tool_count = tools.len(),
            jwt_required = state.identity.is_required(),
            rate_limit_enabled = config.resilience.rate_limit_enabled,
            "Tool execution routes mounted"
        );
        if tools.is_empty() {
            warn!(name: "gateway.empty", "No tools registered");
        }
    } else {
        warn!(
            name: "gateway.disabled",
            "Development mode is off; tool execution routes are not mounted"
        );
    }

    let app = build_app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(name: "server.stopped", "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(name: "server.signal.failed", error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
