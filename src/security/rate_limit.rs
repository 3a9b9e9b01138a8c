use crate::AppState;
use crate::gateway::error::{ErrorCode, ToolExecutionError};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;
use uuid::Uuid;

/// Global token bucket in front of the tool routes.
///
/// Not keyed by caller; one bucket is shared by every request.
pub struct GatewayRateLimiter {
    limiter: DefaultDirectRateLimiter,
}

impl fmt::Debug for GatewayRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayRateLimiter").finish_non_exhaustive()
    }
}

impl GatewayRateLimiter {
    pub fn new(rate_per_sec: f32, burst_size: f32) -> Self {
        let rate = f64::from(rate_per_sec).max(0.001);
        let burst = NonZeroU32::new(burst_size.max(1.0) as u32).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(Duration::from_secs_f64(1.0 / rate))
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);
        Self {
            limiter: RateLimiter::direct(quota),
        }
    }

    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// Middleware to enforce rate limits
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if state.config.resilience.rate_limit_enabled && !state.rate_limiter.check() {
        tracing::warn!(
            name: "security.rate_limit.exceeded",
            path = %req.uri().path(),
            "Rate limit exceeded"
        );
        return ToolExecutionError::new(ErrorCode::RateLimitExceeded, "Too many requests")
            .with_request_id(Uuid::new_v4().to_string())
            .into_response();
    }
    next.run(req).await
}
