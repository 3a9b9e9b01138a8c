//! Tool Gateway
//!
//! A development-mode HTTP gateway that validates, executes and monitors
//! named tool invocations.
//!
//! # Modules
//!
//! - [`gateway`]: registry, validation, execution, monitoring and the HTTP routes
//! - [`security`]: bearer-token identity and rate limiting
//! - [`tools`]: reference tool backends
//! - [`config`]: layered configuration
//! - [`telemetry`]: tracing subscriber setup

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod gateway;
pub mod security;
pub mod server;
pub mod telemetry;
pub mod tools;

use crate::config::AppConfig;
use crate::gateway::ToolGateway;
use crate::security::middleware::JwtIdentityProvider;
use crate::security::rate_limit::GatewayRateLimiter;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Validation, execution and monitoring.
    pub gateway: Arc<ToolGateway>,
    /// Bearer token verification.
    pub identity: Arc<JwtIdentityProvider>,
    /// Global Rate Limiter
    pub rate_limiter: Arc<GatewayRateLimiter>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}
