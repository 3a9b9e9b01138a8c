//! Caller identity and request throttling in front of the tool routes.

pub mod claims;
pub mod middleware;
pub mod rate_limit;
