//! Gateway error taxonomy
//!
//! Each variant maps to one user-visible outcome. Internal detail (rule ids,
//! backend addresses, handshake state) is logged but never serialized into a
//! client-facing response body.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors surfaced by the request pipeline.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// TLS or QUIC negotiation failed. The connection is dropped without a
    /// response; this variant only appears in logs.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No configured identity matched the request host. The response is a
    /// generic 404 that still carries the full policy header set.
    #[error("no route for host {0:?}")]
    Routing(String),

    /// A WAF rule with a blocking action matched.
    #[error("blocked by rule {rule_id}")]
    PolicyViolation { rule_id: String },

    /// Sensitive-route rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// Backend unreachable after bounded retries.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend did not answer within the configured deadline.
    #[error("backend timed out after {0}ms")]
    BackendTimeout(u64),

    /// Certificate material missing or unusable. The listener fails closed
    /// rather than serving without TLS.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Early-data request used a non-idempotent method.
    #[error("early data rejected for method {0}")]
    EarlyDataRejected(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Status code for the generic client-facing response. Retrying a
    /// security rejection has no value, so only backend failures map to
    /// retriable statuses.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Handshake(_) => StatusCode::BAD_REQUEST,
            GatewayError::Routing(_) => StatusCode::NOT_FOUND,
            GatewayError::PolicyViolation { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BackendUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Certificate(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::EarlyDataRejected(_) => StatusCode::TOO_EARLY,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Generic response body. Never includes rule ids, backend diagnostics
    /// or handshake state.
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::Handshake(_) => "Bad request",
            GatewayError::Routing(_) => "Not found",
            GatewayError::PolicyViolation { .. } => "Forbidden",
            GatewayError::RateLimitExceeded { .. } => "Too many requests",
            GatewayError::BackendUnavailable(_) => "Upstream unavailable",
            GatewayError::BackendTimeout(_) => "Upstream timeout",
            GatewayError::Certificate(_) => "Internal error",
            GatewayError::EarlyDataRejected(_) => "Retry after handshake completion",
            GatewayError::Config(_) => "Internal error",
        }
    }
}
