//! Gateway Error Kinds
//!
//! One variant per caller-visible failure mode. The HTTP mapping lives here
//! so handlers never hand-roll status codes, and so internal detail
//! (`SandboxFault`, matched policy rules) cannot leak into a response body.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// Errors surfaced by the request pipeline.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing or invalid credential.
    #[error("missing or invalid credentials")]
    Unauthorized,

    /// Valid identity, insufficient privilege tier.
    #[error("insufficient privilege for this operation")]
    Forbidden,

    /// Command or argument not permitted. The reason is intentionally
    /// generic: echoing which rule matched would let callers probe policy.
    #[error("command not permitted by policy")]
    PolicyDenied,

    /// Per-identity or global budget exhausted.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Concurrent-execution ceiling reached. Transient; safe to retry.
    #[error("too many concurrent executions")]
    Overloaded,

    /// The sandbox could not spawn the process at all (missing binary,
    /// OS-level permission error). Detail is logged server-side only.
    #[error("execution failed")]
    SandboxFault { detail: String },

    /// A posture transition for this dimension is already in flight.
    #[error("a transition for '{dimension}' is already in progress")]
    Conflict { dimension: String },

    /// A posture transition ran and failed; state reverted to last known-good.
    #[error("transition for '{dimension}' failed, state is '{state}'")]
    TransitionFailed { dimension: String, state: String },

    /// Malformed request (empty command, oversized argument, bad dimension).
    #[error("{0}")]
    BadRequest(String),
}

impl GatewayError {
    /// Status code for the HTTP surface.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden | GatewayError::PolicyDenied => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::SandboxFault { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Conflict { .. } => StatusCode::CONFLICT,
            GatewayError::TransitionFailed { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Short machine-readable kind, used in responses, audit entries, and
    /// metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::Forbidden => "forbidden",
            GatewayError::PolicyDenied => "policy_denied",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Overloaded => "overloaded",
            GatewayError::SandboxFault { .. } => "sandbox_fault",
            GatewayError::Conflict { .. } => "conflict",
            GatewayError::TransitionFailed { .. } => "transition_failed",
            GatewayError::BadRequest(_) => "bad_request",
        }
    }

    /// Message shown to the caller. Never includes internal paths or the
    /// sandbox failure detail.
    fn public_message(&self) -> String {
        match self {
            GatewayError::SandboxFault { .. } => "execution failed".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::SandboxFault { detail } = &self {
            error!(detail = %detail, "sandbox fault");
        }

        let body = json!({
            "error": self.kind(),
            "message": self.public_message(),
        });

        let mut response = (self.status(), axum::Json(body)).into_response();

        if let GatewayError::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
