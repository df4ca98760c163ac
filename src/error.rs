//! Proxy-wide error type and its HTTP representation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("request body was not valid JSON: {0}")]
    InvalidRequestBody(String),

    #[error("request blocked by guard: {0}")]
    GuardBlocked(String),

    #[error("budget exceeded")]
    BudgetExceeded,

    #[error("failed to reach upstream provider: {0}")]
    UpstreamConnection(String),

    #[error("no provider configured for the resolved tier")]
    NoProviderAvailable,

    #[error("router is not configured")]
    RouterDisabled,
}

impl ProxyError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ProxyError::InvalidRequestBody(_) => (StatusCode::BAD_REQUEST, "invalid_request_body"),
            ProxyError::GuardBlocked(_) => (StatusCode::BAD_REQUEST, "guard_blocked"),
            ProxyError::BudgetExceeded => (StatusCode::TOO_MANY_REQUESTS, "budget_exceeded"),
            ProxyError::UpstreamConnection(_) => {
                (StatusCode::BAD_GATEWAY, "upstream_connection_failed")
            }
            ProxyError::NoProviderAvailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "no_provider_available")
            }
            ProxyError::RouterDisabled => (StatusCode::SERVICE_UNAVAILABLE, "router_disabled"),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        (status, axum::Json(json!({"error": code}))).into_response()
    }
}
