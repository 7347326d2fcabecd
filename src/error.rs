/// Pipeline error taxonomy and its mapping onto responses
use http::{header, HeaderValue, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;

use crate::request::GatewayResponse;

/// Every way the pipeline can terminate a request early
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("no route registered for {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("authentication failed: {0}")]
    Unauthenticated(String),

    #[error("insufficient role for this route")]
    Unauthorized,

    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("circuit breaker open for route {route}, retry after {retry_after}s")]
    CircuitOpen { route: String, retry_after: u64 },

    #[error("request validation failed")]
    ValidationFailed { errors: Vec<String> },

    #[error("handler exceeded its {timeout_ms}ms deadline")]
    HandlerTimeout { timeout_ms: u64 },

    #[error("handler failed: {0}")]
    HandlerException(String),

    #[error("middleware '{name}' failed: {reason}")]
    MiddlewareFailed { name: String, reason: String },
}

impl GatewayError {
    /// HTTP status the error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Unauthorized => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
            GatewayError::HandlerTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::HandlerException(_) | GatewayError::MiddlewareFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::PayloadTooLarge { .. } => "payload_too_large",
            GatewayError::RouteNotFound { .. } => "route_not_found",
            GatewayError::Unauthenticated(_) => "unauthenticated",
            GatewayError::Unauthorized => "forbidden",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::ValidationFailed { .. } => "validation_failed",
            GatewayError::HandlerTimeout { .. } => "handler_timeout",
            GatewayError::HandlerException(_) => "handler_error",
            GatewayError::MiddlewareFailed { .. } => "middleware_error",
        }
    }

    /// Seconds the caller should wait before retrying, if any
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after }
            | GatewayError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Build the single structured response for this error
    pub fn to_response(&self) -> GatewayResponse {
        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        if let Some(retry_after) = self.retry_after() {
            body["retryAfter"] = Value::from(retry_after);
        }
        if let GatewayError::ValidationFailed { errors } = self {
            body["errors"] = Value::from(errors.clone());
        }

        let mut response = GatewayResponse::json(self.status(), body);
        if let Some(retry_after) = self.retry_after() {
            response
                .headers
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_response() {
        let response = GatewayError::RateLimited { retry_after: 7 }.to_response();
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.header("retry-after"), Some("7"));
        assert_eq!(response.body["retryAfter"], 7);
        assert_eq!(response.body["error"], "rate_limited");
    }

    #[test]
    fn test_auth_errors_are_distinct() {
        assert_eq!(
            GatewayError::Unauthenticated("expired".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(GatewayError::Unauthorized.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_validation_errors_listed() {
        let err = GatewayError::ValidationFailed {
            errors: vec!["guest_id is required".into()],
        };
        let response = err.to_response();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.body["errors"][0], "guest_id is required");
        assert!(response.header("retry-after").is_none());
    }
}
