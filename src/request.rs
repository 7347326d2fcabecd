/// Request and response types flowing through the gateway pipeline
use anyhow::{anyhow, Result};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::auth::Claims;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Request context that carries information throughout the request lifecycle
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request start time
    pub start_time: Instant,
    /// Unique request ID for tracing
    pub request_id: String,
    /// Key of the route that matched this request
    pub route_key: Option<String>,
    /// Verified token claims, set for routes that require authentication
    pub claims: Option<Claims>,
}

impl RequestContext {
    /// Create a new request context with a cheap, process-unique request ID
    pub fn new() -> Self {
        let request_id = format!(
            "req-{:016x}-{:08x}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
            REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        Self {
            start_time: Instant::now(),
            request_id,
            route_key: None,
            claims: None,
        }
    }

    /// Get request duration
    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound call as seen by the gateway
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Query parameters in client order; repeated names are allowed
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Identity used for rate limiting (usually the caller's address or API key)
    pub client_id: String,
    pub context: RequestContext,
}

impl GatewayRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            client_id: "anonymous".to_string(),
            context: RequestContext::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| anyhow!("Invalid header name '{}': {}", name, e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| anyhow!("Invalid value for header '{}': {}", name, e))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Header value as a string, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Payload size: the declared `content-length`, or the encoded body length
    pub fn declared_size(&self) -> usize {
        if let Some(length) = self
            .header(header::CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            return length;
        }

        self.body
            .as_ref()
            .and_then(|body| serde_json::to_vec(body).ok())
            .map(|bytes| bytes.len())
            .unwrap_or(0)
    }

    /// Whether the method never mutates state
    pub fn is_read_only(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }
}

/// Outbound response produced by the gateway
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl GatewayResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Value::Null,
        }
    }

    pub fn json(status: StatusCode, body: Value) -> Self {
        let mut response = Self::new(status);
        response.body = body;
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }

    /// Insert or overwrite a header
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| anyhow!("Invalid header name '{}': {}", name, e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| anyhow!("Invalid value for header '{}': {}", name, e))?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Header value as a string, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Copy headers from `other` that are not already set on this response
    pub(crate) fn merge_missing_headers(&mut self, other: &HeaderMap) {
        for (name, value) in other {
            if !self.headers.contains_key(name) {
                self.headers.insert(name.clone(), value.clone());
            }
        }
    }
}

impl Default for GatewayResponse {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_declared_size_prefers_content_length() {
        let req = GatewayRequest::post("/orders", json!({"items": [1, 2, 3]}))
            .with_header("content-length", "4096")
            .unwrap();
        assert_eq!(req.declared_size(), 4096);
    }

    #[test]
    fn test_declared_size_falls_back_to_body() {
        let req = GatewayRequest::post("/orders", json!({"a": 1}));
        assert_eq!(req.declared_size(), r#"{"a":1}"#.len());
        assert_eq!(GatewayRequest::get("/orders").declared_size(), 0);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestContext::new();
        let b = RequestContext::new();
        assert_ne!(a.request_id, b.request_id);
        assert!(a.request_id.starts_with("req-"));
    }

    #[test]
    fn test_merge_missing_headers_keeps_existing() {
        let mut response = GatewayResponse::json(StatusCode::OK, json!({}));
        response.set_header("x-origin", "handler").unwrap();

        let mut staged = HeaderMap::new();
        staged.insert("x-origin", HeaderValue::from_static("middleware"));
        staged.insert("x-extra", HeaderValue::from_static("1"));
        response.merge_missing_headers(&staged);

        assert_eq!(response.header("x-origin"), Some("handler"));
        assert_eq!(response.header("x-extra"), Some("1"));
    }
}
