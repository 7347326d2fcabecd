/// Middleware system for the gateway
use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use log::{debug, warn};
use std::sync::Arc;

use crate::{
    config::{CorsConfig, HeaderTransformConfig, MiddlewareConfig, TransformConfig},
    error::GatewayError,
    request::{GatewayRequest, GatewayResponse},
};

/// What the pipeline does after a middleware ran
#[derive(Debug)]
pub enum Flow {
    /// Hand the request to the next stage
    Continue,
    /// Stop here and return this response
    Abort(GatewayResponse),
}

/// Trait for middleware components
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs and error responses
    fn name(&self) -> &str;

    /// Inspect or modify the request before authentication.
    ///
    /// Headers set on `response` are carried onto the final response unless
    /// a later stage sets the same header.
    async fn process(
        &self,
        request: &mut GatewayRequest,
        response: &mut GatewayResponse,
    ) -> Result<Flow>;

    /// Modify the final response before it is returned
    async fn process_response(
        &self,
        _request: &GatewayRequest,
        _response: &mut GatewayResponse,
    ) -> Result<()> {
        Ok(())
    }
}

/// CORS middleware
pub struct CorsMiddleware {
    config: CorsConfig,
}

impl CorsMiddleware {
    pub fn new(config: CorsConfig) -> Self {
        Self { config }
    }

    /// Check if origin is allowed
    fn is_origin_allowed(&self, origin: &str) -> bool {
        self.config
            .allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }

    fn allowed_origin<'a>(&self, request: &'a GatewayRequest) -> Option<&'a str> {
        request
            .header(header::ORIGIN.as_str())
            .filter(|origin| self.is_origin_allowed(origin))
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &str {
        "cors"
    }

    async fn process(
        &self,
        request: &mut GatewayRequest,
        _response: &mut GatewayResponse,
    ) -> Result<Flow> {
        // Handle preflight requests
        if request.method != Method::OPTIONS {
            return Ok(Flow::Continue);
        }
        let Some(origin) = self.allowed_origin(request) else {
            return Ok(Flow::Continue);
        };

        let mut preflight = GatewayResponse::new(StatusCode::NO_CONTENT);
        preflight.set_header("access-control-allow-origin", origin)?;
        preflight.set_header(
            "access-control-allow-methods",
            &self.config.allowed_methods.join(", "),
        )?;
        if !self.config.allowed_headers.is_empty() {
            preflight.set_header(
                "access-control-allow-headers",
                &self.config.allowed_headers.join(", "),
            )?;
        }
        if let Some(max_age) = &self.config.max_age {
            preflight.set_header("access-control-max-age", &max_age.as_secs().to_string())?;
        }

        debug!("Answered CORS preflight for {} from {}", request.path, origin);
        Ok(Flow::Abort(preflight))
    }

    async fn process_response(
        &self,
        request: &GatewayRequest,
        response: &mut GatewayResponse,
    ) -> Result<()> {
        if let Some(origin) = self.allowed_origin(request) {
            response.set_header("access-control-allow-origin", origin)?;
            response.set_header("vary", "Origin")?;
        }
        Ok(())
    }
}

/// Header rules with names and values parsed up front
#[derive(Debug, Default)]
struct HeaderRules {
    add: Vec<(HeaderName, HeaderValue)>,
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl HeaderRules {
    fn compile(config: &HeaderTransformConfig) -> Result<Self> {
        let parse_pair = |(name, value): (&String, &String)| -> Result<(HeaderName, HeaderValue)> {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| anyhow!("Invalid header name '{}': {}", name, e))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| anyhow!("Invalid value for header '{}': {}", name, e))?;
            Ok((header_name, header_value))
        };

        Ok(Self {
            add: config.add.iter().map(parse_pair).collect::<Result<_>>()?,
            set: config.set.iter().map(parse_pair).collect::<Result<_>>()?,
            remove: config
                .remove
                .iter()
                .map(|name| {
                    HeaderName::from_bytes(name.as_bytes())
                        .map_err(|e| anyhow!("Invalid header name '{}': {}", name, e))
                })
                .collect::<Result<_>>()?,
        })
    }

    fn apply(&self, headers: &mut HeaderMap) {
        // Add headers
        for (name, value) in &self.add {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        // Set headers (overwrite)
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }

        // Remove headers
        for name in &self.remove {
            headers.remove(name);
        }
    }
}

/// Header transformation middleware
pub struct HeaderTransformMiddleware {
    request_rules: Option<HeaderRules>,
    response_rules: Option<HeaderRules>,
}

impl HeaderTransformMiddleware {
    pub fn new(config: &TransformConfig) -> Result<Self> {
        Ok(Self {
            request_rules: config
                .request_headers
                .as_ref()
                .map(HeaderRules::compile)
                .transpose()?,
            response_rules: config
                .response_headers
                .as_ref()
                .map(HeaderRules::compile)
                .transpose()?,
        })
    }
}

#[async_trait]
impl Middleware for HeaderTransformMiddleware {
    fn name(&self) -> &str {
        "transform"
    }

    async fn process(
        &self,
        request: &mut GatewayRequest,
        _response: &mut GatewayResponse,
    ) -> Result<Flow> {
        if let Some(rules) = &self.request_rules {
            rules.apply(&mut request.headers);
        }
        Ok(Flow::Continue)
    }

    async fn process_response(
        &self,
        _request: &GatewayRequest,
        response: &mut GatewayResponse,
    ) -> Result<()> {
        if let Some(rules) = &self.response_rules {
            rules.apply(&mut response.headers);
        }
        Ok(())
    }
}

/// Ordered list of global middlewares, run for every matched route
pub struct MiddlewareChain {
    middlewares: ArcSwap<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middlewares: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Create a middleware chain with the built-ins enabled in configuration
    pub fn from_config(config: &MiddlewareConfig) -> Result<Self> {
        let chain = Self::new();

        // Add CORS middleware
        if let Some(cors_config) = &config.cors {
            chain.push(Arc::new(CorsMiddleware::new(cors_config.clone())));
        }

        // Add header transformation middleware
        if let Some(transform_config) = &config.transform {
            chain.push(Arc::new(HeaderTransformMiddleware::new(transform_config)?));
        }

        Ok(chain)
    }

    /// Append a middleware; it runs after every middleware already in the chain
    pub fn push(&self, middleware: Arc<dyn Middleware>) {
        debug!("Installed middleware '{}'", middleware.name());
        self.middlewares.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(middleware.clone());
            next
        });
    }

    pub fn len(&self) -> usize {
        self.middlewares.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.load().is_empty()
    }

    /// Run the request phase in registration order, stopping at the first abort
    pub async fn process_request(
        &self,
        request: &mut GatewayRequest,
        response: &mut GatewayResponse,
    ) -> Result<Flow, GatewayError> {
        let middlewares = self.middlewares.load_full();
        for middleware in middlewares.iter() {
            let flow = middleware
                .process(request, response)
                .await
                .map_err(|e| GatewayError::MiddlewareFailed {
                    name: middleware.name().to_string(),
                    reason: e.to_string(),
                })?;

            if let Flow::Abort(aborted) = flow {
                debug!(
                    "Middleware '{}' aborted {} {} with {}",
                    middleware.name(),
                    request.method,
                    request.path,
                    aborted.status
                );
                return Ok(Flow::Abort(aborted));
            }
        }
        Ok(Flow::Continue)
    }

    /// Run the response phase in registration order; failures are logged and skipped
    pub async fn process_response(&self, request: &GatewayRequest, response: &mut GatewayResponse) {
        let middlewares = self.middlewares.load_full();
        for middleware in middlewares.iter() {
            if let Err(e) = middleware.process_response(request, response).await {
                warn!(
                    "Middleware '{}' failed on response for {}: {}",
                    middleware.name(),
                    request.path,
                    e
                );
            }
        }
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}
