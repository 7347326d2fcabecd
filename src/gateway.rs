/// Request dispatcher tying routing, auth, caching and protection together
use anyhow::Result;
use futures::FutureExt;
use http::{HeaderValue, Method, StatusCode};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::{
    auth::{authenticate, Hs256Verifier, TokenVerifier},
    cache::{CacheEntry, ResponseCache},
    circuit_breaker::{CircuitBreakerRegistry, CircuitState},
    clock::{SharedClock, SystemClock},
    config::GatewayConfig,
    error::GatewayError,
    health::HealthReport,
    metrics::{MetricsRegistry, RouteMetricsSnapshot},
    middleware::{Flow, Middleware, MiddlewareChain},
    rate_limit::SlidingWindowLimiter,
    request::{GatewayRequest, GatewayResponse},
    routes::{
        Handler, RateLimitRule, RouteConfig, RouteDefaults, RouteOptions, RouteRegistry,
        RouteSummary,
    },
};

/// Header carrying the request ID on every response
pub const X_REQUEST_ID_HEADER: &str = "x-request-id";
/// Header marking responses served from the cache
pub const X_CACHE_HEADER: &str = "x-cache";

struct GatewayInner {
    /// Configuration
    config: GatewayConfig,
    /// Time source for limiter windows, breaker cooldowns and cache TTLs
    clock: SharedClock,
    /// Token verifier used for routes that require authentication
    verifier: Arc<dyn TokenVerifier>,
    /// Route registry
    routes: RouteRegistry,
    /// Global middleware chain
    middleware: MiddlewareChain,
    limiter: SlidingWindowLimiter,
    breakers: CircuitBreakerRegistry,
    cache: ResponseCache,
    /// Metrics collector
    metrics: MetricsRegistry,
}

/// Hostel request gateway.
///
/// Cloning is cheap; clones share every registry.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

/// Non-owning handle to a [`Gateway`], for tasks and handlers that must not
/// keep it alive
#[derive(Clone)]
pub struct WeakGateway {
    inner: Weak<GatewayInner>,
}

impl WeakGateway {
    pub fn upgrade(&self) -> Option<Gateway> {
        self.inner.upgrade().map(|inner| Gateway { inner })
    }
}

/// What one maintenance sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub evicted_buckets: usize,
    pub purged_cache_entries: usize,
}

impl Gateway {
    /// Create a gateway with the system clock and the HS256 verifier
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(Hs256Verifier), Arc::new(SystemClock))
    }

    /// Create a gateway driven by a custom clock
    pub fn with_clock(config: GatewayConfig, clock: SharedClock) -> Result<Self> {
        Self::with_parts(config, Arc::new(Hs256Verifier), clock)
    }

    /// Create a gateway from explicit collaborators
    pub fn with_parts(
        config: GatewayConfig,
        verifier: Arc<dyn TokenVerifier>,
        clock: SharedClock,
    ) -> Result<Self> {
        // Validate configuration
        config.validate()?;
        if config.auth.secret.is_empty() {
            warn!("No auth secret configured; routes requiring auth will reject every request");
        }

        let defaults = RouteDefaults {
            cache_ttl: config.cache.default_ttl,
            rate_limit: RateLimitRule {
                max: config.rate_limiting.default_max,
                window: config.rate_limiting.default_window,
            },
            timeout: config.request_timeout,
        };

        let inner = GatewayInner {
            routes: RouteRegistry::new(defaults),
            middleware: MiddlewareChain::from_config(&config.middleware)?,
            limiter: SlidingWindowLimiter::new(),
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
            cache: ResponseCache::new(config.cache.clone()),
            metrics: MetricsRegistry::new()?,
            verifier,
            clock,
            config,
        };

        info!(
            "Gateway initialized (cache: {}, rate limiting: {}, circuit breaker: {})",
            inner.config.cache.enabled,
            inner.config.rate_limiting.enabled,
            inner.config.circuit_breaker.enabled
        );

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn downgrade(&self) -> WeakGateway {
        WeakGateway {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Register or overwrite a route
    pub fn register_route(
        &self,
        method: Method,
        path: &str,
        handler: Arc<dyn Handler>,
        options: RouteOptions,
    ) -> Arc<RouteConfig> {
        self.inner
            .routes
            .register_route(method, path, handler, options)
    }

    /// Append a global middleware
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.middleware.push(middleware);
    }

    /// Run a request through the full pipeline; always produces a response
    pub async fn handle(&self, mut request: GatewayRequest) -> GatewayResponse {
        let mut staged = GatewayResponse::default();
        let mut response = match self.dispatch(&mut request, &mut staged).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Request {} rejected: {}", request.context.request_id, e);
                e.to_response()
            }
        };

        if request.context.route_key.is_some() {
            response.merge_missing_headers(&staged.headers);
            self.inner
                .middleware
                .process_response(&request, &mut response)
                .await;
        }

        if let Ok(value) = HeaderValue::from_str(&request.context.request_id) {
            response.headers.insert(X_REQUEST_ID_HEADER, value);
        }

        self.log_completion(&request, &response);
        response
    }

    async fn dispatch(
        &self,
        request: &mut GatewayRequest,
        staged: &mut GatewayResponse,
    ) -> Result<GatewayResponse, GatewayError> {
        let inner = &*self.inner;

        let size = request.declared_size();
        if size > inner.config.max_request_size_bytes {
            return Err(GatewayError::PayloadTooLarge {
                size,
                limit: inner.config.max_request_size_bytes,
            });
        }

        let Some(route) = inner.routes.get_route(&request.method, &request.path) else {
            return self.unrouted(request, staged).await;
        };
        let route_key = route.key();
        request.context.route_key = Some(route_key.clone());
        inner.metrics.record_request(&route_key);

        let reject = |e: GatewayError| {
            inner.metrics.record_rejection(&route_key);
            e
        };

        match inner.middleware.process_request(request, staged).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Abort(response)) => {
                inner.metrics.record_rejection(&route_key);
                return Ok(response);
            }
            Err(e) => {
                error!("Middleware error on {}: {}", route_key, e);
                return Err(reject(e));
            }
        }

        if route.requires_auth {
            let claims = authenticate(
                inner.verifier.as_ref(),
                request.header(&inner.config.auth.header),
                &inner.config.auth.secret,
                &route.roles,
            )
            .map_err(reject)?;
            debug!(
                "Authenticated {:?} for {}",
                claims.subject.as_deref().unwrap_or("unknown"),
                route_key
            );
            request.context.claims = Some(claims);
        }

        let now = inner.clock.now();

        let cache_key = (route.cacheable && request.is_read_only() && inner.cache.is_enabled())
            .then(|| ResponseCache::cache_key(&route_key, &request.query));
        if let Some(key) = &cache_key {
            match inner.cache.get(key, now) {
                (Some(entry), _) => {
                    inner.metrics.record_cache_hit(&route_key);
                    return Ok(Self::cached_response(entry, now));
                }
                (None, status) => {
                    debug!("Cache {} for {}", status.as_str(), key);
                    inner.metrics.record_cache_miss(&route_key);
                }
            }
        }

        if inner.config.rate_limiting.enabled {
            let decision =
                inner
                    .limiter
                    .check_and_record(&route_key, &request.client_id, route.rate_limit, now);
            if !decision.allowed {
                return Err(reject(GatewayError::RateLimited {
                    retry_after: decision.retry_after_secs,
                }));
            }
        }

        let breaker_enabled = inner.config.circuit_breaker.enabled;
        if breaker_enabled {
            let decision = inner.breakers.check_state(&route_key, now);
            if decision.is_open {
                return Err(reject(GatewayError::CircuitOpen {
                    route: route_key.clone(),
                    retry_after: decision.retry_after_secs,
                }));
            }
        }

        if let Some(validator) = &route.validator {
            if let Err(errors) = validator.validate(request.body.as_ref()) {
                if breaker_enabled {
                    inner.breakers.release_trial(&route_key);
                }
                return Err(reject(GatewayError::ValidationFailed { errors }));
            }
        }

        let mut response = GatewayResponse::json(StatusCode::OK, Value::Null);
        let started = tokio::time::Instant::now();
        let call = AssertUnwindSafe(route.handler.call(request, &mut response)).catch_unwind();
        let outcome = tokio::time::timeout(route.timeout, call).await;
        let latency = started.elapsed();

        match outcome {
            Ok(Ok(Ok(body))) => {
                response.body = body;
                if response.status.is_server_error() {
                    self.record_handler_failure(
                        &route_key,
                        latency,
                        &format!("handler returned {}", response.status),
                    );
                    return Ok(response);
                }

                if breaker_enabled {
                    inner.breakers.record_success(&route_key);
                }
                inner.metrics.record_success(&route_key, latency);

                if let Some(key) = cache_key {
                    if response.is_success() {
                        inner.cache.set(
                            key,
                            response.status,
                            response.headers.clone(),
                            response.body.clone(),
                            route.cache_ttl,
                            inner.clock.now(),
                        );
                    }
                    response
                        .headers
                        .insert(X_CACHE_HEADER, HeaderValue::from_static("MISS"));
                }
                Ok(response)
            }
            Ok(Ok(Err(e))) => {
                let err = GatewayError::HandlerException(format!("{:#}", e));
                error!("Handler for {} failed: {:#}", route_key, e);
                self.record_handler_failure(&route_key, latency, &err.to_string());
                Err(err)
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                error!("Handler for {} panicked: {}", route_key, reason);
                let err = GatewayError::HandlerException(format!("handler panicked: {}", reason));
                self.record_handler_failure(&route_key, latency, &err.to_string());
                Err(err)
            }
            Err(_) => {
                let err = GatewayError::HandlerTimeout {
                    timeout_ms: route.timeout.as_millis() as u64,
                };
                error!("Handler for {} timed out after {:?}", route_key, route.timeout);
                self.record_handler_failure(&route_key, latency, &err.to_string());
                Err(err)
            }
        }
    }

    /// Requests with no matching route. An OPTIONS request for a path registered
    /// under another method still runs the middleware chain so that a preflight
    /// can be answered; anything else is a 404.
    async fn unrouted(
        &self,
        request: &mut GatewayRequest,
        staged: &mut GatewayResponse,
    ) -> Result<GatewayResponse, GatewayError> {
        let inner = &*self.inner;
        if request.method == Method::OPTIONS && inner.routes.has_path(&request.path) {
            if let Flow::Abort(response) = inner.middleware.process_request(request, staged).await? {
                return Ok(response);
            }
        }

        warn!("No route found for {} {}", request.method, request.path);
        Err(GatewayError::RouteNotFound {
            method: request.method.to_string(),
            path: request.path.clone(),
        })
    }

    fn record_handler_failure(&self, route_key: &str, latency: Duration, error: &str) {
        let inner = &*self.inner;
        if inner.config.circuit_breaker.enabled {
            inner.breakers.record_failure(route_key, inner.clock.now());
        }
        inner.metrics.record_error(route_key, latency, error);
    }

    fn cached_response(entry: CacheEntry, now: std::time::Instant) -> GatewayResponse {
        let age = entry.age_secs(now);
        let mut response = GatewayResponse {
            status: entry.status,
            headers: entry.headers,
            body: entry.body,
        };
        response
            .headers
            .insert(X_CACHE_HEADER, HeaderValue::from_static("HIT"));
        response
            .headers
            .insert(http::header::AGE, HeaderValue::from(age));
        response
    }

    fn log_completion(&self, request: &GatewayRequest, response: &GatewayResponse) {
        let status_code = response.status.as_u16();

        // Log request completion
        let log_level = if status_code >= 500 {
            log::Level::Error
        } else if status_code >= 400 {
            log::Level::Warn
        } else {
            log::Level::Info
        };

        log::log!(
            log_level,
            "Request {} completed: {} {} -> {} ({}ms) [{}]",
            request.context.request_id,
            request.method,
            request.path,
            status_code,
            request.context.duration().as_millis(),
            request.context.route_key.as_deref().unwrap_or("no-route")
        );
    }

    /// Metrics for one route, or for every route when `route_key` is `None`
    pub fn get_metrics(&self, route_key: Option<&str>) -> BTreeMap<String, RouteMetricsSnapshot> {
        match route_key {
            Some(key) => self
                .inner
                .metrics
                .get(key)
                .map(|metrics| (key.to_string(), metrics.into()))
                .into_iter()
                .collect(),
            None => self
                .inner
                .metrics
                .all()
                .into_iter()
                .map(|(key, metrics)| (key, metrics.into()))
                .collect(),
        }
    }

    /// Registered routes ordered by key
    pub fn get_routes(&self) -> Vec<RouteSummary> {
        self.inner
            .routes
            .list_routes()
            .iter()
            .map(|route| route.summary())
            .collect()
    }

    pub fn health_check(&self) -> HealthReport {
        let inner = &*self.inner;
        HealthReport::new(
            inner.routes.route_count(),
            inner.cache.len(),
            inner.breakers.status(inner.clock.now()),
            inner.metrics.len(),
        )
    }

    /// Current breaker state of a route, if it has seen traffic
    pub fn circuit_state(&self, route_key: &str) -> Option<CircuitState> {
        self.inner.breakers.state(route_key)
    }

    /// Drop cached responses whose key matches a glob pattern, or all of them
    pub fn clear_cache(&self, pattern: Option<&str>) -> Result<usize> {
        let removed = self.inner.cache.clear(pattern)?;
        info!("Cleared {} cached responses", removed);
        Ok(removed)
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
        info!("Metrics reset");
    }

    pub fn reset_circuit_breakers(&self) {
        self.inner.breakers.reset();
    }

    /// Export metrics in Prometheus text format
    pub fn export_metrics(&self) -> Result<String> {
        self.inner.metrics.export_metrics()
    }

    /// Evict idle rate limit buckets and purge expired cache entries
    pub fn sweep(&self) -> SweepReport {
        let inner = &*self.inner;
        let now = inner.clock.now();
        let report = SweepReport {
            evicted_buckets: inner.limiter.evict_idle(now),
            purged_cache_entries: inner.cache.purge_expired(now),
        };
        if report != SweepReport::default() {
            debug!(
                "Maintenance sweep evicted {} buckets and purged {} cache entries",
                report.evicted_buckets, report.purged_cache_entries
            );
        }
        report
    }

    /// Run [`Gateway::sweep`] every `interval` on the current tokio runtime.
    ///
    /// The task ends once every `Gateway` clone has been dropped.
    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let weak = self.downgrade();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(gateway) => {
                        gateway.sweep();
                    }
                    None => {
                        debug!("Gateway dropped, stopping maintenance task");
                        break;
                    }
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::routes::handler_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_gateway() -> (Gateway, ManualClock) {
        let clock = ManualClock::default();
        let gateway = Gateway::with_clock(GatewayConfig::default(), Arc::new(clock.clone())).unwrap();
        (gateway, clock)
    }

    #[tokio::test]
    async fn test_every_response_carries_request_id() {
        let (gateway, _) = test_gateway();
        gateway.register_route(
            Method::GET,
            "/vouchers",
            handler_fn(|_req| async { Ok(json!([])) }),
            RouteOptions::new(),
        );

        let ok = gateway.handle(GatewayRequest::get("/vouchers")).await;
        assert_eq!(ok.status, StatusCode::OK);
        assert!(ok.header(X_REQUEST_ID_HEADER).unwrap().starts_with("req-"));

        let missing = gateway.handle(GatewayRequest::get("/nowhere")).await;
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert!(missing.header(X_REQUEST_ID_HEADER).is_some());
    }

    #[tokio::test]
    async fn test_handler_can_set_status() {
        struct Created;

        #[async_trait::async_trait]
        impl Handler for Created {
            async fn call(
                &self,
                _request: &GatewayRequest,
                response: &mut GatewayResponse,
            ) -> Result<Value> {
                response.status = StatusCode::CREATED;
                response.set_header("location", "/orders/7")?;
                Ok(json!({"id": 7}))
            }
        }

        let (gateway, _) = test_gateway();
        gateway.register_route(Method::POST, "/orders", Arc::new(Created), RouteOptions::new());

        let response = gateway
            .handle(GatewayRequest::post("/orders", json!({"sku": "towel"})))
            .await;
        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.header("location"), Some("/orders/7"));
        assert_eq!(response.body["id"], 7);
    }

    #[tokio::test]
    async fn test_server_error_status_counts_as_failure() {
        struct Unavailable;

        #[async_trait::async_trait]
        impl Handler for Unavailable {
            async fn call(
                &self,
                _request: &GatewayRequest,
                response: &mut GatewayResponse,
            ) -> Result<Value> {
                response.status = StatusCode::BAD_GATEWAY;
                Ok(json!({"error": "laundry service down"}))
            }
        }

        let (gateway, _) = test_gateway();
        gateway.register_route(Method::GET, "/laundry", Arc::new(Unavailable), RouteOptions::new());

        for _ in 0..5 {
            let response = gateway.handle(GatewayRequest::get("/laundry")).await;
            assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        }
        assert_eq!(gateway.circuit_state("GET:/laundry"), Some(CircuitState::Open));
        assert_eq!(gateway.get_metrics(Some("GET:/laundry"))["GET:/laundry"].metrics.errors, 5);
    }

    #[tokio::test]
    async fn test_non_cacheable_methods_skip_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (gateway, _) = test_gateway();
        gateway.register_route(
            Method::POST,
            "/orders",
            handler_fn(move |_req| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"ok": true}))
                }
            }),
            RouteOptions::new().cacheable(Duration::from_secs(60)),
        );

        for _ in 0..2 {
            let response = gateway
                .handle(GatewayRequest::post("/orders", json!({})))
                .await;
            assert!(response.header(X_CACHE_HEADER).is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_state() {
        let (gateway, clock) = test_gateway();
        gateway.register_route(
            Method::GET,
            "/stays",
            handler_fn(|_req| async { Ok(json!([])) }),
            RouteOptions::new()
                .cacheable(Duration::from_secs(1))
                .rate_limit(10, Duration::from_secs(1)),
        );
        gateway.handle(GatewayRequest::get("/stays")).await;

        clock.advance(Duration::from_secs(2));
        let report = gateway.sweep();
        assert_eq!(report.evicted_buckets, 1);
        assert_eq!(report.purged_cache_entries, 1);
        assert_eq!(gateway.health_check().cache_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_task_stops_with_gateway() {
        let (gateway, _) = test_gateway();
        let handle = gateway.spawn_maintenance(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!handle.is_finished());

        drop(gateway);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
