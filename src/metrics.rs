/// Per-route metrics and Prometheus exposition for the gateway
use anyhow::Result;
use dashmap::DashMap;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a dispatched request ended, for the `outcome` label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    Rejected,
    CacheHit,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
            Outcome::Rejected => "rejected",
            Outcome::CacheHit => "cache_hit",
        }
    }
}

/// Counters for a single route
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMetrics {
    /// Requests that matched the route
    pub requests: u64,
    /// Handler invocations that completed below 500
    pub success: u64,
    /// Handler errors, timeouts and 5xx responses
    pub errors: u64,
    /// Requests answered before reaching the handler, cache hits excluded
    pub rejections: u64,
    /// Average handler latency in milliseconds
    pub avg_latency_ms: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub last_error: Option<String>,
}

impl RouteMetrics {
    /// Percentage of handler invocations that succeeded
    pub fn success_rate(&self) -> f64 {
        let completed = self.success + self.errors;
        if completed == 0 {
            return 100.0;
        }
        self.success as f64 / completed as f64 * 100.0
    }

    /// Percentage of cache lookups that hit
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / lookups as f64 * 100.0
    }

    fn observe_latency(&mut self, latency: Duration) {
        // Running mean over every completed handler call
        let n = (self.success + self.errors) as f64;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = self.avg_latency_ms * (n - 1.0) / n + latency_ms / n;
    }
}

/// Serializable per-route view including derived rates
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMetricsSnapshot {
    #[serde(flatten)]
    pub metrics: RouteMetrics,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
}

impl From<RouteMetrics> for RouteMetricsSnapshot {
    fn from(metrics: RouteMetrics) -> Self {
        Self {
            success_rate: metrics.success_rate(),
            cache_hit_rate: metrics.cache_hit_rate(),
            metrics,
        }
    }
}

/// Metrics registry for the gateway
pub struct MetricsRegistry {
    /// Per-route counters, each behind its own lock
    routes: DashMap<String, Arc<Mutex<RouteMetrics>>>,
    /// Prometheus registry
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    cache_lookups_total: IntCounterVec,
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "gateway_requests_total",
                "Total number of requests dispatched by the gateway",
            ),
            &["route", "outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Handler duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["route"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let cache_lookups_total = IntCounterVec::new(
            Opts::new(
                "gateway_cache_lookups_total",
                "Response cache lookups by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        Ok(Self {
            routes: DashMap::new(),
            registry,
            requests_total,
            request_duration,
            cache_lookups_total,
        })
    }

    fn with_route<R>(&self, route_key: &str, update: impl FnOnce(&mut RouteMetrics) -> R) -> R {
        let cell = match self.routes.get(route_key) {
            Some(cell) => cell.clone(),
            None => self
                .routes
                .entry(route_key.to_string())
                .or_default()
                .clone(),
        };
        let mut metrics = cell.lock().unwrap_or_else(|e| e.into_inner());
        update(&mut metrics)
    }

    /// Count a request that matched `route_key`
    pub fn record_request(&self, route_key: &str) {
        self.with_route(route_key, |m| m.requests += 1);
    }

    /// Record a handler call that completed below 500
    pub fn record_success(&self, route_key: &str, latency: Duration) {
        self.with_route(route_key, |m| {
            m.success += 1;
            m.observe_latency(latency);
        });
        self.requests_total
            .with_label_values(&[route_key, Outcome::Success.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[route_key])
            .observe(latency.as_secs_f64());
    }

    /// Record a handler error, timeout or 5xx response
    pub fn record_error(&self, route_key: &str, latency: Duration, error: &str) {
        self.with_route(route_key, |m| {
            m.errors += 1;
            m.observe_latency(latency);
            m.last_error = Some(error.to_string());
        });
        self.requests_total
            .with_label_values(&[route_key, Outcome::Error.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[route_key])
            .observe(latency.as_secs_f64());
    }

    /// Record a request turned away before reaching the handler
    pub fn record_rejection(&self, route_key: &str) {
        self.with_route(route_key, |m| m.rejections += 1);
        self.requests_total
            .with_label_values(&[route_key, Outcome::Rejected.as_str()])
            .inc();
    }

    pub fn record_cache_hit(&self, route_key: &str) {
        self.with_route(route_key, |m| m.cache_hits += 1);
        self.requests_total
            .with_label_values(&[route_key, Outcome::CacheHit.as_str()])
            .inc();
        self.cache_lookups_total.with_label_values(&["hit"]).inc();
    }

    pub fn record_cache_miss(&self, route_key: &str) {
        self.with_route(route_key, |m| m.cache_misses += 1);
        self.cache_lookups_total.with_label_values(&["miss"]).inc();
    }

    /// Metrics for one route, if it has seen traffic
    pub fn get(&self, route_key: &str) -> Option<RouteMetrics> {
        let cell = self.routes.get(route_key)?.clone();
        let metrics = cell.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Some(metrics)
    }

    /// Metrics for every route, ordered by route key
    pub fn all(&self) -> BTreeMap<String, RouteMetrics> {
        let cells: Vec<(String, Arc<Mutex<RouteMetrics>>)> = self
            .routes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        cells
            .into_iter()
            .map(|(key, cell)| {
                let metrics = cell.lock().unwrap_or_else(|e| e.into_inner()).clone();
                (key, metrics)
            })
            .collect()
    }

    /// Number of routes with metrics
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Drop every per-route counter and Prometheus series
    pub fn reset(&self) {
        self.routes.clear();
        self.requests_total.reset();
        self.request_duration.reset();
        self.cache_lookups_total.reset();
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
