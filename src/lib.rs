//! Hostel Gateway - request gateway for the hostel operations backend
//!
//! Every inbound call passes through one pipeline before reaching its
//! handler:
//! - Exact route lookup and payload size limits
//! - Global middleware chain (CORS, header transforms, custom middlewares)
//! - Token authentication and role authorization
//! - TTL response caching for read-only routes
//! - Sliding-window rate limiting per route and client
//! - Per-route circuit breaking and handler timeouts
//! - Per-route metrics with Prometheus exposition

pub mod auth;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
pub mod request;
pub mod routes;

pub use auth::{Claims, Hs256Verifier, TokenVerifier};
pub use cache::{CacheEntry, CacheStatus, ResponseCache};
pub use circuit_breaker::{CircuitBreakerRegistry, CircuitState};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::*;
pub use error::GatewayError;
pub use gateway::{Gateway, SweepReport, WeakGateway};
pub use health::{HealthReport, HealthState};
pub use middleware::{Flow, Middleware, MiddlewareChain};
pub use request::{GatewayRequest, GatewayResponse, RequestContext};
pub use routes::{handler_fn, Handler, RequiredFields, RouteConfig, RouteOptions, Validator};
