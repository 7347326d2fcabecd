/// Route registry, handler and validator contracts for the gateway
use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::Method;
use log::debug;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::request::{GatewayRequest, GatewayResponse};

/// Downstream handler invoked once the pipeline admits a request.
///
/// The handler may set status and headers on `response`; the returned value
/// becomes the response body. Errors count as handler failures.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: &GatewayRequest, response: &mut GatewayResponse)
        -> Result<Value>;
}

/// Handler adapter for async closures taking an owned request
pub struct FnHandler<F> {
    func: F,
}

/// Wrap an async closure as a [`Handler`]
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn Handler>
where
    F: Fn(GatewayRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler { func })
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(GatewayRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(
        &self,
        request: &GatewayRequest,
        _response: &mut GatewayResponse,
    ) -> Result<Value> {
        (self.func)(request.clone()).await
    }
}

/// Request body validator
pub trait Validator: Send + Sync {
    /// `Ok(())` when the body is acceptable, otherwise every problem found
    fn validate(&self, body: Option<&Value>) -> Result<(), Vec<String>>;
}

impl<F> Validator for F
where
    F: Fn(Option<&Value>) -> Result<(), Vec<String>> + Send + Sync,
{
    fn validate(&self, body: Option<&Value>) -> Result<(), Vec<String>> {
        self(body)
    }
}

/// Validator requiring a JSON object body with the listed non-null fields
#[derive(Debug, Clone)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl Validator for RequiredFields {
    fn validate(&self, body: Option<&Value>) -> Result<(), Vec<String>> {
        let Some(object) = body.and_then(Value::as_object) else {
            return Err(vec!["request body must be a JSON object".to_string()]);
        };

        let errors: Vec<String> = self
            .fields
            .iter()
            .filter(|field| object.get(field.as_str()).map_or(true, Value::is_null))
            .map(|field| format!("{} is required", field))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Sliding-window limit applied per (route, client)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitRule {
    /// Requests admitted per window
    pub max: u32,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            max: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Options accepted by [`RouteRegistry::register_route`]; unset fields take defaults
#[derive(Clone, Default)]
pub struct RouteOptions {
    pub requires_auth: bool,
    pub roles: Vec<String>,
    pub cacheable: bool,
    pub cache_ttl: Option<Duration>,
    pub rate_limit: Option<RateLimitRule>,
    pub timeout: Option<Duration>,
    pub validator: Option<Arc<dyn Validator>>,
    pub description: Option<String>,
}

impl RouteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requires_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn cacheable(mut self, ttl: Duration) -> Self {
        self.cacheable = true;
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn rate_limit(mut self, max: u32, window: Duration) -> Self {
        self.rate_limit = Some(RateLimitRule { max, window });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Defaults filled in for options a registration leaves unset
#[derive(Debug, Clone, Copy)]
pub struct RouteDefaults {
    pub cache_ttl: Duration,
    pub rate_limit: RateLimitRule,
    pub timeout: Duration,
}

impl Default for RouteDefaults {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            rate_limit: RateLimitRule::default(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Fully resolved, immutable route policy
#[derive(Clone)]
pub struct RouteConfig {
    pub method: Method,
    pub path: String,
    pub handler: Arc<dyn Handler>,
    pub requires_auth: bool,
    pub roles: BTreeSet<String>,
    pub cacheable: bool,
    pub cache_ttl: Duration,
    pub rate_limit: RateLimitRule,
    pub timeout: Duration,
    pub validator: Option<Arc<dyn Validator>>,
    pub description: Option<String>,
}

impl RouteConfig {
    /// Registry key, `METHOD:path`
    pub fn key(&self) -> String {
        route_key(&self.method, &self.path)
    }

    /// Introspection view without the handler or validator
    pub fn summary(&self) -> RouteSummary {
        RouteSummary {
            key: self.key(),
            method: self.method.to_string(),
            path: self.path.clone(),
            requires_auth: self.requires_auth,
            roles: self.roles.iter().cloned().collect(),
            cacheable: self.cacheable,
            cache_ttl_secs: self.cache_ttl.as_secs(),
            rate_limit: self.rate_limit,
            timeout_ms: self.timeout.as_millis() as u64,
            has_validator: self.validator.is_some(),
            description: self.description.clone(),
        }
    }
}

impl fmt::Debug for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteConfig")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("requires_auth", &self.requires_auth)
            .field("roles", &self.roles)
            .field("cacheable", &self.cacheable)
            .field("cache_ttl", &self.cache_ttl)
            .field("rate_limit", &self.rate_limit)
            .field("timeout", &self.timeout)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

/// Serializable description of a registered route
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub key: String,
    pub method: String,
    pub path: String,
    pub requires_auth: bool,
    pub roles: Vec<String>,
    pub cacheable: bool,
    pub cache_ttl_secs: u64,
    pub rate_limit: RateLimitRule,
    pub timeout_ms: u64,
    pub has_validator: bool,
    pub description: Option<String>,
}

/// Registry key for a method and path
pub fn route_key(method: &Method, path: &str) -> String {
    format!("{}:{}", method.as_str(), path)
}

/// Route table with lock-free reads.
///
/// Registration swaps in a new map; lookups read the current snapshot.
pub struct RouteRegistry {
    routes: ArcSwap<HashMap<String, Arc<RouteConfig>>>,
    defaults: RouteDefaults,
}

impl RouteRegistry {
    pub fn new(defaults: RouteDefaults) -> Self {
        Self {
            routes: ArcSwap::from_pointee(HashMap::new()),
            defaults,
        }
    }

    /// Register or overwrite the route for `method` and `path`
    pub fn register_route(
        &self,
        method: Method,
        path: &str,
        handler: Arc<dyn Handler>,
        options: RouteOptions,
    ) -> Arc<RouteConfig> {
        let route = Arc::new(RouteConfig {
            method,
            path: path.to_string(),
            handler,
            requires_auth: options.requires_auth,
            roles: options.roles.into_iter().collect(),
            cacheable: options.cacheable,
            cache_ttl: options.cache_ttl.unwrap_or(self.defaults.cache_ttl),
            rate_limit: options.rate_limit.unwrap_or(self.defaults.rate_limit),
            timeout: options.timeout.unwrap_or(self.defaults.timeout),
            validator: options.validator,
            description: options.description,
        });
        let key = route.key();

        self.routes.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(key.clone(), route.clone());
            next
        });

        debug!(
            "Registered route {} (auth: {}, cacheable: {}, limit: {}/{:?}, timeout: {:?})",
            key,
            route.requires_auth,
            route.cacheable,
            route.rate_limit.max,
            route.rate_limit.window,
            route.timeout
        );

        route
    }

    /// Exact lookup by method and path
    pub fn get_route(&self, method: &Method, path: &str) -> Option<Arc<RouteConfig>> {
        self.routes.load().get(&route_key(method, path)).cloned()
    }

    /// All registered routes ordered by key
    pub fn list_routes(&self) -> Vec<Arc<RouteConfig>> {
        let mut routes: Vec<Arc<RouteConfig>> = self.routes.load().values().cloned().collect();
        routes.sort_by_key(|route| route.key());
        routes
    }

    /// Get route count
    pub fn route_count(&self) -> usize {
        self.routes.load().len()
    }

    /// Whether any method is registered for `path`
    pub fn has_path(&self, path: &str) -> bool {
        self.routes.load().values().any(|route| route.path == path)
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new(RouteDefaults::default())
    }
}

/// Compile a glob-like pattern (`*` within a segment, `**` across segments, `?`
/// one character) into an anchored regex
pub fn compile_glob(pattern: &str) -> Result<Regex> {
    let regex_pattern = glob_to_regex(pattern);
    Regex::new(&regex_pattern)
        .map_err(|e| anyhow!("Failed to compile pattern '{}': {}", pattern, e))
}

/// Convert a glob-like pattern to a regex pattern
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2);
    regex.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    // ** means match anything including path separators
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            // Escape regex special characters
            '.' | '+' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(ch);
            }
            _ => regex.push(ch),
        }
    }

    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_handler() -> Arc<dyn Handler> {
        handler_fn(|_req| async { Ok(json!({"ok": true})) })
    }

    #[test]
    fn test_defaults_applied() {
        let registry = RouteRegistry::default();
        let route = registry.register_route(Method::GET, "/vouchers", ok_handler(), RouteOptions::new());

        assert!(!route.requires_auth);
        assert!(route.roles.is_empty());
        assert!(!route.cacheable);
        assert_eq!(route.cache_ttl, Duration::from_secs(300));
        assert_eq!(route.rate_limit.max, 100);
        assert_eq!(route.rate_limit.window, Duration::from_secs(60));
        assert_eq!(route.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let registry = RouteRegistry::default();
        registry.register_route(Method::GET, "/stays", ok_handler(), RouteOptions::new());
        registry.register_route(
            Method::GET,
            "/stays",
            ok_handler(),
            RouteOptions::new().rate_limit(3, Duration::from_secs(1)),
        );

        assert_eq!(registry.route_count(), 1);
        let route = registry.get_route(&Method::GET, "/stays").unwrap();
        assert_eq!(route.rate_limit.max, 3);
    }

    #[test]
    fn test_lookup_is_method_sensitive() {
        let registry = RouteRegistry::default();
        registry.register_route(Method::POST, "/orders", ok_handler(), RouteOptions::new());

        assert!(registry.get_route(&Method::POST, "/orders").is_some());
        assert!(registry.get_route(&Method::GET, "/orders").is_none());
        assert!(registry.has_path("/orders"));
        assert!(!registry.has_path("/order"));
    }

    #[test]
    fn test_list_routes_sorted() {
        let registry = RouteRegistry::default();
        registry.register_route(Method::POST, "/orders", ok_handler(), RouteOptions::new());
        registry.register_route(Method::GET, "/items", ok_handler(), RouteOptions::new());

        let keys: Vec<String> = registry.list_routes().iter().map(|r| r.key()).collect();
        assert_eq!(keys, vec!["GET:/items", "POST:/orders"]);
    }

    #[test]
    fn test_required_fields_validator() {
        let validator = RequiredFields::new(["guest_id", "nights"]);
        assert!(validator
            .validate(Some(&json!({"guest_id": "g1", "nights": 2})))
            .is_ok());

        let errors = validator
            .validate(Some(&json!({"guest_id": null})))
            .unwrap_err();
        assert_eq!(errors, vec!["guest_id is required", "nights is required"]);

        assert!(validator.validate(None).is_err());
    }

    #[test]
    fn test_glob_to_regex() {
        assert_eq!(glob_to_regex("GET:/api/*"), "^GET:/api/[^/]*$");
        assert_eq!(glob_to_regex("GET:/api/**"), "^GET:/api/.*$");
        assert_eq!(glob_to_regex("/v?/items"), "^/v[^/]/items$");

        let re = compile_glob("GET:/items?**").unwrap();
        assert!(re.is_match("GET:/items?a=1&b=2"));
        assert!(!re.is_match("POST:/items?a=1"));
    }
}
