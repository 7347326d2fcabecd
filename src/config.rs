/// Configuration management for the gateway
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration structure for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Largest accepted request payload in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size_bytes: usize,
    /// Handler deadline used when a route does not set its own
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Response caching configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Token verification configuration
    #[serde(default)]
    pub auth: AuthConfig,
    /// Interval of the background eviction sweep
    #[serde(with = "humantime_serde", default = "default_maintenance_interval")]
    pub maintenance_interval: Duration,
    /// Built-in global middlewares
    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

/// Response caching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable response caching
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum number of entries in cache
    #[serde(default = "default_max_cache_entries")]
    pub max_entries: usize,
    /// Default TTL for cached responses
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub default_ttl: Duration,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Enable rate limiting
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests allowed per window for routes without their own limit
    #[serde(default = "default_rate_limit_max")]
    pub default_max: u32,
    /// Window length for routes without their own limit
    #[serde(with = "humantime_serde", default = "default_rate_limit_window")]
    pub default_window: Duration,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaking
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Failure percentage above which the breaker opens
    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: f64,
    /// How long an open breaker rejects calls before allowing a trial
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,
    /// Minimum number of outcomes before the failure ratio is evaluated
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,
}

/// Token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret handed to the token verifier
    #[serde(default)]
    pub secret: String,
    /// Header carrying the token
    #[serde(default = "default_auth_header")]
    pub header: String,
}

/// Built-in middleware configuration; absent sections are not installed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// CORS configuration
    #[serde(default)]
    pub cors: Option<CorsConfig>,
    /// Request/response header modification
    #[serde(default)]
    pub transform: Option<TransformConfig>,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins; `*` allows any
    pub allowed_origins: Vec<String>,
    /// Allowed methods
    #[serde(default = "default_cors_methods")]
    pub allowed_methods: Vec<String>,
    /// Allowed headers
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    /// Maximum age for preflight requests
    #[serde(default, with = "humantime_serde")]
    pub max_age: Option<Duration>,
}

/// Request/response transformation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Request header modifications
    #[serde(default)]
    pub request_headers: Option<HeaderTransformConfig>,
    /// Response header modifications
    #[serde(default)]
    pub response_headers: Option<HeaderTransformConfig>,
}

/// Header transformation rules, applied as add, then set, then remove
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderTransformConfig {
    /// Headers to add when not already present
    #[serde(default)]
    pub add: BTreeMap<String, String>,
    /// Headers to set (overwrite)
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    /// Headers to remove
    #[serde(default)]
    pub remove: Vec<String>,
}

impl GatewayConfig {
    /// Load configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config file: {}", path))?
        } else if path.ends_with(".toml") {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config file: {}", path))?
        } else if path.ends_with(".json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config file: {}", path))?
        } else {
            return Err(anyhow::anyhow!(
                "Unsupported config file format. Supported formats: .yaml, .yml, .toml, .json"
            ));
        };

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_request_size_bytes == 0 {
            return Err(anyhow::anyhow!("max_request_size_bytes must be positive"));
        }

        if self.request_timeout.is_zero() {
            return Err(anyhow::anyhow!("request_timeout must be positive"));
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(anyhow::anyhow!(
                "cache.max_entries must be positive when caching is enabled"
            ));
        }

        if self.rate_limiting.default_max == 0 || self.rate_limiting.default_window.is_zero() {
            return Err(anyhow::anyhow!(
                "rate_limiting.default_max and rate_limiting.default_window must be positive"
            ));
        }

        let breaker = &self.circuit_breaker;
        if !(0.0..100.0).contains(&breaker.threshold_percent) {
            return Err(anyhow::anyhow!(
                "circuit_breaker.threshold_percent must be within [0, 100), got {}",
                breaker.threshold_percent
            ));
        }
        if breaker.min_samples == 0 {
            return Err(anyhow::anyhow!("circuit_breaker.min_samples must be positive"));
        }

        if self.maintenance_interval.is_zero() {
            return Err(anyhow::anyhow!("maintenance_interval must be positive"));
        }

        if let Some(cors) = &self.middleware.cors {
            if cors.allowed_origins.is_empty() {
                return Err(anyhow::anyhow!(
                    "middleware.cors.allowed_origins must list at least one origin"
                ));
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_request_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_cache_entries() -> usize {
    10000
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

fn default_rate_limit_max() -> u32 {
    100
}

fn default_rate_limit_window() -> Duration {
    Duration::from_secs(60)
}

fn default_threshold_percent() -> f64 {
    50.0
}

fn default_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_min_samples() -> u32 {
    5
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_request_size_bytes: default_max_request_size(),
            request_timeout: default_request_timeout(),
            cache: CacheConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            auth: AuthConfig::default(),
            maintenance_interval: default_maintenance_interval(),
            middleware: MiddlewareConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_cache_entries(),
            default_ttl: default_cache_ttl(),
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max: default_rate_limit_max(),
            default_window: default_rate_limit_window(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_percent: default_threshold_percent(),
            cooldown: default_cooldown(),
            min_samples: default_min_samples(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            header: default_auth_header(),
        }
    }
}
