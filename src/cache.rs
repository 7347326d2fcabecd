/// In-process TTL response cache for read-only routes
use anyhow::Result;
use dashmap::DashMap;
use http::HeaderMap;
use log::debug;
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::routes::compile_glob;

/// Cache status for responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Expired,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Expired => "EXPIRED",
        }
    }
}

/// Cached response entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: http::StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }

    /// Seconds since the entry was stored
    pub fn age_secs(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.stored_at).as_secs()
    }
}

/// Response cache bounded by entry count.
///
/// Lookups are lock-free. Inserts are serialized so that `max_entries` is never
/// exceeded; once the cache is full and nothing has expired, each new key scans
/// all entries to find the oldest one.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    write_lock: Mutex<()>,
    config: CacheConfig,
}

impl ResponseCache {
    /// Create a new response cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            write_lock: Mutex::new(()),
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Cache key for a route and its query.
    ///
    /// Parameters are sorted by name (then value) before encoding, so the same
    /// parameters in any order produce the same key.
    pub fn cache_key(route_key: &str, query: &[(String, String)]) -> String {
        if query.is_empty() {
            return route_key.to_string();
        }

        let mut pairs: Vec<(&str, &str)> = query
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        pairs.sort_unstable();

        let canonical = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();

        format!("{}?{}", route_key, canonical)
    }

    /// Get cached response; expired entries are removed and reported as such
    pub fn get(&self, cache_key: &str, now: Instant) -> (Option<CacheEntry>, CacheStatus) {
        let expired = match self.entries.get(cache_key) {
            None => return (None, CacheStatus::Miss),
            Some(entry) if !entry.is_expired(now) => {
                return (Some(entry.clone()), CacheStatus::Hit);
            }
            Some(_) => true,
        };

        if expired {
            // Only remove if nobody stored a fresh value in the meantime
            self.entries
                .remove_if(cache_key, |_, entry| entry.is_expired(now));
            debug!("Cache entry expired: {}", cache_key);
        }
        (None, CacheStatus::Expired)
    }

    /// Store a response; last write wins
    pub fn put(&self, cache_key: String, entry: CacheEntry) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.entries.contains_key(&cache_key) && self.entries.len() >= self.config.max_entries
        {
            self.make_room(entry.stored_at);
        }

        debug!("Cached response with key: {} (TTL: {:?})", cache_key, entry.ttl);
        self.entries.insert(cache_key, entry);
    }

    /// Store a response body stamped at `now`
    pub fn set(
        &self,
        cache_key: String,
        status: http::StatusCode,
        headers: HeaderMap,
        body: Value,
        ttl: Duration,
        now: Instant,
    ) {
        self.put(
            cache_key,
            CacheEntry {
                status,
                headers,
                body,
                stored_at: now,
                ttl,
            },
        );
    }

    /// Purge expired entries, then evict the oldest entry if still at capacity
    fn make_room(&self, now: Instant) {
        if self.purge_expired(now) > 0 && self.entries.len() < self.config.max_entries {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().stored_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            debug!("Evicted oldest cache entry: {}", key);
        }
    }

    /// Remove every expired entry; returns how many were removed
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Remove entries whose key matches a glob pattern, or everything when no
    /// pattern is given; returns how many were removed
    pub fn clear(&self, pattern: Option<&str>) -> Result<usize> {
        let before = self.entries.len();
        match pattern {
            None => self.entries.clear(),
            Some(pattern) => {
                let matcher = compile_glob(pattern)?;
                self.entries.retain(|key, _| !matcher.is_match(key));
            }
        }
        let removed = before.saturating_sub(self.entries.len());
        debug!("Cleared {} cache entries (pattern: {:?})", removed, pattern);
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use serde_json::json;

    fn create_test_cache(max_entries: usize) -> ResponseCache {
        ResponseCache::new(CacheConfig {
            enabled: true,
            max_entries,
            default_ttl: Duration::from_secs(300),
        })
    }

    fn store(cache: &ResponseCache, key: &str, ttl_secs: u64, now: Instant) {
        cache.set(
            key.to_string(),
            StatusCode::OK,
            HeaderMap::new(),
            json!({"key": key}),
            Duration::from_secs(ttl_secs),
            now,
        );
    }

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        let a = ResponseCache::cache_key("GET:/items", &query(&[("a", "1"), ("b", "2")]));
        let b = ResponseCache::cache_key("GET:/items", &query(&[("b", "2"), ("a", "1")]));
        assert_eq!(a, b);
        assert_eq!(a, "GET:/items?a=1&b=2");
    }

    #[test]
    fn test_cache_key_encodes_values() {
        let key = ResponseCache::cache_key("GET:/stays", &query(&[("guest", "Ana María"), ("q", "a&b")]));
        assert_eq!(key, "GET:/stays?guest=Ana+Mar%C3%ADa&q=a%26b");
        assert_eq!(ResponseCache::cache_key("GET:/stays", &[]), "GET:/stays");
    }

    #[test]
    fn test_cache_put_get() {
        let cache = create_test_cache(10);
        let now = Instant::now();
        store(&cache, "k", 2, now);

        let (entry, status) = cache.get("k", now + Duration::from_secs(1));
        assert_eq!(status, CacheStatus::Hit);
        assert_eq!(entry.unwrap().body, json!({"key": "k"}));
    }

    #[test]
    fn test_lazy_expiry() {
        let cache = create_test_cache(10);
        let now = Instant::now();
        store(&cache, "k", 2, now);

        // Exactly at the TTL the entry is still served
        assert_eq!(cache.get("k", now + Duration::from_secs(2)).1, CacheStatus::Hit);

        let (entry, status) = cache.get("k", now + Duration::from_millis(2100));
        assert!(entry.is_none());
        assert_eq!(status, CacheStatus::Expired);
        assert!(cache.is_empty());
        assert_eq!(cache.get("k", now).1, CacheStatus::Miss);
    }

    #[test]
    fn test_capacity_evicts_expired_then_oldest() {
        let cache = create_test_cache(2);
        let now = Instant::now();
        store(&cache, "short", 1, now);
        store(&cache, "long", 60, now + Duration::from_secs(1));

        // "short" has expired and is purged first
        store(&cache, "new", 60, now + Duration::from_secs(5));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("long", now + Duration::from_secs(5)).1, CacheStatus::Hit);

        // Nothing expired: the oldest ("long") goes
        store(&cache, "newer", 60, now + Duration::from_secs(6));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("long", now + Duration::from_secs(6)).1, CacheStatus::Miss);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = create_test_cache(1);
        let now = Instant::now();
        store(&cache, "k", 60, now);
        store(&cache, "k", 60, now + Duration::from_secs(1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_with_pattern() {
        let cache = create_test_cache(10);
        let now = Instant::now();
        store(&cache, "GET:/items?a=1", 60, now);
        store(&cache, "GET:/items", 60, now);
        store(&cache, "GET:/stays", 60, now);

        assert_eq!(cache.clear(Some("GET:/items**")).unwrap(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clear(None).unwrap(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let cache = create_test_cache(10);
        let now = Instant::now();
        store(&cache, "a", 1, now);
        store(&cache, "b", 10, now);
        assert_eq!(cache.purge_expired(now + Duration::from_secs(2)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_inserts_stay_within_bound() {
        let cache = create_test_cache(16);
        let now = Instant::now();

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let cache = &cache;
                scope.spawn(move || {
                    for i in 0..50 {
                        store(cache, &format!("w{}-{}", worker, i), 60, now);
                    }
                });
            }
        });

        assert_eq!(cache.len(), 16);
    }
}
