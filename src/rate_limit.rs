/// Sliding-window-log rate limiting keyed by (route, client)
use dashmap::DashMap;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::clock::ceil_secs;
use crate::routes::RateLimitRule;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Whole seconds until a slot frees up; zero when allowed
    pub retry_after_secs: u64,
    /// Slots left in the current window after this check
    pub remaining: u32,
}

/// Timestamps of admitted requests inside the window, oldest first
#[derive(Debug)]
struct Bucket {
    window: Duration,
    timestamps: VecDeque<Instant>,
    /// Set once the sweep has unlinked this bucket from the map
    retired: bool,
}

impl Bucket {
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.timestamps
            .back()
            .map_or(true, |&newest| now.saturating_duration_since(newest) >= self.window)
    }
}

/// Per-key sliding window limiter.
///
/// Buckets live in a sharded map; each bucket has its own mutex so that checks
/// on different keys never wait on each other and checks on one key apply in
/// arrival order.
#[derive(Default)]
pub struct SlidingWindowLimiter {
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket key for a route and client
    pub fn bucket_key(route_key: &str, client_id: &str) -> String {
        format!("{}|{}", route_key, client_id)
    }

    /// Admit or reject one request, recording it when admitted
    pub fn check_and_record(
        &self,
        route_key: &str,
        client_id: &str,
        rule: RateLimitRule,
        now: Instant,
    ) -> RateDecision {
        let key = Self::bucket_key(route_key, client_id);

        loop {
            // Clone the bucket handle so the shard lock is released before locking the bucket
            let handle = self
                .buckets
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Bucket {
                        window: rule.window,
                        timestamps: VecDeque::new(),
                        retired: false,
                    }))
                })
                .clone();

            let mut bucket = handle.lock().unwrap_or_else(|e| e.into_inner());
            if bucket.retired {
                // Evicted between lookup and lock; the map holds a fresh bucket now
                continue;
            }
            return Self::admit(&key, &mut bucket, rule, now);
        }
    }

    fn admit(key: &str, bucket: &mut Bucket, rule: RateLimitRule, now: Instant) -> RateDecision {
        // A re-registered route may change its window
        bucket.window = rule.window;
        bucket.prune(now);

        let count = bucket.timestamps.len() as u32;
        if count >= rule.max {
            let retry_after_secs = bucket
                .timestamps
                .front()
                .map(|&oldest| {
                    let free_at = oldest + rule.window;
                    ceil_secs(free_at.saturating_duration_since(now))
                })
                .unwrap_or(1)
                .max(1);

            warn!(
                "Rate limit exceeded for key: {} ({} in {:?}), retry after {}s",
                key, count, rule.window, retry_after_secs
            );

            return RateDecision {
                allowed: false,
                retry_after_secs,
                remaining: 0,
            };
        }

        bucket.timestamps.push_back(now);
        debug!("Rate limit passed for key: {}", key);

        RateDecision {
            allowed: true,
            retry_after_secs: 0,
            remaining: rule.max - count - 1,
        }
    }

    /// Drop buckets with no timestamps inside their window; returns how many were removed
    pub fn evict_idle(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| match bucket.try_lock() {
            Ok(mut bucket) => {
                if bucket.is_idle(now) {
                    bucket.retired = true;
                    false
                } else {
                    true
                }
            }
            // Busy buckets are in use; keep them
            Err(_) => true,
        });
        let evicted = before.saturating_sub(self.buckets.len());
        if evicted > 0 {
            debug!("Evicted {} idle rate limit buckets", evicted);
        }
        evicted
    }

    /// Number of live buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(max: u32, window_ms: u64) -> RateLimitRule {
        RateLimitRule {
            max,
            window: Duration::from_millis(window_ms),
        }
    }

    #[test]
    fn test_rejects_request_over_max() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();
        let rule = rule(3, 1000);

        for i in 0..3 {
            let decision = limiter.check_and_record("GET:/items", "c1", rule, start);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 2 - i);
        }

        let rejected = limiter.check_and_record(
            "GET:/items",
            "c1",
            rule,
            start + Duration::from_millis(200),
        );
        assert!(!rejected.allowed);
        assert!(rejected.retry_after_secs > 0 && rejected.retry_after_secs <= 1);
    }

    #[test]
    fn test_allows_again_after_retry_after() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();
        let rule = rule(2, 10_000);

        limiter.check_and_record("r", "c", rule, start);
        limiter.check_and_record("r", "c", rule, start + Duration::from_secs(4));
        let rejected = limiter.check_and_record("r", "c", rule, start + Duration::from_millis(4500));
        assert!(!rejected.allowed);
        // Oldest entry frees up at 10s; 5.5s away rounds up to 6
        assert_eq!(rejected.retry_after_secs, 6);

        let later = start + Duration::from_millis(4500) + Duration::from_secs(6);
        assert!(limiter.check_and_record("r", "c", rule, later).allowed);
    }

    #[test]
    fn test_rejected_requests_are_not_recorded() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();
        let rule = rule(1, 1000);

        assert!(limiter.check_and_record("r", "c", rule, start).allowed);
        for ms in [100, 300, 900] {
            assert!(!limiter.check_and_record("r", "c", rule, start + Duration::from_millis(ms)).allowed);
        }
        // Only the first request occupies the window
        assert!(limiter.check_and_record("r", "c", rule, start + Duration::from_millis(1000)).allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = SlidingWindowLimiter::new();
        let now = Instant::now();
        let rule = rule(1, 1000);

        assert!(limiter.check_and_record("GET:/items", "alice", rule, now).allowed);
        assert!(limiter.check_and_record("GET:/items", "bob", rule, now).allowed);
        assert!(limiter.check_and_record("GET:/stays", "alice", rule, now).allowed);
        assert!(!limiter.check_and_record("GET:/items", "alice", rule, now).allowed);
        assert_eq!(limiter.bucket_count(), 3);
    }

    #[test]
    fn test_evict_idle_buckets() {
        let limiter = SlidingWindowLimiter::new();
        let start = Instant::now();

        limiter.check_and_record("r", "old", rule(5, 1000), start);
        limiter.check_and_record("r", "fresh", rule(5, 1000), start + Duration::from_millis(900));

        let evicted = limiter.evict_idle(start + Duration::from_millis(1500));
        assert_eq!(evicted, 1);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn test_concurrent_checks_never_exceed_max() {
        let limiter = Arc::new(SlidingWindowLimiter::new());
        let now = Instant::now();
        let rule = rule(50, 60_000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check_and_record("r", "c", rule, now).allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }
}
