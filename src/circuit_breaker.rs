//! Per-route circuit breakers.
//!
//! # State Transitions
//! ```text
//! Closed    → Open:      failures / total > threshold once total ≥ min_samples
//! Open      → Half-Open: first check after the cooldown elapsed (counters kept)
//! Half-Open → Closed:    the single trial succeeds (counters reset)
//! Half-Open → Open:      the trial fails (cooldown restarts)
//! ```
//!
//! While the trial is in flight, further checks on the route are rejected. A
//! trial that never reports back is abandoned after one cooldown period.

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::clock::ceil_secs;
use crate::config::CircuitBreakerConfig;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Rejecting calls until the cooldown elapses
    Open,
    /// Admitting a single trial call
    HalfOpen,
}

/// Result of consulting a breaker before invoking the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerDecision {
    pub is_open: bool,
    pub retry_after_secs: u64,
}

impl BreakerDecision {
    const ALLOW: Self = Self {
        is_open: false,
        retry_after_secs: 0,
    };
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u64,
    successes: u64,
    /// Set whenever `state` is `Open`
    opened_at: Option<Instant>,
    /// When the outstanding half-open trial was admitted
    trial_started: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
            trial_started: None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_started = None;
    }
}

/// Point-in-time view of one route's breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub failures: u64,
    pub successes: u64,
    /// Milliseconds since the breaker last opened
    pub open_for_ms: Option<u64>,
}

/// Breakers for every route, created lazily on first use
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<Mutex<BreakerState>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    fn breaker(&self, route_key: &str) -> Arc<Mutex<BreakerState>> {
        if let Some(existing) = self.breakers.get(route_key) {
            return existing.clone();
        }
        self.breakers
            .entry(route_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BreakerState::new())))
            .clone()
    }

    /// Decide whether a call to `route_key` may proceed
    pub fn check_state(&self, route_key: &str, now: Instant) -> BreakerDecision {
        let breaker = self.breaker(route_key);
        let mut breaker = breaker.lock().unwrap_or_else(|e| e.into_inner());

        let (state, trial_started) = (breaker.state, breaker.trial_started);
        match state {
            CircuitState::Closed => BreakerDecision::ALLOW,
            CircuitState::Open => {
                let opened_at = breaker.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < self.config.cooldown {
                    BreakerDecision {
                        is_open: true,
                        retry_after_secs: ceil_secs(self.config.cooldown - elapsed).max(1),
                    }
                } else {
                    info!("Circuit breaker for {} half-open, admitting trial call", route_key);
                    breaker.state = CircuitState::HalfOpen;
                    breaker.trial_started = Some(now);
                    BreakerDecision::ALLOW
                }
            }
            CircuitState::HalfOpen => match trial_started {
                Some(started) if now.saturating_duration_since(started) < self.config.cooldown => {
                    BreakerDecision {
                        is_open: true,
                        retry_after_secs: 1,
                    }
                }
                _ => {
                    breaker.trial_started = Some(now);
                    BreakerDecision::ALLOW
                }
            },
        }
    }

    /// Record a completed call
    pub fn record_success(&self, route_key: &str) {
        let breaker = self.breaker(route_key);
        let mut breaker = breaker.lock().unwrap_or_else(|e| e.into_inner());

        let state = breaker.state;
        match state {
            CircuitState::HalfOpen => {
                info!("Circuit breaker for {} closed after successful trial", route_key);
                *breaker = BreakerState::new();
            }
            CircuitState::Closed => breaker.successes += 1,
            // A call admitted before the breaker opened; the open state stands
            CircuitState::Open => {}
        }
    }

    /// Record a failed or timed-out call
    pub fn record_failure(&self, route_key: &str, now: Instant) {
        let breaker = self.breaker(route_key);
        let mut breaker = breaker.lock().unwrap_or_else(|e| e.into_inner());

        breaker.failures += 1;

        let state = breaker.state;
        match state {
            CircuitState::Closed => {
                let total = breaker.failures + breaker.successes;
                let failure_percent = breaker.failures as f64 / total as f64 * 100.0;
                if total >= self.config.min_samples as u64
                    && failure_percent > self.config.threshold_percent
                {
                    warn!(
                        "Circuit breaker for {} opened ({}/{} failures, {:.1}%)",
                        route_key, breaker.failures, total, failure_percent
                    );
                    breaker.open(now);
                } else {
                    debug!(
                        "Recorded failure for {} ({}/{} failures)",
                        route_key, breaker.failures, total
                    );
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                warn!("Circuit breaker for {} reopened", route_key);
                breaker.open(now);
            }
        }
    }

    /// Give back a half-open trial that ended without reaching the handler
    pub fn release_trial(&self, route_key: &str) {
        let breaker = self.breaker(route_key);
        let mut breaker = breaker.lock().unwrap_or_else(|e| e.into_inner());
        if breaker.state == CircuitState::HalfOpen {
            breaker.trial_started = None;
        }
    }

    /// Current state of one route's breaker, if it has been used
    pub fn state(&self, route_key: &str) -> Option<CircuitState> {
        let breaker = self.breakers.get(route_key)?.clone();
        let state = breaker.lock().unwrap_or_else(|e| e.into_inner()).state;
        Some(state)
    }

    /// Status of every breaker, ordered by route key
    pub fn status(&self, now: Instant) -> BTreeMap<String, BreakerStatus> {
        let handles: Vec<(String, Arc<Mutex<BreakerState>>)> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        handles
            .into_iter()
            .map(|(key, breaker)| {
                let breaker = breaker.lock().unwrap_or_else(|e| e.into_inner());
                let status = BreakerStatus {
                    state: breaker.state,
                    failures: breaker.failures,
                    successes: breaker.successes,
                    open_for_ms: breaker
                        .opened_at
                        .map(|at| now.saturating_duration_since(at).as_millis() as u64),
                };
                (key, status)
            })
            .collect()
    }

    /// Return every breaker to the closed state
    pub fn reset(&self) {
        self.breakers.clear();
        info!("All circuit breakers reset");
    }
}
