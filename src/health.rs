/// Health reporting for the gateway
use serde::Serialize;
use std::collections::BTreeMap;

use crate::circuit_breaker::{BreakerStatus, CircuitState};

/// Overall gateway health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Every circuit is closed
    Healthy,
    /// At least one route is shedding load behind an open or half-open circuit
    Degraded,
}

/// Point-in-time health snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthState,
    /// Number of registered routes
    pub registered_routes: usize,
    /// Entries currently held by the response cache
    pub cache_size: usize,
    /// Breaker status per route that has seen traffic
    pub circuit_breaker_status: BTreeMap<String, BreakerStatus>,
    /// Routes with recorded metrics
    pub metrics_count: usize,
}

impl HealthReport {
    /// Derive the overall state from the breaker snapshot
    pub fn new(
        registered_routes: usize,
        cache_size: usize,
        circuit_breaker_status: BTreeMap<String, BreakerStatus>,
        metrics_count: usize,
    ) -> Self {
        let status = if circuit_breaker_status
            .values()
            .any(|breaker| breaker.state != CircuitState::Closed)
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        Self {
            status,
            registered_routes,
            cache_size,
            circuit_breaker_status,
            metrics_count,
        }
    }

    /// Routes whose breaker is not closed
    pub fn open_circuits(&self) -> Vec<&str> {
        self.circuit_breaker_status
            .iter()
            .filter(|(_, breaker)| breaker.state != CircuitState::Closed)
            .map(|(route, _)| route.as_str())
            .collect()
    }

    /// Get the percentage of tracked routes with a closed breaker
    pub fn health_percentage(&self) -> f64 {
        let total = self.circuit_breaker_status.len();
        if total == 0 {
            100.0
        } else {
            let closed = total - self.open_circuits().len();
            (closed as f64 / total as f64) * 100.0
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(state: CircuitState) -> BreakerStatus {
        BreakerStatus {
            state,
            failures: 0,
            successes: 0,
            open_for_ms: None,
        }
    }

    #[test]
    fn test_healthy_without_traffic() {
        let report = HealthReport::new(3, 0, BTreeMap::new(), 0);
        assert!(report.is_healthy());
        assert_eq!(report.health_percentage(), 100.0);
    }

    #[test]
    fn test_open_circuit_degrades() {
        let mut status = BTreeMap::new();
        status.insert("GET:/stays".to_string(), breaker(CircuitState::Closed));
        status.insert("POST:/orders".to_string(), breaker(CircuitState::Open));

        let report = HealthReport::new(2, 4, status, 2);
        assert_eq!(report.status, HealthState::Degraded);
        assert_eq!(report.open_circuits(), vec!["POST:/orders"]);
        assert_eq!(report.health_percentage(), 50.0);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["registeredRoutes"], 2);
        assert_eq!(json["circuitBreakerStatus"]["POST:/orders"]["state"], "open");
    }
}
