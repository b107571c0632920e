//! Aggregated health state for readiness checks.
//!
//! Replaces the teacher's `HealthMonitorAgent` (an acton-reactive actor
//! subscribing to pool-health broadcasts) with a plain `DashMap` — this
//! gateway has no connection pools to broadcast updates from, only a
//! handful of named components (backend, audit storage, sandbox sidecar,
//! frontier provider) that call `set()` directly after a probe.

use dashmap::DashMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    #[default]
    Unhealthy,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct AggregatedHealthResponse {
    pub overall_healthy: bool,
    pub components: Vec<ComponentHealth>,
}

#[derive(Default)]
pub struct HealthRegistry {
    components: DashMap<String, ComponentHealth>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<String>, status: HealthStatus, message: impl Into<String>) {
        let name = name.into();
        self.components.insert(name.clone(), ComponentHealth { name, status, message: message.into() });
    }

    pub fn aggregate(&self) -> AggregatedHealthResponse {
        let components: Vec<ComponentHealth> = self.components.iter().map(|e| e.value().clone()).collect();
        let overall_healthy = components.iter().all(|c| c.status == HealthStatus::Healthy);
        AggregatedHealthResponse { overall_healthy, components }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        assert!(registry.aggregate().overall_healthy);
    }

    #[test]
    fn one_unhealthy_component_fails_aggregate() {
        let registry = HealthRegistry::new();
        registry.set("backend", HealthStatus::Healthy, "ok");
        registry.set("sandbox", HealthStatus::Unhealthy, "sidecar unreachable");

        let aggregated = registry.aggregate();
        assert!(!aggregated.overall_healthy);
        assert_eq!(aggregated.components.len(), 2);
    }
}
