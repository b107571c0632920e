//! Frontier router: decides whether a chat request stays on the local
//! backend or escalates to an external provider (spec.md §4.9).

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;

use crate::config::FrontierConfig;

fn tier_threshold(config: &FrontierConfig, tier: &str) -> f64 {
    // Sovereign callers get a lower bar to escalate (closer to always-local);
    // free callers need a much lower confidence score before we spend
    // provider quota on their behalf.
    match tier {
        "sovereign" => config.poh_threshold * 1.5,
        "pro" => config.poh_threshold,
        _ => config.poh_threshold * 0.5,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    Local,
    Escalate,
}

/// Per-user-per-hour escalation counter, reset lazily on hour rollover.
struct HourlyUsage {
    hour_key: i64,
    count: u64,
}

/// Tracks the external provider's per-user hourly quota in memory; audit
/// recording of each escalation (provider, model, POH) is the caller's
/// responsibility (spec.md §4.9).
pub struct FrontierRouter {
    config: Arc<FrontierConfig>,
    usage: DashMap<String, HourlyUsage>,
}

impl FrontierRouter {
    pub fn new(config: FrontierConfig) -> Self {
        Self { config: Arc::new(config), usage: DashMap::new() }
    }

    pub fn config(&self) -> &FrontierConfig {
        &self.config
    }

    /// `poh` is the heuristic confidence score produced by the fire-control
    /// pipeline stage; a *lower* score means the local backend is less
    /// likely to answer well, which is what makes escalation attractive.
    pub fn decide(&self, user_id: &str, tier: &str, poh: f64) -> RouteDecision {
        if !self.config.enabled {
            return RouteDecision::Local;
        }
        if poh >= tier_threshold(&self.config, tier) {
            return RouteDecision::Local;
        }
        if !self.has_quota(user_id) {
            return RouteDecision::Local;
        }
        RouteDecision::Escalate
    }

    fn hour_key(now_unix: i64) -> i64 {
        now_unix.div_euclid(3_600)
    }

    fn has_quota(&self, user_id: &str) -> bool {
        let now = Self::hour_key(Utc::now().timestamp());
        match self.usage.get(user_id) {
            Some(entry) if entry.hour_key == now => entry.count < self.config.hourly_quota,
            _ => true,
        }
    }

    /// Record one escalation against the user's hourly bucket. Call only
    /// after actually escalating.
    pub fn record_escalation(&self, user_id: &str) {
        let now = Self::hour_key(Utc::now().timestamp());
        let mut entry = self.usage.entry(user_id.to_string()).or_insert_with(|| HourlyUsage { hour_key: now, count: 0 });
        if entry.hour_key != now {
            entry.hour_key = now;
            entry.count = 0;
        }
        entry.count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FrontierConfig {
        FrontierConfig { enabled: true, provider_url: "https://example.test".into(), poh_threshold: 0.5, hourly_quota: 2 }
    }

    #[test]
    fn disabled_frontier_always_stays_local() {
        let router = FrontierRouter::new(FrontierConfig { enabled: false, ..config() });
        assert_eq!(router.decide("u1", "sovereign", 0.0), RouteDecision::Local);
    }

    #[test]
    fn low_confidence_escalates_within_quota() {
        let router = FrontierRouter::new(config());
        assert_eq!(router.decide("u1", "pro", 0.1), RouteDecision::Escalate);
    }

    #[test]
    fn high_confidence_stays_local() {
        let router = FrontierRouter::new(config());
        assert_eq!(router.decide("u1", "pro", 0.9), RouteDecision::Local);
    }

    #[test]
    fn exhausted_hourly_quota_falls_back_to_local() {
        let router = FrontierRouter::new(config());
        router.record_escalation("u1");
        router.record_escalation("u1");
        assert_eq!(router.decide("u1", "pro", 0.1), RouteDecision::Local);
    }
}
