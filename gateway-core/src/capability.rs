//! Capability router: resolves a per-request power dial + caller tier to an
//! effective generation policy (spec.md §4.5).

use serde::{Deserialize, Serialize};

use crate::config::{CapabilityConfig, PowerProfile};

/// Ordinal rank for a tier name so ceilings and thresholds can compare tiers
/// without a full `Ord` impl on the string type itself.
pub fn tier_rank(tier: &str) -> u8 {
    match tier {
        "sovereign" => 2,
        "pro" => 1,
        _ => 0,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub profile: String,
    pub context_tokens: u32,
    pub temperature: f32,
    pub reasoning: bool,
    pub speculative: bool,
    pub retrieval_top_k: u32,
    pub history_turns: u32,
}

/// The summary fields the client is allowed to see (spec.md §4.5: "the
/// client receives only the summary fields it needs to display").
#[derive(Debug, Clone, Serialize)]
pub struct CapabilitySummary {
    pub profile: String,
    pub downgraded: bool,
    pub downgrade_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedCapability {
    pub policy: EffectivePolicy,
    pub summary: CapabilitySummary,
}

/// Advisory hints from the client device; can only further downgrade.
#[derive(Debug, Clone, Default)]
pub struct DeviceHints {
    pub max_context_tokens: Option<u32>,
}

/// Infrastructure signals (GPU thermal state, backend health) that may
/// force additional downgrades regardless of caller tier or device hints.
#[derive(Debug, Clone, Default)]
pub struct InfraSignals {
    pub thermal_throttled: bool,
    pub backend_degraded: bool,
}

pub struct CapabilityRouter<'a> {
    config: &'a CapabilityConfig,
}

impl<'a> CapabilityRouter<'a> {
    pub fn new(config: &'a CapabilityConfig) -> Self {
        Self { config }
    }

    /// Resolve `requested_profile` against `tier`'s ceiling, then apply
    /// device hints and infra signals as further-only downgrades. Requests
    /// above the tier ceiling are silently downgraded; the caller is
    /// expected to record `requested_profile` in the audit meta for
    /// observability (spec.md §4.5).
    pub fn resolve(
        &self,
        requested_profile: &str,
        tier: &str,
        device: &DeviceHints,
        infra: &InfraSignals,
    ) -> ResolvedCapability {
        let mut downgraded = false;
        let mut reason = None;

        let mut profile_name = requested_profile.to_string();
        let mut profile = self.lookup(&profile_name);

        if profile.is_none() || !self.within_tier_ceiling(&profile_name, tier) {
            let fallback = self.highest_profile_for_tier(tier);
            if fallback != profile_name {
                downgraded = true;
                reason = Some(format!("profile '{requested_profile}' exceeds tier '{tier}' ceiling"));
            }
            profile_name = fallback;
            profile = self.lookup(&profile_name);
        }

        let mut resolved = profile.cloned().unwrap_or_else(default_instant_profile);

        if let Some(max_tokens) = device.max_context_tokens {
            if max_tokens < resolved.context_tokens {
                resolved.context_tokens = max_tokens;
                downgraded = true;
                reason.get_or_insert_with(|| "device context limit".to_string());
            }
        }

        if infra.thermal_throttled || infra.backend_degraded {
            resolved.speculative = false;
            resolved.reasoning = resolved.reasoning && !infra.thermal_throttled;
            downgraded = true;
            reason.get_or_insert_with(|| "infrastructure signal forced downgrade".to_string());
        }

        ResolvedCapability {
            policy: EffectivePolicy {
                profile: profile_name.clone(),
                context_tokens: resolved.context_tokens,
                temperature: resolved.temperature,
                reasoning: resolved.reasoning,
                speculative: resolved.speculative,
                retrieval_top_k: resolved.retrieval_top_k,
                history_turns: resolved.history_turns,
            },
            summary: CapabilitySummary { profile: profile_name, downgraded, downgrade_reason: reason },
        }
    }

    fn lookup(&self, name: &str) -> Option<&PowerProfile> {
        self.config.profiles.get(name)
    }

    fn within_tier_ceiling(&self, name: &str, tier: &str) -> bool {
        match self.config.profiles.get(name) {
            Some(profile) => tier_rank(tier) >= tier_rank(&profile.min_tier),
            None => false,
        }
    }

    /// The highest-ceiling profile this tier is entitled to.
    fn highest_profile_for_tier(&self, tier: &str) -> String {
        self.config
            .profiles
            .iter()
            .filter(|(_, p)| tier_rank(tier) >= tier_rank(&p.min_tier))
            .max_by_key(|(_, p)| tier_rank(&p.min_tier))
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| "instant".to_string())
    }
}

fn default_instant_profile() -> PowerProfile {
    PowerProfile {
        context_tokens: 2_048,
        temperature: 0.3,
        reasoning: false,
        speculative: false,
        retrieval_top_k: 3,
        history_turns: 4,
        min_tier: "free".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_tier_never_gets_deep_profile() {
        let config = CapabilityConfig::default();
        let router = CapabilityRouter::new(&config);
        let resolved = router.resolve("deep", "free", &DeviceHints::default(), &InfraSignals::default());
        assert!(resolved.summary.downgraded);
        assert_ne!(resolved.summary.profile, "deep");
    }

    #[test]
    fn sovereign_tier_gets_requested_profile() {
        let config = CapabilityConfig::default();
        let router = CapabilityRouter::new(&config);
        let resolved = router.resolve("balanced", "sovereign", &DeviceHints::default(), &InfraSignals::default());
        assert!(!resolved.summary.downgraded);
        assert_eq!(resolved.summary.profile, "balanced");
    }

    #[test]
    fn thermal_throttle_disables_speculative() {
        let config = CapabilityConfig::default();
        let router = CapabilityRouter::new(&config);
        let infra = InfraSignals { thermal_throttled: true, backend_degraded: false };
        let resolved = router.resolve("balanced", "sovereign", &DeviceHints::default(), &infra);
        assert!(!resolved.policy.speculative);
        assert!(resolved.summary.downgraded);
    }

    #[test]
    fn device_hint_caps_context_but_never_raises_it() {
        let config = CapabilityConfig::default();
        let router = CapabilityRouter::new(&config);
        let hints = DeviceHints { max_context_tokens: Some(512) };
        let resolved = router.resolve("instant", "sovereign", &hints, &InfraSignals::default());
        assert_eq!(resolved.policy.context_tokens, 512);
    }
}
