//! Admission-hold peek (spec §4.10).
//!
//! A read-only query a caller can run before admitting a request at all:
//! if every candidate model (in the classified tier, and in downgrade tiers
//! when allowed) is currently cooled, the caller should hold admission
//! rather than let the request queue up against models that are all
//! guaranteed to fail. Replays classification the same way `compute_decision`
//! does but never touches the in-flight accountant or penalty window —
//! holding a request doesn't reserve a slot for it.

use serde::{Deserialize, Serialize};

use crate::classify::{classify_heuristic, classify_rules, RequestFeatures};
use crate::config::{RoutingConfig, TierName};
use crate::cooldown::CooldownLedger;
use crate::overrides::OverrideStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldInfo {
    pub tier: TierName,
    pub candidates: Vec<String>,
    pub min_cooldown_ms: u64,
    pub all_cooled: bool,
}

/// Returns `None` when no hold is needed: an override would win, no tier
/// classifies, or at least one candidate is immediately available.
pub fn peek_admission_hold(
    cfg: &RoutingConfig,
    overrides: &OverrideStore,
    requested_model: &str,
    features: &RequestFeatures,
    cooldowns: &CooldownLedger,
) -> Option<HoldInfo> {
    if overrides.get_live(requested_model).is_some() || overrides.get_saved(requested_model).is_some() {
        return None;
    }

    let tier_name = classify_rules(&cfg.rules, features).or_else(|| {
        cfg.heuristic_enabled()
            .then(|| classify_heuristic(&cfg.classifier, features))
            .flatten()
    })?;

    let mut tiers_to_check = vec![tier_name];
    if cfg.failover.allow_tier_downgrade {
        tiers_to_check.extend(
            cfg.failover
                .downgrade_order
                .iter()
                .copied()
                .filter(|t| *t != tier_name),
        );
    }

    let mut candidates = Vec::new();
    let mut cooldowns_ms = Vec::new();

    for tier in tiers_to_check {
        let Some(tier_cfg) = cfg.tier(tier) else { continue };
        for model in &tier_cfg.models {
            let remaining = cooldowns.get_cooldown(&cfg.cooldown, model);
            if remaining == 0 {
                // At least one candidate is available right now — no hold needed.
                return None;
            }
            candidates.push(model.clone());
            cooldowns_ms.push(remaining);
        }
    }

    if candidates.is_empty() {
        return None;
    }

    let min_cooldown_ms = cooldowns_ms.into_iter().min().unwrap_or(0);

    Some(HoldInfo {
        tier: tier_name,
        candidates,
        min_cooldown_ms,
        all_cooled: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientModelPolicy, Rule, RuleMatch, Strategy, TierConfig};
    use serde_json::json;

    fn base_config() -> RoutingConfig {
        let mut cfg = RoutingConfig::default();
        cfg.tiers.insert(
            TierName::Heavy,
            TierConfig {
                models: vec!["a".to_string(), "b".to_string()],
                strategy: Strategy::Quality,
                label: None,
                client_model_policy: ClientModelPolicy::RuleMatchOnly,
            },
        );
        cfg.rules = vec![Rule {
            match_: RuleMatch { model: Some("*".into()), ..Default::default() },
            tier: TierName::Heavy,
        }];
        cfg
    }

    #[test]
    fn no_hold_needed_when_an_override_would_win() {
        let cfg = base_config();
        let overrides = OverrideStore::new(10);
        overrides.set_override("claude-3", "pinned").unwrap();
        let cooldowns = CooldownLedger::new();
        let features = crate::classify::extract_features(&json!({ "model": "claude-3" }));
        assert!(peek_admission_hold(&cfg, &overrides, "claude-3", &features, &cooldowns).is_none());
    }

    #[test]
    fn no_hold_needed_when_a_candidate_is_available() {
        let cfg = base_config();
        let overrides = OverrideStore::new(10);
        let cooldowns = CooldownLedger::new();
        let features = crate::classify::extract_features(&json!({ "model": "claude-3" }));
        assert!(peek_admission_hold(&cfg, &overrides, "claude-3", &features, &cooldowns).is_none());
    }

    #[test]
    fn hold_reported_when_every_candidate_is_cooled() {
        let cfg = base_config();
        let overrides = OverrideStore::new(10);
        let cooldowns = CooldownLedger::new();
        cooldowns.record_cooldown(&cfg.cooldown, "a", 5_000, false);
        cooldowns.record_cooldown(&cfg.cooldown, "b", 9_000, false);
        let features = crate::classify::extract_features(&json!({ "model": "claude-3" }));
        let hold = peek_admission_hold(&cfg, &overrides, "claude-3", &features, &cooldowns).unwrap();
        assert_eq!(hold.tier, TierName::Heavy);
        assert!(hold.all_cooled);
        assert!(hold.min_cooldown_ms <= 5_000);
    }

    #[test]
    fn downgrade_tier_candidates_are_included_when_allowed() {
        let mut cfg = base_config();
        cfg.tiers.insert(
            TierName::Medium,
            TierConfig {
                models: vec!["c".to_string()],
                strategy: Strategy::Quality,
                label: None,
                client_model_policy: ClientModelPolicy::RuleMatchOnly,
            },
        );
        cfg.failover.allow_tier_downgrade = true;
        cfg.failover.downgrade_order = vec![TierName::Medium];
        let overrides = OverrideStore::new(10);
        let cooldowns = CooldownLedger::new();
        cooldowns.record_cooldown(&cfg.cooldown, "a", 5_000, false);
        cooldowns.record_cooldown(&cfg.cooldown, "b", 5_000, false);
        cooldowns.record_cooldown(&cfg.cooldown, "c", 1_000, false);
        let features = crate::classify::extract_features(&json!({ "model": "claude-3" }));
        let hold = peek_admission_hold(&cfg, &overrides, "claude-3", &features, &cooldowns).unwrap();
        assert!(hold.candidates.contains(&"c".to_string()));
        assert_eq!(hold.min_cooldown_ms.min(1_000), hold.min_cooldown_ms);
    }

    #[test]
    fn no_hold_when_no_tier_classifies() {
        let mut cfg = base_config();
        cfg.rules = Vec::new();
        let overrides = OverrideStore::new(10);
        let cooldowns = CooldownLedger::new();
        let features = crate::classify::extract_features(&json!({ "model": "claude-3" }));
        assert!(peek_admission_hold(&cfg, &overrides, "claude-3", &features, &cooldowns).is_none());
    }
}
