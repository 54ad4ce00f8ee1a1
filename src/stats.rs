//! Bounded-cardinality stats registry (ambient, supplemented).
//!
//! `getStats()` (spec §6) needs something concrete to return. Counters are
//! keyed by `(family, label)` where every label a caller ever passes comes
//! from a fixed enum's `Display` impl (tier, source, strategy, fallback
//! reason, upgrade reason, drift reason) — never from request content — so
//! cardinality is bounded by construction, never by request volume.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct StatsRegistry {
    counters: DashMap<(&'static str, String), AtomicU64>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, family: &'static str, label: impl Into<String>) {
        self.counters
            .entry((family, label.into()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, family: &'static str, label: &str) -> u64 {
        self.counters
            .get(&(family, label.to_string()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Full snapshot for `getStats()`, keyed as `"family:label"`.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters
            .iter()
            .map(|r| {
                let (family, label) = r.key();
                (format!("{family}:{label}"), r.value().load(Ordering::Relaxed))
            })
            .collect()
    }
}

pub const FAMILY_TIER: &str = "tier";
pub const FAMILY_SOURCE: &str = "source";
pub const FAMILY_STRATEGY: &str = "strategy";
pub const FAMILY_FALLBACK_REASON: &str = "fallback_reason";
pub const FAMILY_UPGRADE_REASON: &str = "upgrade_reason";
pub const FAMILY_DRIFT_REASON: &str = "drift_reason";
pub const FAMILY_TIER_DOWNGRADE_ROUTE: &str = "tier_downgrade_route";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = StatsRegistry::new();
        assert_eq!(stats.get(FAMILY_TIER, "heavy"), 0);
    }

    #[test]
    fn incr_accumulates_per_label() {
        let stats = StatsRegistry::new();
        stats.incr(FAMILY_TIER, "heavy");
        stats.incr(FAMILY_TIER, "heavy");
        stats.incr(FAMILY_TIER, "light");
        assert_eq!(stats.get(FAMILY_TIER, "heavy"), 2);
        assert_eq!(stats.get(FAMILY_TIER, "light"), 1);
    }

    #[test]
    fn snapshot_includes_family_prefix() {
        let stats = StatsRegistry::new();
        stats.incr(FAMILY_SOURCE, "classifier");
        let snap = stats.snapshot();
        assert_eq!(snap.get("source:classifier"), Some(&1));
    }
}
