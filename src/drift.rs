//! Drift detector (spec §4.9).
//!
//! Compares the router's own view of a model (its cooldown ledger entry,
//! its in-flight count) against the key manager's reported view of the same
//! model and surfaces any disagreement as a typed, labeled event — never a
//! request failure, always a `warn!`. A bounded ring buffer plus a counter
//! keyed off a fixed enum, so cardinality never grows with request volume.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::TierName;
use crate::stats::{StatsRegistry, FAMILY_DRIFT_REASON};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftReason {
    RouterAvailableKmExcluded,
    KmAvailableRouterCooled,
    ConcurrencyMismatch,
    CooldownMismatch,
}

impl std::fmt::Display for DriftReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RouterAvailableKmExcluded => "router_available_km_excluded",
            Self::KmAvailableRouterCooled => "km_available_router_cooled",
            Self::ConcurrencyMismatch => "concurrency_mismatch",
            Self::CooldownMismatch => "cooldown_mismatch",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftEvent {
    pub tier: Option<TierName>,
    pub model: String,
    pub reason: DriftReason,
}

/// The router's own view of a model, as it would be checked against the
/// key manager's report.
#[derive(Debug, Clone, Copy)]
pub struct RouterView {
    pub available: bool,
    pub cooldown_ms_remaining: u64,
    pub in_flight: u32,
}

/// The key manager's reported view of the same model.
#[derive(Debug, Clone, Copy)]
pub struct KeyManagerView {
    pub available: bool,
    pub in_flight: u32,
}

const CONCURRENCY_MISMATCH_THRESHOLD: i64 = 5;
const DEFAULT_RING_CAPACITY: usize = 500;

/// Bounded in-memory ring of drift events plus the `{tier,reason}` counters
/// spec §4.9 calls for. A `Mutex<VecDeque<_>>`, not a `DashMap`: drift events
/// are rare (one per mismatch, not per request) and must preserve insertion
/// order for the ring-eviction policy, which a concurrent map can't give us
/// for free.
pub struct DriftDetector {
    events: Mutex<VecDeque<DriftEvent>>,
    capacity: usize,
}

impl DriftDetector {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Compare one model's router view against the key manager's view and
    /// record every reason that applies — more than one can fire at once
    /// (e.g. a concurrency mismatch and a cooldown mismatch on the same model).
    pub fn compare(
        &self,
        stats: &StatsRegistry,
        tier: Option<TierName>,
        model: &str,
        router: RouterView,
        km: KeyManagerView,
    ) -> Vec<DriftEvent> {
        let mut fired = Vec::new();

        if router.available && !km.available {
            fired.push(DriftReason::RouterAvailableKmExcluded);
        }

        if km.available && !router.available && router.cooldown_ms_remaining == 0 {
            fired.push(DriftReason::KmAvailableRouterCooled);
        }

        if (router.in_flight as i64 - km.in_flight as i64).abs() > CONCURRENCY_MISMATCH_THRESHOLD {
            fired.push(DriftReason::ConcurrencyMismatch);
        }

        if router.available != km.available && router.cooldown_ms_remaining > 0 {
            fired.push(DriftReason::CooldownMismatch);
        }

        for reason in &fired {
            let event = DriftEvent { tier, model: model.to_string(), reason: *reason };
            tracing::warn!(tier = ?tier, model, reason = %reason, "routing drift detected");
            stats.incr(FAMILY_DRIFT_REASON, format!("{}:{}", tier_label(tier), reason));
            self.push(event);
        }

        fired
            .into_iter()
            .map(|reason| DriftEvent { tier, model: model.to_string(), reason })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<DriftEvent> {
        self.events.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    fn push(&self, event: DriftEvent) {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

fn tier_label(tier: Option<TierName>) -> String {
    tier.map(|t| t.to_string()).unwrap_or_else(|| "none".to_string())
}
