//! Top-level `Router` façade — the external interfaces of spec §6.
//!
//! Owns every piece of process-lifetime shared state (cooldown ledger,
//! penalty window, in-flight accountant, override store, stats, model
//! metadata cache, drift ring) behind one struct, with shared state swapped
//! wholesale under a lock held only for an `Arc::clone`. Generic over the
//! injected [`ModelDiscovery`] implementation rather than boxed as a trait
//! object — the router never needs to erase it, and a generic avoids pulling
//! in `async_trait` for a trait that's only ever used concretely.

use std::{
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use serde_json::Value;

use crate::admission::{self, HoldInfo};
use crate::audit::{AuditEvent, AuditSink, NullSink};
use crate::classify::{self, RequestFeatures};
use crate::config::{self, NormalizeOutcome, RoutingConfig, ValidateOutcome};
use crate::cooldown::{CooldownLedger, CooldownSnapshotEntry};
use crate::decision::{self, CommitMeta, Decision};
use crate::discovery::{DiscoveryCache, ModelDiscovery, ModelMeta};
use crate::drift::{DriftDetector, DriftEvent, KeyManagerView, RouterView};
use crate::error::{RouterError, RouterResult};
use crate::inflight::InFlightAccountant;
use crate::overrides::OverrideStore;
use crate::penalty::PenaltyWindow;
use crate::persist::FilePersistence;
use crate::trace::{self, PoolSnapshot, Trace};

/// Constructor options (spec §9 "Environment"): injected once at startup,
/// never part of the hot-swappable `RoutingConfig`.
pub struct RouterOptions {
    pub max_overrides: usize,
    pub metadata_ttl: Duration,
    pub warmup_duration_ms: u64,
    pub concurrency_multiplier: f64,
    /// Cap used when a model's metadata hasn't been warmed into the
    /// discovery cache yet — a model never offered to the pool selector with
    /// an unbounded slot count just because discovery hasn't caught up.
    pub default_max_concurrency: u32,
    pub drift_ring_capacity: usize,
    pub persistence: Option<FilePersistence>,
    /// Durable record of tier downgrades, drift, and persistence failures.
    /// Defaults to [`NullSink`] — `tracing` already carries these at `warn!`
    /// regardless, so an audit sink is only needed when a caller wants them
    /// somewhere `tracing`'s subscriber doesn't reach.
    pub audit: Option<Box<dyn AuditSink>>,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            max_overrides: 1_000,
            metadata_ttl: Duration::from_secs(300),
            warmup_duration_ms: 30_000,
            concurrency_multiplier: 1.0,
            default_max_concurrency: 10,
            drift_ring_capacity: 500,
            persistence: None,
            audit: None,
        }
    }
}

pub struct Router<D: ModelDiscovery> {
    config: RwLock<Arc<RoutingConfig>>,
    cooldowns: CooldownLedger,
    penalties: PenaltyWindow,
    inflight: InFlightAccountant,
    overrides: OverrideStore,
    stats: crate::stats::StatsRegistry,
    discovery: DiscoveryCache<D>,
    drift: DriftDetector,
    persistence: Option<FilePersistence>,
    audit: Box<dyn AuditSink>,
    last_shadow_decision: Mutex<Option<Decision>>,
    started_at: Instant,
    warmup_duration_ms: u64,
    concurrency_multiplier: f64,
    default_max_concurrency: u32,
}

impl<D: ModelDiscovery> Router<D> {
    pub fn new(config: RoutingConfig, discovery: D, options: RouterOptions) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            cooldowns: CooldownLedger::new(),
            penalties: PenaltyWindow::new(),
            inflight: InFlightAccountant::new(),
            overrides: OverrideStore::new(options.max_overrides),
            stats: crate::stats::StatsRegistry::new(),
            discovery: DiscoveryCache::new(discovery, options.metadata_ttl),
            drift: DriftDetector::new(options.drift_ring_capacity),
            persistence: options.persistence,
            audit: options.audit.unwrap_or_else(|| Box::new(NullSink)),
            last_shadow_decision: Mutex::new(None),
            started_at: Instant::now(),
            warmup_duration_ms: options.warmup_duration_ms,
            concurrency_multiplier: options.concurrency_multiplier,
            default_max_concurrency: options.default_max_concurrency,
        }
    }

    /// Snapshot of the live config. The lock is held only for `Arc::clone`.
    pub fn config(&self) -> Arc<RoutingConfig> {
        self.config.read().expect("config lock poisoned").clone()
    }

    fn within_warmup(&self) -> bool {
        self.started_at.elapsed().as_millis() as u64 <= self.warmup_duration_ms
    }

    /// Per-model concurrency cap as seen by the in-flight accountant:
    /// metadata's `maxConcurrency` scaled by the process-wide multiplier
    /// reflecting the number of API credentials available (spec §4.4, §5).
    fn effective_max_concurrency(&self, model: &str) -> u32 {
        let base = self
            .discovery
            .peek(model)
            .map(|meta| meta.max_concurrency)
            .unwrap_or(self.default_max_concurrency);
        ((base as f64) * self.concurrency_multiplier).round() as u32
    }

    fn fits_context(&self, estimated_tokens: u64) -> impl Fn(&str) -> bool + '_ {
        move |model: &str| {
            self.discovery
                .peek(model)
                .map(|meta| meta.context_window_tokens == 0 || estimated_tokens <= meta.context_window_tokens)
                .unwrap_or(true)
        }
    }

    fn model_meta(&self) -> impl Fn(&str) -> Option<ModelMeta> + '_ {
        move |model: &str| self.discovery.peek(model)
    }

    fn features_of(body: &Value) -> RequestFeatures {
        classify::extract_features(body)
    }

    /// `selectModel` (spec §6). Disabled → `None`. Shadow mode → caches the
    /// shadow decision and returns `None`. Context overflow → committed with
    /// `commit_decision_overflow` (no slot acquired). Normal path →
    /// committed with `commit_decision`.
    #[tracing::instrument(skip(self, body, attempted_models), fields(tier, source))]
    pub fn select_model(&self, requested_model: &str, body: &Value, attempted_models: &[String]) -> Option<Decision> {
        let cfg = self.config();
        if !cfg.enabled {
            return None;
        }

        let features = Self::features_of(body);
        let estimated_tokens = classify::estimate_tokens(&features);
        let max_concurrency = self.effective_max_concurrency(requested_model);

        let (decision, meta, _outcome) = decision::compute_decision(
            &cfg,
            &self.overrides,
            requested_model,
            &features,
            &self.cooldowns,
            &self.penalties,
            &self.inflight,
            &self.fits_context(estimated_tokens),
            &self.model_meta(),
            max_concurrency,
            estimated_tokens,
            attempted_models,
            None,
        );

        tracing::Span::current().record("tier", tracing::field::debug(decision.tier));
        tracing::Span::current().record("source", tracing::field::display(decision.source));

        if decision.source == decision::DecisionSource::TierDowngrade {
            self.audit.record(&AuditEvent::TierDowngrade {
                requested_tier: None,
                fallback_tier: decision.tier.map(|t| t.to_string()),
                model: decision.model.as_deref(),
                reason: decision.fallback_reason.as_deref().unwrap_or("tier_downgrade"),
            });
        }

        if cfg.shadow_mode {
            *self.last_shadow_decision.lock().unwrap() = Some(decision);
            return None;
        }

        let mut decision = decision;
        if decision.context_overflow.is_some() {
            decision.committed = decision::commit_decision_overflow(&meta, &self.stats);
            return Some(decision);
        }

        decision.committed = self.commit(&meta, max_concurrency, decision.source);
        if decision.attempted_models.len() > 1 {
            tracing::warn!(model = ?decision.model, attempts = decision.attempted_models.len(), "failover consumed multiple attempts");
        }
        Some(decision)
    }

    fn commit(&self, meta: &CommitMeta, max_concurrency: u32, source: decision::DecisionSource) -> bool {
        let committed = decision::commit_decision(meta, &self.inflight, &self.stats, max_concurrency);
        if committed && self.within_warmup() && source == decision::DecisionSource::Failover {
            self.stats.incr(crate::stats::FAMILY_FALLBACK_REASON, "warmup_window_commit");
        }
        committed
    }

    /// `peekAdmissionHold` (spec §4.10, §6). Read-only.
    pub fn peek_admission_hold(&self, requested_model: &str, body: &Value) -> Option<HoldInfo> {
        let cfg = self.config();
        let features = Self::features_of(body);
        admission::peek_admission_hold(&cfg, &self.overrides, requested_model, &features, &self.cooldowns)
    }

    /// `explain` (spec §4.8, §6). Never mutates stats or slots.
    pub fn explain(&self, requested_model: &str, body: &Value) -> (Decision, Trace) {
        let cfg = self.config();
        let features = Self::features_of(body);
        let estimated_tokens = classify::estimate_tokens(&features);
        let max_concurrency = self.effective_max_concurrency(requested_model);
        let raw_messages = raw_message_strings(body);

        trace::explain(
            &cfg,
            &self.overrides,
            requested_model,
            &features,
            &self.cooldowns,
            &self.penalties,
            &self.inflight,
            &self.fits_context(estimated_tokens),
            &self.model_meta(),
            max_concurrency,
            estimated_tokens,
            &raw_messages,
        )
    }

    /// `simulateDecisionMode` (spec §4.8, §6). Runs against cloned, not live,
    /// concurrency state.
    pub fn simulate_decision_mode(&self, requested_model: &str, body: &Value, dry_run_seed: u64) -> Decision {
        let cfg = self.config();
        let features = Self::features_of(body);
        let estimated_tokens = classify::estimate_tokens(&features);
        let max_concurrency = self.effective_max_concurrency(requested_model);

        trace::simulate_decision_mode(
            &cfg,
            &self.overrides,
            requested_model,
            &features,
            &self.cooldowns,
            &self.penalties,
            &self.inflight,
            &self.fits_context(estimated_tokens),
            &self.model_meta(),
            max_concurrency,
            estimated_tokens,
            dry_run_seed,
        )
    }

    /// `simulateStatefulMode` (spec §4.8, §6). Rejects unsupported snapshot
    /// versions via [`RouterError::SnapshotUnsupported`].
    pub fn simulate_stateful_mode(
        &self,
        requested_model: &str,
        body: &Value,
        snapshot: &PoolSnapshot,
        dry_run_seed: u64,
    ) -> RouterResult<Decision> {
        let cfg = self.config();
        let features = Self::features_of(body);
        let estimated_tokens = classify::estimate_tokens(&features);
        let max_concurrency = self.effective_max_concurrency(requested_model);

        trace::simulate_stateful_mode(
            &cfg,
            &self.overrides,
            requested_model,
            &features,
            snapshot,
            &cfg.cooldown,
            &self.fits_context(estimated_tokens),
            &self.model_meta(),
            max_concurrency,
            estimated_tokens,
            dry_run_seed,
        )
    }

    /// `recordModelCooldown` (spec §6, §4.2).
    pub fn record_model_cooldown(&self, model: &str, retry_after_ms: u64, burst_dampened: bool) {
        let cfg = self.config();
        self.cooldowns.record_cooldown(&cfg.cooldown, model, retry_after_ms, burst_dampened);
    }

    /// `recordPool429` (spec §6, §4.3).
    pub fn record_pool429(&self, model: &str) {
        let cfg = self.config();
        self.penalties.record_hit(&cfg.pool429_penalty, model);
    }

    /// `releaseModel` (spec §6, §4.4).
    pub fn release_model(&self, model: &str) {
        self.inflight.release(model);
    }

    /// `getCooldowns` (spec §6).
    pub fn get_cooldowns(&self) -> Vec<(String, CooldownSnapshotEntry)> {
        self.cooldowns.snapshot_detailed()
    }

    /// `getStats` (spec §6).
    pub fn get_stats(&self) -> std::collections::HashMap<String, u64> {
        self.stats.snapshot()
    }

    /// `getPoolStatus` / `getModelPoolSnapshot` (spec §6).
    pub fn get_model_pool_snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            version: trace::SUPPORTED_SNAPSHOT_VERSION.to_string(),
            cooldowns: self.cooldowns.snapshot(),
            in_flight: self.inflight.snapshot(),
        }
    }

    pub fn get_pool_status(&self) -> PoolSnapshot {
        self.get_model_pool_snapshot()
    }

    /// `getLastShadowDecision` (spec §6).
    pub fn get_last_shadow_decision(&self) -> Option<Decision> {
        self.last_shadow_decision.lock().unwrap().clone()
    }

    /// `getPool429PenaltyStats` (spec §6).
    pub fn get_pool429_penalty_stats(&self) -> Vec<(String, usize)> {
        let cfg = self.config();
        self.penalties.snapshot(&cfg.pool429_penalty)
    }

    /// `validateConfig` (spec §6). Static; does not mutate anything.
    pub fn validate_config(raw: &Value) -> ValidateOutcome {
        config::validate_config(raw)
    }

    /// `updateConfig` (spec §6, §4.1, §4.11). Hot swap; normalizes and
    /// persists the result when migration + hash-change warrant it.
    pub fn update_config(&self, raw: &Value) -> RouterResult<NormalizeOutcome> {
        let validated = config::validate_config(raw);
        if !validated.valid {
            return Err(RouterError::ConfigurationInvalid(
                validated.error.unwrap_or_else(|| "invalid configuration".to_string()),
            ));
        }

        let outcome = config::normalize(raw);
        *self.config.write().expect("config lock poisoned") = Arc::new(outcome.config.clone());

        if outcome.migrated {
            if let Some(persistence) = &self.persistence {
                if let Err(e) = persistence.persist_config(&outcome.config, &self.stats) {
                    tracing::warn!(error = %e, "config persistence failed after migration");
                    self.audit.record(&AuditEvent::PersistenceFailed { target: "config", error: &e.to_string() });
                }
            }
        }

        if !outcome.warnings.is_empty() {
            tracing::warn!(warnings = ?outcome.warnings, "config update applied with warnings");
        }

        Ok(outcome)
    }

    /// `setOverride` (spec §4.11, §6). Persists atomically when persistence
    /// is configured.
    pub fn set_override(&self, requested_model: &str, target_model: &str) -> RouterResult<()> {
        self.overrides.set_override(requested_model, target_model)?;
        self.persist_overrides();
        Ok(())
    }

    pub fn clear_override(&self, requested_model: &str) {
        self.overrides.clear_override(requested_model);
        self.persist_overrides();
    }

    fn persist_overrides(&self) {
        if let Some(persistence) = &self.persistence {
            let snapshot = self.overrides.snapshot_live();
            if let Err(e) = persistence.persist_overrides(&snapshot, &self.stats) {
                tracing::warn!(error = %e, "override persistence failed");
                self.audit.record(&AuditEvent::PersistenceFailed { target: "overrides", error: &e.to_string() });
            }
        }
    }

    /// Load persisted overrides at startup (not part of spec §6's inbound
    /// surface — a constructor-time convenience only).
    pub fn load_saved_overrides(&self) -> RouterResult<()> {
        if let Some(persistence) = &self.persistence {
            let saved = persistence.load_overrides()?;
            self.overrides.load_saved(saved);
        }
        Ok(())
    }

    /// `compareDrift` (spec §4.9): compare the router's own view of a model
    /// against the key manager's reported view.
    pub fn compare_drift(&self, tier: Option<config::TierName>, model: &str, km: KeyManagerView) -> Vec<DriftEvent> {
        let cfg = self.config();
        let router_view = RouterView {
            available: self.cooldowns.get_cooldown(&cfg.cooldown, model) == 0,
            cooldown_ms_remaining: self.cooldowns.get_cooldown(&cfg.cooldown, model),
            in_flight: self.inflight.current(model),
        };
        let events = self.drift.compare(&self.stats, tier, model, router_view, km);
        for event in &events {
            self.audit.record(&AuditEvent::DriftDetected {
                tier: tier.map(|t| t.to_string()),
                model,
                reason: &event.reason.to_string(),
            });
        }
        events
    }

    pub fn get_drift_events(&self) -> Vec<DriftEvent> {
        self.drift.snapshot()
    }

    /// Populate the model metadata cache for `model_id` (async I/O boundary;
    /// the request path only ever reads the cache synchronously).
    pub async fn warm_model_metadata(&self, model_id: &str) -> anyhow::Result<()> {
        self.discovery.refresh(model_id).await?;
        Ok(())
    }
}

fn raw_message_strings(body: &Value) -> Vec<String> {
    body.get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .map(|m| match m.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientModelPolicy, Rule, RuleMatch, Strategy, TierConfig};
    use crate::discovery::test_support::InMemoryDiscovery;
    use serde_json::json;
    use std::collections::HashMap;

    fn routing_config() -> RoutingConfig {
        let mut cfg = RoutingConfig::default();
        cfg.tiers.insert(
            crate::config::TierName::Heavy,
            TierConfig {
                models: vec!["glm-4-plus".to_string(), "glm-4-air".to_string()],
                strategy: Strategy::Quality,
                label: None,
                client_model_policy: ClientModelPolicy::RuleMatchOnly,
            },
        );
        cfg.rules = vec![Rule {
            match_: RuleMatch { model: Some("*".into()), ..Default::default() },
            tier: crate::config::TierName::Heavy,
        }];
        cfg
    }

    fn router() -> Router<InMemoryDiscovery> {
        Router::new(
            routing_config(),
            InMemoryDiscovery { models: HashMap::new() },
            RouterOptions::default(),
        )
    }

    #[test]
    fn select_model_routes_via_rule_and_commits() {
        let r = router();
        let body = json!({ "model": "claude-3", "messages": [] });
        let decision = r.select_model("claude-3", &body, &[]).unwrap();
        assert_eq!(decision.model.as_deref(), Some("glm-4-plus"));
        assert!(decision.committed);
        assert_eq!(r.get_stats().get("tier:heavy").copied().unwrap_or(0), 1);
    }

    #[test]
    fn disabled_router_returns_none() {
        let mut cfg = routing_config();
        cfg.enabled = false;
        let r = Router::new(cfg, InMemoryDiscovery { models: HashMap::new() }, RouterOptions::default());
        let body = json!({ "model": "claude-3" });
        assert!(r.select_model("claude-3", &body, &[]).is_none());
    }

    #[test]
    fn shadow_mode_returns_none_but_caches_decision() {
        let mut cfg = routing_config();
        cfg.shadow_mode = true;
        let r = Router::new(cfg, InMemoryDiscovery { models: HashMap::new() }, RouterOptions::default());
        let body = json!({ "model": "claude-3" });
        assert!(r.select_model("claude-3", &body, &[]).is_none());
        assert!(r.get_last_shadow_decision().is_some());
    }

    #[test]
    fn release_model_frees_a_previously_committed_slot() {
        let r = router();
        let body = json!({ "model": "claude-3" });
        r.select_model("claude-3", &body, &[]);
        assert_eq!(r.inflight.current("glm-4-plus"), 1);
        r.release_model("glm-4-plus");
        assert_eq!(r.inflight.current("glm-4-plus"), 0);
    }

    #[test]
    fn update_config_rejects_invalid_update_and_keeps_live_config() {
        let r = router();
        let before = r.config().tiers.len();
        let result = r.update_config(&json!({ "bogus": true }));
        assert!(result.is_err());
        assert_eq!(r.config().tiers.len(), before);
    }

    #[test]
    fn update_config_swaps_in_a_valid_update() {
        let r = router();
        let update = json!({
            "tiers": { "light": { "models": ["cheap-model"] } },
            "rules": [{ "match": { "model": "*" }, "tier": "light" }]
        });
        r.update_config(&update).unwrap();
        assert!(r.config().tier(crate::config::TierName::Light).is_some());
    }

    #[test]
    fn explain_never_commits_a_slot() {
        let r = router();
        let body = json!({ "model": "claude-3" });
        let (decision, trace) = r.explain("claude-3", &body);
        assert_eq!(decision.model.as_deref(), Some("glm-4-plus"));
        assert_eq!(r.inflight.current("glm-4-plus"), 0);
        assert!(trace.complexity_score <= 100);
    }

    #[test]
    fn tier_downgrade_is_reported_to_the_audit_sink() {
        use crate::audit::{AuditEvent, AuditSink};
        use std::sync::{Arc, Mutex as StdMutex};

        #[derive(Default)]
        struct RecordingSink {
            downgrades: StdMutex<usize>,
        }
        impl AuditSink for RecordingSink {
            fn record(&self, event: &AuditEvent<'_>) {
                if matches!(event, AuditEvent::TierDowngrade { .. }) {
                    *self.downgrades.lock().unwrap() += 1;
                }
            }
        }
        struct SharedSink(Arc<RecordingSink>);
        impl AuditSink for SharedSink {
            fn record(&self, event: &AuditEvent<'_>) {
                self.0.record(event);
            }
        }

        let mut cfg = routing_config();
        cfg.tiers.get_mut(&crate::config::TierName::Heavy).unwrap().models = vec!["stuck-model".to_string()];
        cfg.tiers.insert(
            crate::config::TierName::Light,
            TierConfig {
                models: vec!["cheap-model".to_string()],
                strategy: Strategy::Balanced,
                label: None,
                client_model_policy: ClientModelPolicy::RuleMatchOnly,
            },
        );
        cfg.failover.allow_tier_downgrade = true;
        cfg.failover.downgrade_order = vec![crate::config::TierName::Light];
        cfg.failover.max_tier_downgrades_per_request = 1;

        let sink = Arc::new(RecordingSink::default());
        let r = Router::new(
            cfg,
            InMemoryDiscovery { models: HashMap::new() },
            RouterOptions { audit: Some(Box::new(SharedSink(sink.clone()))), ..RouterOptions::default() },
        );
        r.record_model_cooldown("stuck-model", 60_000, false);

        let body = json!({ "model": "claude-3" });
        let decision = r.select_model("claude-3", &body, &[]).unwrap();
        assert_eq!(decision.tier, Some(crate::config::TierName::Light));
        assert_eq!(*sink.downgrades.lock().unwrap(), 1);
    }

    #[test]
    fn compare_drift_detects_router_available_but_km_excluded() {
        let r = router();
        let fired = r.compare_drift(
            Some(crate::config::TierName::Heavy),
            "glm-4-plus",
            KeyManagerView { available: false, in_flight: 0 },
        );
        assert!(!fired.is_empty());
        assert!(!r.get_drift_events().is_empty());
    }
}
