//! Trace building, `explain`, and simulation modes (spec §4.8, §9).
//!
//! A [`Trace`] is an optional, sampled-rate record of *why* a decision came
//! out the way it did, assembled in one pass since every field is known up
//! front rather than filled in across a request's lifetime.

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::RequestFeatures;
use crate::config::RoutingConfig;
use crate::cooldown::CooldownLedger;
use crate::decision::{compute_decision, Decision};
use crate::discovery::ModelMeta;
use crate::error::{RouterError, RouterResult};
use crate::inflight::InFlightAccountant;
use crate::overrides::OverrideStore;
use crate::penalty::PenaltyWindow;
use crate::pool::{ScoredCandidate, SkipReason};

const MAX_CANDIDATES: usize = 5;
const MAX_MESSAGES: usize = 3;
const MAX_STRING_LEN: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateTrace {
    pub model: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub request_id: Uuid,
    pub complexity_score: u8,
    pub rationale: Vec<String>,
    pub candidates: Vec<CandidateTrace>,
    pub cooldown_reasons: Vec<(String, String)>,
    pub messages_sample: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

/// Weighted complexity score (0-100) used purely for the trace's
/// human-readable rationale — not consulted by the decision engine itself.
pub fn complexity_score(f: &RequestFeatures) -> (u8, Vec<String>) {
    let mut score = 0.0;
    let mut rationale = Vec::new();

    let max_tokens = f.max_tokens.unwrap_or(0);
    let tokens_component = (max_tokens as f64 / 8192.0 * 30.0).min(30.0);
    if tokens_component > 0.0 {
        rationale.push(format!("max_tokens={} contributes {:.1}", max_tokens, tokens_component));
        score += tokens_component;
    }

    let messages_component = (f.message_count as f64 / 20.0 * 20.0).min(20.0);
    if messages_component > 0.0 {
        rationale.push(format!("message_count={} contributes {:.1}", f.message_count, messages_component));
        score += messages_component;
    }

    let system_component = (f.system_length as f64 / 2000.0 * 15.0).min(15.0);
    if system_component > 0.0 {
        rationale.push(format!("system_length={} contributes {:.1}", f.system_length, system_component));
        score += system_component;
    }

    if f.has_tools {
        rationale.push("has_tools=true contributes 15.0".to_string());
        score += 15.0;
    }
    if f.has_vision {
        rationale.push("has_vision=true contributes 20.0".to_string());
        score += 20.0;
    }

    (score.clamp(0.0, 100.0).round() as u8, rationale)
}

/// Whether this request should be traced, given `samplingRate` (0-100).
pub fn should_sample(sampling_rate: f64, seed: Option<u64>) -> bool {
    if sampling_rate <= 0.0 {
        return false;
    }
    if sampling_rate >= 100.0 {
        return true;
    }
    let roll = match seed {
        Some(seed) => {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            rng.gen_range(0.0..100.0)
        }
        None => rand::thread_rng().gen_range(0.0..100.0),
    };
    roll < sampling_rate
}

#[allow(clippy::too_many_arguments)]
pub fn build_trace(
    cfg: &RoutingConfig,
    request_id: Uuid,
    features: &RequestFeatures,
    scored: &[ScoredCandidate],
    skipped: &[(String, SkipReason)],
    raw_messages: &[String],
) -> Trace {
    let (score, rationale) = complexity_score(features);

    let mut candidates: Vec<CandidateTrace> = scored
        .iter()
        .map(|c| CandidateTrace { model: c.model.clone(), score: c.score })
        .collect();
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(MAX_CANDIDATES);

    let cooldown_reasons: Vec<(String, String)> = skipped
        .iter()
        .map(|(model, reason)| (model.clone(), skip_reason_label(*reason)))
        .collect();

    let messages_sample: Vec<String> = raw_messages
        .iter()
        .take(MAX_MESSAGES)
        .map(|m| truncate(m, MAX_STRING_LEN))
        .collect();

    let mut trace = Trace {
        request_id,
        complexity_score: score,
        rationale,
        candidates,
        cooldown_reasons,
        messages_sample,
        warning: None,
    };

    clamp_to_payload_size(&mut trace, cfg.trace.max_payload_size);
    trace
}

fn skip_reason_label(reason: SkipReason) -> String {
    match reason {
        SkipReason::NotInCandidates => "not_in_candidates",
        SkipReason::Cooldown => "cooldown",
        SkipReason::AtCapacity => "at_capacity",
        SkipReason::ContextOverflow => "context_overflow",
        SkipReason::AlreadyAttempted => "already_attempted",
    }
    .to_string()
}

fn clamp_to_payload_size(trace: &mut Trace, max_payload_size: usize) {
    let Ok(serialized) = serde_json::to_vec(trace) else {
        return;
    };
    if serialized.len() <= max_payload_size {
        return;
    }

    // Already applied candidate/message caps and string truncation up
    // front; if it's still oversized, drop the rationale (the largest
    // remaining variable-length field) and flag it.
    trace.rationale.clear();
    trace.warning = Some("trace exceeded maxPayloadSize after truncation".to_string());
}

/// `explain()` (spec §6): dry-run the decision pipeline and return both the
/// decision and its trace, regardless of sampling rate — an explicit explain
/// call always produces a trace.
#[allow(clippy::too_many_arguments)]
pub fn explain(
    cfg: &RoutingConfig,
    overrides: &OverrideStore,
    requested_model: &str,
    features: &RequestFeatures,
    cooldowns: &CooldownLedger,
    penalties: &PenaltyWindow,
    inflight: &InFlightAccountant,
    fits_context: &dyn Fn(&str) -> bool,
    model_meta: &dyn Fn(&str) -> Option<ModelMeta>,
    max_concurrency: u32,
    estimated_tokens: u64,
    raw_messages: &[String],
) -> (Decision, Trace) {
    let (decision, _meta, outcome) = compute_decision(
        cfg,
        overrides,
        requested_model,
        features,
        cooldowns,
        penalties,
        inflight,
        fits_context,
        model_meta,
        max_concurrency,
        estimated_tokens,
        &[],
        None,
    );
    let (scored, skipped): (Vec<ScoredCandidate>, Vec<(String, SkipReason)>) = outcome
        .map(|o| (o.scored, o.skipped))
        .unwrap_or_default();
    let trace = build_trace(cfg, Uuid::new_v4(), features, &scored, &skipped, raw_messages);
    (decision, trace)
}

/// `simulateDecisionMode` (spec §9): run the decision pipeline against the
/// live config but cloned concurrency state, so a simulation can never mutate
/// cooldowns, penalties, or in-flight counts a real request would observe.
#[allow(clippy::too_many_arguments)]
pub fn simulate_decision_mode(
    cfg: &RoutingConfig,
    overrides: &OverrideStore,
    requested_model: &str,
    features: &RequestFeatures,
    cooldowns: &CooldownLedger,
    penalties: &PenaltyWindow,
    inflight: &InFlightAccountant,
    fits_context: &dyn Fn(&str) -> bool,
    model_meta: &dyn Fn(&str) -> Option<ModelMeta>,
    max_concurrency: u32,
    estimated_tokens: u64,
    dry_run_seed: u64,
) -> Decision {
    let cloned_cooldowns = cooldowns.deep_clone();
    let cloned_penalties = penalties.deep_clone();
    let cloned_inflight = inflight.deep_clone();

    let (decision, _meta, _outcome) = compute_decision(
        cfg,
        overrides,
        requested_model,
        features,
        &cloned_cooldowns,
        &cloned_penalties,
        &cloned_inflight,
        fits_context,
        model_meta,
        max_concurrency,
        estimated_tokens,
        &[],
        Some(dry_run_seed),
    );
    decision
}

/// A `PoolSnapshot`'s wire version. Only `"1.0"` is understood; anything
/// else is rejected with [`RouterError::SnapshotUnsupported`].
pub const SUPPORTED_SNAPSHOT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub version: String,
    pub cooldowns: Vec<(String, u64)>,
    pub in_flight: Vec<(String, u32)>,
}

/// `simulateStatefulMode` (spec §9): like [`simulate_decision_mode`], but the
/// cloned state is seeded from an externally supplied [`PoolSnapshot`]
/// instead of the router's live state — used to answer "what would have
/// happened to this request against that snapshot."
#[allow(clippy::too_many_arguments)]
pub fn simulate_stateful_mode(
    cfg: &RoutingConfig,
    overrides: &OverrideStore,
    requested_model: &str,
    features: &RequestFeatures,
    snapshot: &PoolSnapshot,
    cooldown_cfg: &crate::config::CooldownConfig,
    fits_context: &dyn Fn(&str) -> bool,
    model_meta: &dyn Fn(&str) -> Option<ModelMeta>,
    max_concurrency: u32,
    estimated_tokens: u64,
    dry_run_seed: u64,
) -> RouterResult<Decision> {
    if snapshot.version != SUPPORTED_SNAPSHOT_VERSION {
        return Err(RouterError::SnapshotUnsupported(snapshot.version.clone()));
    }

    let cooldowns = CooldownLedger::new();
    for (model, remaining_ms) in &snapshot.cooldowns {
        cooldowns.record_cooldown(cooldown_cfg, model, *remaining_ms, false);
    }

    let inflight = InFlightAccountant::new();
    for (model, count) in &snapshot.in_flight {
        for _ in 0..*count {
            inflight.try_acquire(model, u32::MAX);
        }
    }

    let penalties = PenaltyWindow::new();

    let (decision, _meta, _outcome) = compute_decision(
        cfg,
        overrides,
        requested_model,
        features,
        &cooldowns,
        &penalties,
        &inflight,
        fits_context,
        model_meta,
        max_concurrency,
        estimated_tokens,
        &[],
        Some(dry_run_seed),
    );
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn complexity_score_increases_with_more_signals() {
        let bare = crate::classify::extract_features(&json!({}));
        let rich = crate::classify::extract_features(&json!({
            "max_tokens": 8192,
            "tools": [{"name": "x"}],
            "messages": [{"role": "user", "content": [{"type": "image", "source": {}}]}]
        }));
        let (bare_score, _) = complexity_score(&bare);
        let (rich_score, _) = complexity_score(&rich);
        assert!(rich_score > bare_score);
    }

    #[test]
    fn sampling_rate_zero_never_samples() {
        assert!(!should_sample(0.0, Some(1)));
    }

    #[test]
    fn sampling_rate_100_always_samples() {
        assert!(should_sample(100.0, Some(1)));
    }

    #[test]
    fn trace_candidates_are_capped_at_five_and_sorted_by_score() {
        let cfg = RoutingConfig::default();
        let features = crate::classify::extract_features(&json!({}));
        let scored: Vec<ScoredCandidate> = (0..10)
            .map(|i| ScoredCandidate { model: format!("m{i}"), position: i, score: i as f64 })
            .collect();
        let trace = build_trace(&cfg, Uuid::new_v4(), &features, &scored, &[], &[]);
        assert_eq!(trace.candidates.len(), 5);
        assert_eq!(trace.candidates[0].model, "m9");
    }

    #[test]
    fn trace_messages_are_capped_and_truncated() {
        let cfg = RoutingConfig::default();
        let features = crate::classify::extract_features(&json!({}));
        let long = "x".repeat(500);
        let messages = vec![long.clone(), long.clone(), long.clone(), long];
        let trace = build_trace(&cfg, Uuid::new_v4(), &features, &[], &[], &messages);
        assert_eq!(trace.messages_sample.len(), 3);
        assert_eq!(trace.messages_sample[0].chars().count(), 200);
    }

    #[test]
    fn unsupported_snapshot_version_is_rejected() {
        let cfg = RoutingConfig::default();
        let overrides = OverrideStore::new(10);
        let features = crate::classify::extract_features(&json!({}));
        let snapshot = PoolSnapshot { version: "2.0".to_string(), cooldowns: vec![], in_flight: vec![] };
        let result = simulate_stateful_mode(
            &cfg,
            &overrides,
            "claude-3",
            &features,
            &snapshot,
            &cfg.cooldown,
            &|_| true,
            &|_| None,
            10,
            0,
            1,
        );
        assert!(matches!(result, Err(RouterError::SnapshotUnsupported(_))));
    }

    #[test]
    fn simulate_decision_mode_does_not_mutate_live_state() {
        let mut cfg = RoutingConfig::default();
        cfg.tiers.insert(
            crate::config::TierName::Heavy,
            crate::config::TierConfig {
                models: vec!["m".to_string()],
                strategy: crate::config::Strategy::Quality,
                label: None,
                client_model_policy: crate::config::ClientModelPolicy::RuleMatchOnly,
            },
        );
        cfg.rules = vec![crate::config::Rule {
            match_: crate::config::RuleMatch { model: Some("*".into()), ..Default::default() },
            tier: crate::config::TierName::Heavy,
        }];
        let overrides = OverrideStore::new(10);
        let cooldowns = CooldownLedger::new();
        let penalties = PenaltyWindow::new();
        let inflight = InFlightAccountant::new();
        let features = crate::classify::extract_features(&json!({ "model": "claude-3" }));

        let _ = simulate_decision_mode(
            &cfg, &overrides, "claude-3", &features, &cooldowns, &penalties, &inflight, &|_| true, &|_| None, 10, 0, 7,
        );

        assert_eq!(cooldowns.len(), 0);
        assert_eq!(inflight.current("m"), 0);
    }
}
