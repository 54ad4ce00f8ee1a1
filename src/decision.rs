//! Decision engine (spec §4.7).
//!
//! `compute_decision` is pure: given a config snapshot and the current
//! concurrency/cooldown/penalty state, it picks a model and returns that
//! choice as data — it never mutates shared state and never returns an
//! `Err`. `commit_decision`/`commit_decision_overflow` are the side-effecting
//! second phase: they acquire the in-flight slot the computed decision
//! implied and flush its stats — resolve first, act second.

use serde::{Deserialize, Serialize};

use crate::classify::{classify_heuristic, classify_rules, RequestFeatures};
use crate::config::{ComplexityUpgradeConfig, RoutingConfig, Strategy, TierConfig, TierName};
use crate::cooldown::CooldownLedger;
use crate::discovery::ModelMeta;
use crate::inflight::InFlightAccountant;
use crate::overrides::OverrideStore;
use crate::penalty::PenaltyWindow;
use crate::pool::{self, PoolInputs, SkipReason};
use crate::stats::{
    StatsRegistry, FAMILY_FALLBACK_REASON, FAMILY_SOURCE, FAMILY_STRATEGY, FAMILY_TIER,
    FAMILY_TIER_DOWNGRADE_ROUTE, FAMILY_UPGRADE_REASON,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Override,
    SavedOverride,
    Rule,
    Classifier,
    Pool,
    Failover,
    Default,
    TierDowngrade,
    None,
}

impl std::fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Override => "override",
            Self::SavedOverride => "saved_override",
            Self::Rule => "rule",
            Self::Classifier => "classifier",
            Self::Pool => "pool",
            Self::Failover => "failover",
            Self::Default => "default",
            Self::TierDowngrade => "tier_downgrade",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextOverflowCause {
    /// Some same-tier candidate has enough context for this request but is
    /// merely cooled down or at capacity right now — retrying later may win.
    TransientUnavailable,
    /// No same-tier candidate has enough context for this request at all.
    Genuine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOverflow {
    pub estimated_tokens: u64,
    pub model_context_length: u64,
    pub overflow_by: u64,
    pub cause: ContextOverflowCause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub tier: Option<TierName>,
    pub model: Option<String>,
    pub source: DecisionSource,
    pub shadow: bool,
    pub committed: bool,
    pub context_overflow: Option<ContextOverflow>,
    pub attempted_models: Vec<String>,
    pub fallback_reason: Option<String>,
}

/// Side table of pending effects a computed decision implies but hasn't
/// applied yet — kept as a typed companion value rather than a field on
/// `Decision` itself, since `Decision` is the caller-facing, serializable
/// record and these are purely internal bookkeeping for `commit_decision`.
#[derive(Debug, Clone, Default)]
pub struct CommitMeta {
    pub acquire_model: Option<String>,
    pub stats_tier: Option<TierName>,
    pub stats_source: Option<DecisionSource>,
    pub stats_strategy: Option<Strategy>,
    pub stats_upgrade_reason: Option<&'static str>,
    pub stats_tier_downgrade_route: Option<String>,
}

struct EngineArgs<'a> {
    cfg: &'a RoutingConfig,
    overrides: &'a OverrideStore,
    cooldowns: &'a CooldownLedger,
    penalties: &'a PenaltyWindow,
    inflight: &'a InFlightAccountant,
    fits_context: &'a dyn Fn(&str) -> bool,
    model_meta: &'a dyn Fn(&str) -> Option<ModelMeta>,
    max_concurrency: u32,
    dry_run_seed: Option<u64>,
}

type EngineResult = (Decision, CommitMeta, Option<pool::SelectionOutcome>);

fn passthrough(cfg: &RoutingConfig, source: DecisionSource) -> EngineResult {
    (
        Decision {
            tier: None,
            model: None,
            source,
            shadow: cfg.shadow_mode,
            committed: false,
            context_overflow: None,
            attempted_models: Vec::new(),
            fallback_reason: None,
        },
        CommitMeta::default(),
        None,
    )
}

/// First configured threshold that matches, in declaration order — the
/// label attached to `FAMILY_UPGRADE_REASON`.
fn complexity_upgrade_reason(cfg: &ComplexityUpgradeConfig, family: &str, f: &RequestFeatures) -> Option<&'static str> {
    if !cfg.enabled || !cfg.allowed_families.iter().any(|fam| fam == family) {
        return None;
    }
    let t = &cfg.thresholds;
    if t.max_tokens_gte.is_some_and(|min| f.max_tokens.is_some_and(|v| v >= min)) {
        return Some("max_tokens_gte");
    }
    if t.message_count_gte.is_some_and(|min| f.message_count as i64 >= min) {
        return Some("message_count_gte");
    }
    if t.system_length_gte.is_some_and(|min| f.system_length as i64 >= min) {
        return Some("system_length_gte");
    }
    if t.has_tools.is_some_and(|expected| f.has_tools == expected) {
        return Some("has_tools");
    }
    if t.has_vision.is_some_and(|expected| f.has_vision == expected) {
        return Some("has_vision");
    }
    None
}

fn next_tier_up(tier: TierName) -> Option<TierName> {
    match tier {
        TierName::Light => Some(TierName::Medium),
        TierName::Medium => Some(TierName::Heavy),
        TierName::Heavy => None,
    }
}

/// Best-effort pick when pool scoring finds no winner: the not-yet-attempted,
/// context-fitting candidate with the shortest remaining cooldown. `None`
/// once every model in the tier has already been attempted, or none fit —
/// a model that can't hold the request is never an acceptable fallback.
fn shortest_cooldown_candidate(
    tier_cfg: &TierConfig,
    cooldowns: &CooldownLedger,
    cooldown_cfg: &crate::config::CooldownConfig,
    fits_context: &dyn Fn(&str) -> bool,
    attempted: &[String],
) -> Option<String> {
    tier_cfg
        .models
        .iter()
        .filter(|m| !attempted.contains(m) && fits_context(m))
        .min_by_key(|m| cooldowns.get_cooldown(cooldown_cfg, m))
        .cloned()
}

/// Whether the tier's exhaustion is transient (some candidate fits context
/// but is merely cooled/at-capacity right now) or genuine (nothing in the
/// tier fits at all). Checked against live cooldown/capacity state directly
/// rather than the pool selector's skip list, so an already-attempted
/// candidate that's simply cooling still counts as transient.
fn overflow_cause(
    tier_cfg: &TierConfig,
    cooldowns: &CooldownLedger,
    cooldown_cfg: &crate::config::CooldownConfig,
    inflight: &InFlightAccountant,
    max_concurrency: u32,
    fits_context: &dyn Fn(&str) -> bool,
) -> ContextOverflowCause {
    let transient = tier_cfg.models.iter().any(|m| {
        fits_context(m)
            && (cooldowns.get_cooldown(cooldown_cfg, m) > 0 || inflight.current(m) >= max_concurrency)
    });
    if transient {
        ContextOverflowCause::TransientUnavailable
    } else {
        ContextOverflowCause::Genuine
    }
}

#[allow(clippy::too_many_arguments)]
fn build_context_overflow(
    tier_cfg: &TierConfig,
    model_meta: &dyn Fn(&str) -> Option<ModelMeta>,
    estimated_tokens: u64,
    cooldowns: &CooldownLedger,
    cooldown_cfg: &crate::config::CooldownConfig,
    inflight: &InFlightAccountant,
    max_concurrency: u32,
    fits_context: &dyn Fn(&str) -> bool,
) -> ContextOverflow {
    let model_context_length = tier_cfg
        .target()
        .and_then(model_meta)
        .map(|m| m.context_window_tokens)
        .unwrap_or(0);
    ContextOverflow {
        estimated_tokens,
        model_context_length,
        overflow_by: estimated_tokens.saturating_sub(model_context_length),
        cause: overflow_cause(tier_cfg, cooldowns, cooldown_cfg, inflight, max_concurrency, fits_context),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn compute_decision(
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
    attempted_models_seed: &[String],
    dry_run_seed: Option<u64>,
) -> EngineResult {
    let args = EngineArgs {
        cfg,
        overrides,
        cooldowns,
        penalties,
        inflight,
        fits_context,
        model_meta,
        max_concurrency,
        dry_run_seed,
    };

    if !cfg.enabled {
        return passthrough(cfg, DecisionSource::None);
    }

    if let Some(model) = overrides.get_live(requested_model) {
        return commit_single(&args, model, DecisionSource::Override, None);
    }
    if let Some(model) = overrides.get_saved(requested_model) {
        return commit_single(&args, model, DecisionSource::SavedOverride, None);
    }

    let classified_tier = classify_rules(&cfg.rules, features)
        .map(|t| (t, DecisionSource::Rule))
        .or_else(|| {
            cfg.heuristic_enabled()
                .then(|| classify_heuristic(&cfg.classifier, features))
                .flatten()
                .map(|t| (t, DecisionSource::Classifier))
        });

    let Some((mut tier_name, mut source)) = classified_tier else {
        return default_or_none(cfg, attempted_models_seed.to_vec(), None, None);
    };

    let mut upgrade_reason: Option<&'static str> = None;
    if cfg.complexity_upgrade.enabled {
        if let Some(reason) = cfg
            .tier(tier_name)
            .and_then(|t| t.target())
            .and_then(|target| (args.model_meta)(target))
            .and_then(|meta| complexity_upgrade_reason(&cfg.complexity_upgrade, &meta.family, features))
        {
            if let Some(next) = next_tier_up(tier_name) {
                if cfg.tier(next).is_some() {
                    tier_name = next;
                    upgrade_reason = Some(reason);
                }
            }
        }
    }

    let starting_tier = tier_name;
    let attempted_seed = attempted_models_seed;
    let mut attempted_models: Vec<String> = attempted_seed.to_vec();
    let mut downgrades_used = 0usize;
    let mut last_outcome: Option<pool::SelectionOutcome> = None;
    let mut last_tier_cfg_strategy: Option<Strategy> = None;

    loop {
        let Some(tier_cfg) = cfg.tier(tier_name) else { break };
        let effective_max_switches = cfg
            .failover
            .max_model_switches_per_request
            .min(tier_cfg.models.len().max(1));

        let inputs = PoolInputs {
            tier: tier_cfg,
            glm5: &cfg.glm5,
            cooldowns: args.cooldowns,
            cooldown_cfg: &cfg.cooldown,
            penalties: args.penalties,
            penalty_cfg: &cfg.pool429_penalty,
            inflight: args.inflight,
            max_concurrency: args.max_concurrency,
            dry_run_seed: args.dry_run_seed,
            fits_context: args.fits_context,
            model_meta: args.model_meta,
            excluded: &attempted_models,
        };
        let outcome = pool::select(&inputs);

        let scored_winner = outcome.selected.as_ref().map(|w| w.model.clone());
        let fallback_allowed = attempted_models.len() < effective_max_switches;
        let winner = scored_winner.clone().or_else(|| {
            fallback_allowed
                .then(|| {
                    shortest_cooldown_candidate(tier_cfg, args.cooldowns, &cfg.cooldown, args.fits_context, &attempted_models)
                })
                .flatten()
        });

        if let Some(model) = winner {
            let is_failover = !attempted_seed.is_empty()
                || outcome
                    .skipped
                    .iter()
                    .any(|(_, r)| matches!(r, SkipReason::Cooldown | SkipReason::AtCapacity));
            let resolved_source = if is_failover {
                DecisionSource::Failover
            } else if tier_cfg.strategy == Strategy::Pool {
                DecisionSource::Pool
            } else {
                source
            };
            let fallback_reason = if scored_winner.as_deref() != Some(model.as_str()) {
                Some("warning: no available candidate in tier, falling back to shortest remaining cooldown".to_string())
            } else if is_failover {
                Some("model_unavailable_in_tier".to_string())
            } else {
                None
            };
            let stats_upgrade_reason = attempted_models.is_empty().then(|| upgrade_reason).flatten();
            let stats_tier_downgrade_route =
                (tier_name != starting_tier).then(|| format!("{starting_tier}->{tier_name}"));

            attempted_models.push(model.clone());
            return (
                Decision {
                    tier: Some(tier_name),
                    model: Some(model.clone()),
                    source: resolved_source,
                    shadow: cfg.shadow_mode,
                    committed: false,
                    context_overflow: None,
                    attempted_models,
                    fallback_reason,
                },
                CommitMeta {
                    acquire_model: Some(model),
                    stats_tier: Some(tier_name),
                    stats_source: Some(resolved_source),
                    stats_strategy: Some(tier_cfg.strategy),
                    stats_upgrade_reason,
                    stats_tier_downgrade_route,
                },
                Some(outcome),
            );
        }

        last_tier_cfg_strategy = Some(tier_cfg.strategy);
        last_outcome = Some(outcome);

        if cfg.failover.allow_tier_downgrade
            && downgrades_used < cfg.failover.max_tier_downgrades_per_request
            && last_tier_cfg_strategy != Some(Strategy::Pool)
            && attempted_seed.is_empty()
        {
            if let Some(next_tier) = cfg.failover.downgrade_order.get(downgrades_used).copied() {
                tier_name = next_tier;
                source = DecisionSource::TierDowngrade;
                downgrades_used += 1;
                continue;
            }
        }
        break;
    }

    let context_overflow = match (cfg.tier(tier_name), &last_outcome) {
        (Some(tier_cfg), Some(_)) => Some(build_context_overflow(
            tier_cfg,
            args.model_meta,
            estimated_tokens,
            args.cooldowns,
            &cfg.cooldown,
            args.inflight,
            args.max_concurrency,
            args.fits_context,
        )),
        _ => None,
    };

    default_or_none(cfg, attempted_models, context_overflow, last_outcome)
}

fn default_or_none(
    cfg: &RoutingConfig,
    attempted_models: Vec<String>,
    context_overflow: Option<ContextOverflow>,
    outcome: Option<pool::SelectionOutcome>,
) -> EngineResult {
    if let Some(default_model) = &cfg.default_model {
        return (
            Decision {
                tier: None,
                model: Some(default_model.clone()),
                source: DecisionSource::Default,
                shadow: cfg.shadow_mode,
                committed: false,
                context_overflow,
                attempted_models,
                fallback_reason: Some("no_tier_resolved".to_string()),
            },
            CommitMeta {
                acquire_model: Some(default_model.clone()),
                stats_tier: None,
                stats_source: Some(DecisionSource::Default),
                stats_strategy: None,
                stats_upgrade_reason: None,
                stats_tier_downgrade_route: None,
            },
            outcome,
        );
    }

    (
        Decision {
            tier: None,
            model: None,
            source: DecisionSource::None,
            shadow: cfg.shadow_mode,
            committed: false,
            context_overflow,
            attempted_models,
            fallback_reason: None,
        },
        CommitMeta::default(),
        outcome,
    )
}

fn commit_single(
    args: &EngineArgs<'_>,
    model: String,
    source: DecisionSource,
    tier: Option<TierName>,
) -> EngineResult {
    (
        Decision {
            tier,
            model: Some(model.clone()),
            source,
            shadow: args.cfg.shadow_mode,
            committed: false,
            context_overflow: None,
            attempted_models: vec![model.clone()],
            fallback_reason: None,
        },
        CommitMeta {
            acquire_model: Some(model),
            stats_tier: tier,
            stats_source: Some(source),
            stats_strategy: None,
            stats_upgrade_reason: None,
            stats_tier_downgrade_route: None,
        },
        None,
    )
}

/// Side-effecting commit phase: acquire the in-flight slot the decision
/// implied and flush its stats. Idempotent in the sense that calling it
/// twice on the same `Decision` simply attempts to acquire twice — callers
/// own not double-committing a single routed request.
pub fn commit_decision(meta: &CommitMeta, inflight: &InFlightAccountant, stats: &StatsRegistry, max_concurrency: u32) -> bool {
    let committed = match &meta.acquire_model {
        Some(model) => inflight.try_acquire(model, max_concurrency),
        None => true,
    };

    if let Some(tier) = meta.stats_tier {
        stats.incr(FAMILY_TIER, tier.to_string());
    }
    if let Some(source) = meta.stats_source {
        stats.incr(FAMILY_SOURCE, source.to_string());
    }
    if let Some(strategy) = meta.stats_strategy {
        stats.incr(FAMILY_STRATEGY, strategy.to_string());
    }
    if let Some(reason) = meta.stats_upgrade_reason {
        stats.incr(FAMILY_UPGRADE_REASON, reason);
    }
    if let Some(route) = &meta.stats_tier_downgrade_route {
        stats.incr(FAMILY_TIER_DOWNGRADE_ROUTE, route.clone());
    }

    committed
}

/// Fast path for a context-overflow decision: no slot is ever acquired, so
/// this always reports `committed = false`. Still flushes stats so the
/// overflow shows up in `getStats()`.
pub fn commit_decision_overflow(meta: &CommitMeta, stats: &StatsRegistry) -> bool {
    if let Some(tier) = meta.stats_tier {
        stats.incr(FAMILY_TIER, tier.to_string());
    }
    stats.incr(FAMILY_FALLBACK_REASON, "context_overflow");
    false
}
