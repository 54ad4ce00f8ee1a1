//! Pool selector (spec §4.6).
//!
//! Scores every model in a tier's ordered `models[]`, skipping ones that are
//! unavailable for a concrete reason (not an error), then picks a winner
//! according to the tier's configured [`Strategy`]. Scoring weights draw on
//! `litellm-rs`'s deployment weight/priority model; the `pool` strategy's
//! weighted-random selection is the same idea as a classic load balancer's
//! weighted round robin.

use rand::Rng;

use crate::config::{Glm5Config, Strategy, TierConfig};
use crate::cooldown::CooldownLedger;
use crate::config::CooldownConfig;
use crate::config::Pool429PenaltyConfig;
use crate::discovery::ModelMeta;
use crate::inflight::InFlightAccountant;
use crate::penalty::PenaltyWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotInCandidates,
    Cooldown,
    AtCapacity,
    ContextOverflow,
    /// Already tried earlier in this same request's failover walk.
    AlreadyAttempted,
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub model: String,
    pub position: isize,
    pub score: f64,
    pub cost_per_million: f64,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone)]
pub struct ShadowPick {
    pub model: String,
    pub would_have_been_selected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionOutcome {
    pub selected: Option<ScoredCandidate>,
    pub scored: Vec<ScoredCandidate>,
    pub skipped: Vec<(String, SkipReason)>,
    pub tier_exhausted: bool,
    pub shadow: Option<ShadowPick>,
}

/// Inputs a caller (the decision engine) must supply per candidate that pool
/// scoring itself has no business owning: cooldown/capacity are concurrency
/// state, context-fit and cost/concurrency metadata come from model discovery.
pub struct PoolInputs<'a> {
    pub tier: &'a TierConfig,
    pub glm5: &'a Glm5Config,
    pub cooldowns: &'a CooldownLedger,
    pub cooldown_cfg: &'a CooldownConfig,
    pub penalties: &'a PenaltyWindow,
    pub penalty_cfg: &'a Pool429PenaltyConfig,
    pub inflight: &'a InFlightAccountant,
    pub max_concurrency: u32,
    /// `Some(seed)` in dry-run/simulation contexts for deterministic, hash-seeded
    /// randomness; `None` for live traffic (thread-local RNG).
    pub dry_run_seed: Option<u64>,
    pub fits_context: &'a dyn Fn(&str) -> bool,
    pub model_meta: &'a dyn Fn(&str) -> Option<ModelMeta>,
    /// Models already tried earlier in this request's failover walk; never
    /// re-offered as a fresh candidate.
    pub excluded: &'a [String],
}

const GLM5_MODEL_ID: &str = "glm-5";

pub fn select(inputs: &PoolInputs<'_>) -> SelectionOutcome {
    let tier = inputs.tier;

    let glm5_idx = tier.models.iter().position(|m| m == GLM5_MODEL_ID);
    let mut forced_model: Option<String> = None;

    if let Some(idx) = glm5_idx {
        if inputs.glm5.enabled {
            let roll = roll_percent(inputs.dry_run_seed);
            if roll < inputs.glm5.preference_percent as f64 {
                forced_model = Some(tier.models[idx].clone());
            }
        }
    }

    let max_position = tier.models.len().saturating_sub(1) as isize;
    let mut scored = Vec::new();
    let mut skipped = Vec::new();

    for (position, model) in tier.models.iter().enumerate() {
        if glm5_idx == Some(position) && !inputs.glm5.enabled {
            // Feature disabled entirely: never a candidate, never scored.
            continue;
        }

        if inputs.excluded.iter().any(|m| m == model) {
            skipped.push((model.clone(), SkipReason::AlreadyAttempted));
            continue;
        }

        let cooldown_ms = inputs.cooldowns.get_cooldown(inputs.cooldown_cfg, model);
        if cooldown_ms > 0 {
            skipped.push((model.clone(), SkipReason::Cooldown));
            continue;
        }

        let in_flight = inputs.inflight.current(model);
        if in_flight >= inputs.max_concurrency {
            skipped.push((model.clone(), SkipReason::AtCapacity));
            continue;
        }

        if !(inputs.fits_context)(model) {
            skipped.push((model.clone(), SkipReason::ContextOverflow));
            continue;
        }

        let effective_position = if forced_model.as_deref() == Some(model.as_str()) {
            -1isize
        } else {
            position as isize
        };

        let meta = (inputs.model_meta)(model);
        let cost_per_million = meta.as_ref().map(|m| m.cost_per_million).unwrap_or(0.0);
        let candidate_max_concurrency = meta.as_ref().map(|m| m.max_concurrency).unwrap_or(inputs.max_concurrency);
        let available = (inputs.max_concurrency.saturating_sub(in_flight)) as f64;
        let hit_count = inputs.penalties.hit_count(inputs.penalty_cfg, model);

        let score = match tier.strategy {
            Strategy::Quality => quality_score(effective_position),
            Strategy::Throughput | Strategy::Pool => {
                throughput_score(available, hit_count, inputs.penalty_cfg.penalty_weight)
            }
            Strategy::Balanced => balanced_score(
                effective_position,
                max_position,
                available,
                inputs.max_concurrency as f64,
            ),
        };

        scored.push(ScoredCandidate {
            model: model.clone(),
            position: effective_position,
            score,
            cost_per_million,
            max_concurrency: candidate_max_concurrency,
        });
    }

    if tier.models.is_empty() {
        skipped.push((String::new(), SkipReason::NotInCandidates));
    }

    let shadow = glm5_idx.filter(|_| inputs.glm5.enabled && forced_model.is_none()).map(|_| {
        let would_have_won = (!scored.is_empty())
            .then(|| pick_winner(tier.strategy, &scored))
            .is_some_and(|winner| winner.model == GLM5_MODEL_ID);
        ShadowPick {
            model: GLM5_MODEL_ID.to_string(),
            would_have_been_selected: would_have_won,
        }
    });

    if scored.is_empty() {
        return SelectionOutcome {
            selected: None,
            scored,
            skipped,
            tier_exhausted: true,
            shadow,
        };
    }

    let selected = match tier.strategy {
        Strategy::Pool => weighted_random_pick(&scored, inputs.dry_run_seed),
        _ => pick_winner(tier.strategy, &scored),
    };

    SelectionOutcome {
        selected: Some(selected),
        scored,
        skipped,
        tier_exhausted: false,
        shadow,
    }
}

fn quality_score(position: isize) -> f64 {
    -(position as f64)
}

fn throughput_score(available: f64, hit_count: usize, penalty_weight: f64) -> f64 {
    available * (1.0 / (1.0 + hit_count as f64 * penalty_weight))
}

fn balanced_score(position: isize, max_position: isize, available: f64, max_concurrency: f64) -> f64 {
    let position_component = 1.0 - (position as f64 / (max_position as f64 + 1.0));
    let concurrency_component = if max_concurrency > 0.0 { available / max_concurrency } else { 0.0 };
    0.6 * position_component + 0.4 * concurrency_component
}

fn better_quality(a: &ScoredCandidate, b: &ScoredCandidate) -> bool {
    a.score > b.score
}

fn better_throughput(a: &ScoredCandidate, b: &ScoredCandidate) -> bool {
    if a.score != b.score {
        return a.score > b.score;
    }
    if a.cost_per_million != b.cost_per_million {
        return a.cost_per_million < b.cost_per_million;
    }
    if a.max_concurrency != b.max_concurrency {
        return a.max_concurrency > b.max_concurrency;
    }
    a.model < b.model
}

fn better_balanced(a: &ScoredCandidate, b: &ScoredCandidate) -> bool {
    if a.score != b.score {
        return a.score > b.score;
    }
    if a.cost_per_million != b.cost_per_million {
        return a.cost_per_million < b.cost_per_million;
    }
    a.model < b.model
}

/// Deterministic winner for every strategy but `pool` (which picks by
/// weighted random draw instead). Ties break on cost then concurrency then
/// model id, per strategy, so the same inputs always resolve the same way.
fn pick_winner(strategy: Strategy, scored: &[ScoredCandidate]) -> ScoredCandidate {
    let better: fn(&ScoredCandidate, &ScoredCandidate) -> bool = match strategy {
        Strategy::Quality => better_quality,
        Strategy::Throughput | Strategy::Pool => better_throughput,
        Strategy::Balanced => better_balanced,
    };
    scored
        .iter()
        .cloned()
        .reduce(|best, cand| if better(&cand, &best) { cand } else { best })
        .expect("scored is non-empty")
}

fn weighted_random_pick(scored: &[ScoredCandidate], seed: Option<u64>) -> ScoredCandidate {
    let total: f64 = scored.iter().map(|c| c.score.max(0.0001)).sum();
    let roll = match seed {
        Some(seed) => {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            rng.gen_range(0.0..total)
        }
        None => rand::thread_rng().gen_range(0.0..total),
    };

    let mut acc = 0.0;
    for cand in scored {
        acc += cand.score.max(0.0001);
        if roll < acc {
            return cand.clone();
        }
    }
    scored.last().cloned().expect("scored is non-empty")
}

fn roll_percent(seed: Option<u64>) -> f64 {
    match seed {
        Some(seed) => {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            rng.gen_range(0.0..100.0)
        }
        None => rand::thread_rng().gen_range(0.0..100.0),
    }
}
