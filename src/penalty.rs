//! 429 penalty window (spec §4.3).
//!
//! A sliding-window count of recent upstream 429s per model, used by the
//! pool selector to de-weight models that are getting rate-limited even
//! before they accumulate enough hits to trip a full cooldown. A
//! time-windowed counter keyed by model, counting past hits instead of gating
//! future ones.

use std::{collections::VecDeque, time::Instant};

use dashmap::DashMap;

use crate::config::Pool429PenaltyConfig;

#[derive(Debug, Default)]
pub struct PenaltyWindow {
    hits: DashMap<String, VecDeque<Instant>>,
}

impl PenaltyWindow {
    pub fn new() -> Self {
        Self {
            hits: DashMap::new(),
        }
    }

    /// Record a 429 against `model`.
    pub fn record_hit(&self, cfg: &Pool429PenaltyConfig, model: &str) {
        if !cfg.enabled {
            return;
        }
        let now = Instant::now();
        {
            let mut entry = self.hits.entry(model.to_string()).or_default();
            prune(&mut entry, cfg.window_ms, now);
            entry.push_back(now);
            while entry.len() > cfg.max_penalty_hits {
                entry.pop_front();
            }
        }
        self.evict_if_over_capacity(cfg.max_models);
    }

    /// Current (pruned) hit count for `model` within the window.
    pub fn hit_count(&self, cfg: &Pool429PenaltyConfig, model: &str) -> usize {
        if !cfg.enabled {
            return 0;
        }
        let now = Instant::now();
        let Some(mut entry) = self.hits.get_mut(model) else {
            return 0;
        };
        prune(&mut entry, cfg.window_ms, now);
        entry.len()
    }

    /// Score penalty to subtract from a candidate's pool score (§4.6):
    /// `min(hits, maxPenaltyHits) * penaltyWeight`.
    pub fn score_penalty(&self, cfg: &Pool429PenaltyConfig, model: &str) -> f64 {
        let hits = self.hit_count(cfg, model).min(cfg.max_penalty_hits);
        hits as f64 * cfg.penalty_weight
    }

    /// Snapshot of every tracked model's current (pruned) 429 hit count, for
    /// `getPool429PenaltyStats`.
    pub fn snapshot(&self, cfg: &Pool429PenaltyConfig) -> Vec<(String, usize)> {
        let now = Instant::now();
        self.hits
            .iter()
            .filter_map(|r| {
                let mut entry = r.value().clone();
                prune(&mut entry, cfg.window_ms, now);
                (!entry.is_empty()).then(|| (r.key().clone(), entry.len().min(cfg.max_penalty_hits)))
            })
            .collect()
    }

    /// Deep copy for simulation (see `CooldownLedger::deep_clone`).
    pub fn deep_clone(&self) -> Self {
        let clone = Self::new();
        for r in self.hits.iter() {
            clone.hits.insert(r.key().clone(), r.value().clone());
        }
        clone
    }

    fn evict_if_over_capacity(&self, max_models: usize) {
        while self.hits.len() > max_models {
            let oldest = self
                .hits
                .iter()
                .filter_map(|r| r.value().back().copied().map(|t| (r.key().clone(), t)))
                .min_by_key(|(_, t)| *t)
                .map(|(k, _)| k);
            match oldest {
                Some(key) => {
                    self.hits.remove(&key);
                }
                None => break,
            }
        }
    }
}

fn prune(entry: &mut VecDeque<Instant>, window_ms: u64, now: Instant) {
    let window = std::time::Duration::from_millis(window_ms);
    while let Some(&front) = entry.front() {
        if now.duration_since(front) >= window {
            entry.pop_front();
        } else {
            break;
        }
    }
}
