//! Per-model cooldown ledger (spec §4.2).
//!
//! A model placed on cooldown is not offered to the pool selector until its
//! cooldown expires. Repeated cooldowns back off exponentially; a cooldown
//! can only ever be extended, never shortened, by a later call; entries decay
//! away on their own once nobody has hit them for a while.

use std::time::Instant;

use dashmap::DashMap;

use crate::config::CooldownConfig;

#[derive(Debug, Clone)]
struct CooldownEntry {
    cooldown_until: Instant,
    /// Consecutive cooldown hits, used to scale the backoff. Burst-dampened
    /// hits do not advance this counter.
    count: u32,
    last_hit: Instant,
    last_burst_dampened: bool,
}

/// One model's entry in a detailed `getCooldowns` snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CooldownSnapshotEntry {
    pub remaining_ms: u64,
    pub count: u32,
    pub burst_dampened: bool,
}

/// Concurrent, bounded ledger of per-model cooldowns.
///
/// Backed by a `DashMap` of per-model entries — lookups and updates never block the request path
/// on a single global lock.
#[derive(Debug, Default)]
pub struct CooldownLedger {
    entries: DashMap<String, CooldownEntry>,
}

impl CooldownLedger {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record a cooldown hit for `model`. `retry_after_ms` is the
    /// upstream-supplied hint (e.g. a `Retry-After` header); `burst_dampened`
    /// suppresses the backoff counter's advance for hits that arrive while a
    /// cooldown is already active, so a burst of failures against an
    /// already-cooling model doesn't runaway the backoff.
    pub fn record_cooldown(&self, cfg: &CooldownConfig, model: &str, retry_after_ms: u64, burst_dampened: bool) {
        let now = Instant::now();
        let retry_after_ms = if retry_after_ms == 0 { cfg.default_ms } else { retry_after_ms };

        self.entries
            .entry(model.to_string())
            .and_modify(|e| {
                let count = if burst_dampened { e.count } else { e.count.saturating_add(1) };
                let backoff = cfg.backoff_multiplier.powi((count.saturating_sub(1)) as i32);
                let scaled_ms = (retry_after_ms as f64 * backoff).min(cfg.max_ms as f64) as u64;
                let candidate = now + std::time::Duration::from_millis(scaled_ms);
                // A cooldown may only be extended, never shortened, by a later hit.
                e.cooldown_until = e.cooldown_until.max(candidate);
                e.count = count;
                e.last_hit = now;
                e.last_burst_dampened = burst_dampened;
            })
            .or_insert_with(|| {
                let scaled_ms = retry_after_ms.min(cfg.max_ms);
                CooldownEntry {
                    cooldown_until: now + std::time::Duration::from_millis(scaled_ms),
                    count: 1,
                    last_hit: now,
                    last_burst_dampened: burst_dampened,
                }
            });

        self.evict_if_over_capacity(cfg.max_cooldown_entries);
    }

    /// Milliseconds remaining on `model`'s cooldown, or `0` if it has none,
    /// it has expired, or it has decayed away. Decay deletes the entry.
    pub fn get_cooldown(&self, cfg: &CooldownConfig, model: &str) -> u64 {
        let now = Instant::now();
        let Some(entry) = self.entries.get(model) else {
            return 0;
        };

        if now.duration_since(entry.last_hit) >= std::time::Duration::from_millis(cfg.decay_ms) {
            drop(entry);
            self.entries.remove(model);
            return 0;
        }

        if entry.cooldown_until <= now {
            return 0;
        }

        entry.cooldown_until.duration_since(now).as_millis() as u64
    }

    /// Remove a model's cooldown entirely (e.g. after a confirmed success).
    pub fn clear(&self, model: &str) {
        self.entries.remove(model);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every tracked model's remaining cooldown, for `getCooldowns`.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter_map(|r| {
                let remaining = r.cooldown_until.saturating_duration_since(now).as_millis() as u64;
                (remaining > 0).then(|| (r.key().clone(), remaining))
            })
            .collect()
    }

    /// Detailed snapshot of every tracked model's remaining cooldown, hit
    /// count, and whether its most recent hit was burst-dampened.
    pub fn snapshot_detailed(&self) -> Vec<(String, CooldownSnapshotEntry)> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter_map(|r| {
                let remaining = r.cooldown_until.saturating_duration_since(now).as_millis() as u64;
                (remaining > 0).then(|| {
                    (
                        r.key().clone(),
                        CooldownSnapshotEntry {
                            remaining_ms: remaining,
                            count: r.count,
                            burst_dampened: r.last_burst_dampened,
                        },
                    )
                })
            })
            .collect()
    }

    /// Deep copy for simulation: `simulateStatefulMode` runs the decision
    /// pipeline against cloned ledgers so the live ones are never touched.
    pub fn deep_clone(&self) -> Self {
        let clone = Self::new();
        for r in self.entries.iter() {
            clone.entries.insert(r.key().clone(), r.value().clone());
        }
        clone
    }

    fn evict_if_over_capacity(&self, max_entries: usize) {
        while self.entries.len() > max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|r| r.last_hit)
                .map(|r| r.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CooldownConfig {
        CooldownConfig {
            default_ms: 1_000,
            max_ms: 10_000,
            decay_ms: 60_000,
            backoff_multiplier: 2.0,
            max_cooldown_entries: 3,
            burst_dampening_factor: 1.0,
        }
    }

    #[test]
    fn fresh_model_has_no_cooldown() {
        let ledger = CooldownLedger::new();
        assert_eq!(ledger.get_cooldown(&cfg(), "glm-4-plus"), 0);
    }

    #[test]
    fn recorded_cooldown_is_reported_until_expiry() {
        let ledger = CooldownLedger::new();
        let cfg = cfg();
        ledger.record_cooldown(&cfg, "glm-4-plus", 5_000, false);
        let remaining = ledger.get_cooldown(&cfg, "glm-4-plus");
        assert!(remaining > 0 && remaining <= 5_000);
    }

    #[test]
    fn repeated_hits_back_off_exponentially_and_never_shorten() {
        let ledger = CooldownLedger::new();
        let cfg = cfg();
        ledger.record_cooldown(&cfg, "m", 1_000, false);
        let first = ledger.get_cooldown(&cfg, "m");
        ledger.record_cooldown(&cfg, "m", 1_000, false);
        let second = ledger.get_cooldown(&cfg, "m");
        assert!(second >= first, "second cooldown must not be shorter than the first");
    }

    #[test]
    fn backoff_is_capped_at_max_ms() {
        let ledger = CooldownLedger::new();
        let cfg = cfg();
        for _ in 0..10 {
            ledger.record_cooldown(&cfg, "m", 1_000, false);
        }
        assert!(ledger.get_cooldown(&cfg, "m") <= cfg.max_ms);
    }

    #[test]
    fn burst_dampened_hits_do_not_advance_backoff_counter() {
        let ledger = CooldownLedger::new();
        let cfg = cfg();
        ledger.record_cooldown(&cfg, "m", 1_000, false);
        let baseline = ledger.get_cooldown(&cfg, "m");
        ledger.record_cooldown(&cfg, "m", 1_000, true);
        let after_dampened = ledger.get_cooldown(&cfg, "m");
        // Dampened hit may refresh last_hit/extend slightly via max(), but must
        // not compound the exponential backoff multiplier again.
        assert!(after_dampened <= baseline + 1_000);
    }

    #[test]
    fn eviction_removes_oldest_entry_when_over_capacity() {
        let ledger = CooldownLedger::new();
        let cfg = cfg();
        ledger.record_cooldown(&cfg, "a", 1_000, false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        ledger.record_cooldown(&cfg, "b", 1_000, false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        ledger.record_cooldown(&cfg, "c", 1_000, false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        ledger.record_cooldown(&cfg, "d", 1_000, false);
        assert_eq!(ledger.len(), cfg.max_cooldown_entries);
        assert_eq!(ledger.get_cooldown(&cfg, "a"), 0, "oldest entry should have been evicted");
    }

    #[test]
    fn snapshot_detailed_reports_count_and_burst_dampened_flag() {
        let ledger = CooldownLedger::new();
        let cfg = cfg();
        ledger.record_cooldown(&cfg, "m", 1_000, false);
        ledger.record_cooldown(&cfg, "m", 1_000, true);
        let snap = ledger.snapshot_detailed();
        let (_, entry) = snap.iter().find(|(m, _)| m == "m").expect("m should be present");
        assert_eq!(entry.count, 1, "burst-dampened hit must not advance the count");
        assert!(entry.burst_dampened);
        assert!(entry.remaining_ms > 0);
    }

    #[test]
    fn clear_removes_a_models_cooldown() {
        let ledger = CooldownLedger::new();
        let cfg = cfg();
        ledger.record_cooldown(&cfg, "m", 1_000, false);
        ledger.clear("m");
        assert_eq!(ledger.get_cooldown(&cfg, "m"), 0);
    }
}
