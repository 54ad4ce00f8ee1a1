//! In-flight request accountant (spec §4.4, §5).
//!
//! Tracks how many requests are currently outstanding against each model so
//! the pool selector can treat "at capacity" the same way it treats
//! "on cooldown" — a scoring input, not an error. `try_acquire` is a
//! compare-and-swap loop rather than a read-then-write pair, so two
//! concurrent requests racing for the last slot can never both succeed
//! (the TOCTOU hazard called out in spec §5). Modeled on `litellm-rs`'s
//! `DeploymentState`, which keeps all of its hot counters as atomics updated
//! with `Ordering::Relaxed`/`AcqRel` rather than behind a lock.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct InFlightAccountant {
    counts: DashMap<String, AtomicU32>,
}

impl InFlightAccountant {
    pub fn new() -> Self {
        Self {
            counts: DashMap::new(),
        }
    }

    /// Attempt to reserve one in-flight slot for `model`. Returns `false`
    /// without side effects if `model` is already at `max_concurrency`.
    pub fn try_acquire(&self, model: &str, max_concurrency: u32) -> bool {
        let counter = self
            .counts
            .entry(model.to_string())
            .or_insert_with(|| AtomicU32::new(0));
        loop {
            let current = counter.load(Ordering::Acquire);
            if current >= max_concurrency {
                return false;
            }
            if counter
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release a previously acquired slot. A no-op, not a panic, if called
    /// on a model with no outstanding slots — callers on the request-failure
    /// path may race with a concurrent `release`. Removes the map entry once
    /// its count returns to zero rather than leaving a dangling zeroed
    /// counter behind for every model ever seen.
    pub fn release(&self, model: &str) {
        let became_zero = match self.counts.get(model) {
            Some(counter) => counter
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| (c > 0).then_some(c - 1))
                .map(|prev| prev == 1)
                .unwrap_or(false),
            None => false,
        };
        if became_zero {
            self.counts.remove_if(model, |_, v| v.load(Ordering::Acquire) == 0);
        }
    }

    pub fn current(&self, model: &str) -> u32 {
        self.counts
            .get(model)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Snapshot of every model with a nonzero count, for `getModelPoolSnapshot`.
    pub fn snapshot(&self) -> Vec<(String, u32)> {
        self.counts
            .iter()
            .filter_map(|r| {
                let count = r.value().load(Ordering::Acquire);
                (count > 0).then(|| (r.key().clone(), count))
            })
            .collect()
    }

    /// Deep copy for simulation (see `CooldownLedger::deep_clone`).
    pub fn deep_clone(&self) -> Self {
        let clone = Self::new();
        for r in self.counts.iter() {
            clone.counts.insert(r.key().clone(), AtomicU32::new(r.value().load(Ordering::Acquire)));
        }
        clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_succeeds_up_to_capacity_then_fails() {
        let acc = InFlightAccountant::new();
        assert!(acc.try_acquire("m", 2));
        assert!(acc.try_acquire("m", 2));
        assert!(!acc.try_acquire("m", 2));
        assert_eq!(acc.current("m"), 2);
    }

    #[test]
    fn release_frees_a_slot() {
        let acc = InFlightAccountant::new();
        acc.try_acquire("m", 1);
        acc.release("m");
        assert_eq!(acc.current("m"), 0);
        assert!(acc.try_acquire("m", 1));
    }

    #[test]
    fn snapshot_only_includes_models_with_a_nonzero_count() {
        let acc = InFlightAccountant::new();
        acc.try_acquire("a", 5);
        acc.try_acquire("b", 5);
        acc.release("b");
        assert_eq!(acc.snapshot(), vec![("a".to_string(), 1)]);
    }

    #[test]
    fn release_on_idle_model_is_a_no_op() {
        let acc = InFlightAccountant::new();
        acc.release("never-acquired");
        assert_eq!(acc.current("never-acquired"), 0);
    }

    #[test]
    fn release_removes_the_entry_once_the_count_reaches_zero() {
        let acc = InFlightAccountant::new();
        acc.try_acquire("m", 2);
        acc.release("m");
        assert_eq!(acc.counts.len(), 0, "zeroed entry should be removed, not just zeroed");
    }

    #[test]
    fn concurrent_acquires_never_exceed_capacity() {
        let acc = Arc::new(InFlightAccountant::new());
        let max = 5u32;
        let mut handles = Vec::new();
        for _ in 0..50 {
            let acc = acc.clone();
            handles.push(std::thread::spawn(move || acc.try_acquire("m", max)));
        }
        let granted: u32 = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count() as u32;
        assert_eq!(granted, max);
        assert_eq!(acc.current("m"), max);
    }
}
