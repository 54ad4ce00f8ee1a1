//! Override store (spec §4.11).
//!
//! Two layers: a live, in-memory set of admin-set pins (`setOverride`) and a
//! saved set loaded from persistence at startup. Live overrides always win;
//! saved overrides are consulted only when no live override exists, which is
//! how a restart resumes a pin an admin made before the process last
//! stopped. `RwLock`-free, swap-free concurrent-map shape, same as the
//! other per-model state maps in this crate.

use dashmap::DashMap;

use crate::error::{RouterError, RouterResult};

#[derive(Debug)]
pub struct OverrideStore {
    live: DashMap<String, String>,
    saved: DashMap<String, String>,
    max_overrides: usize,
}

impl OverrideStore {
    pub fn new(max_overrides: usize) -> Self {
        Self {
            live: DashMap::new(),
            saved: DashMap::new(),
            max_overrides,
        }
    }

    pub fn get_live(&self, requested_model: &str) -> Option<String> {
        self.live.get(requested_model).map(|v| v.clone())
    }

    pub fn get_saved(&self, requested_model: &str) -> Option<String> {
        self.saved.get(requested_model).map(|v| v.clone())
    }

    /// Pin `requested_model` to always resolve to `target_model`. Rejected
    /// once `max_overrides` live entries are already set — an override
    /// store is an admin safety valve, not a general-purpose routing table.
    pub fn set_override(&self, requested_model: &str, target_model: &str) -> RouterResult<()> {
        if !self.live.contains_key(requested_model) && self.live.len() >= self.max_overrides {
            return Err(RouterError::ConfigurationInvalid(format!(
                "override store is at capacity ({} entries)",
                self.max_overrides
            )));
        }
        self.live.insert(requested_model.to_string(), target_model.to_string());
        Ok(())
    }

    pub fn clear_override(&self, requested_model: &str) {
        self.live.remove(requested_model);
    }

    /// Load a saved snapshot (e.g. from `src/persist.rs` at startup). Does
    /// not touch live overrides.
    pub fn load_saved(&self, saved: impl IntoIterator<Item = (String, String)>) {
        self.saved.clear();
        for (k, v) in saved {
            self.saved.insert(k, v);
        }
    }

    pub fn snapshot_live(&self) -> Vec<(String, String)> {
        self.live.iter().map(|r| (r.key().clone(), r.value().clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_override_is_readable_after_set() {
        let store = OverrideStore::new(10);
        store.set_override("claude-3", "glm-4-plus").unwrap();
        assert_eq!(store.get_live("claude-3").as_deref(), Some("glm-4-plus"));
    }

    #[test]
    fn clear_removes_a_live_override() {
        let store = OverrideStore::new(10);
        store.set_override("claude-3", "glm-4-plus").unwrap();
        store.clear_override("claude-3");
        assert!(store.get_live("claude-3").is_none());
    }

    #[test]
    fn rejects_new_overrides_past_capacity() {
        let store = OverrideStore::new(1);
        store.set_override("a", "x").unwrap();
        assert!(store.set_override("b", "y").is_err());
    }

    #[test]
    fn updating_an_existing_key_does_not_count_against_capacity() {
        let store = OverrideStore::new(1);
        store.set_override("a", "x").unwrap();
        assert!(store.set_override("a", "z").is_ok());
        assert_eq!(store.get_live("a").as_deref(), Some("z"));
    }

    #[test]
    fn saved_override_is_used_only_when_no_live_override_exists() {
        let store = OverrideStore::new(10);
        store.load_saved([("claude-3".to_string(), "saved-model".to_string())]);
        assert_eq!(store.get_saved("claude-3").as_deref(), Some("saved-model"));
        store.set_override("claude-3", "live-model").unwrap();
        assert_eq!(store.get_live("claude-3").as_deref(), Some("live-model"));
    }
}
