//! Model metadata lookup and its warm cache (ambient, supplemented — spec §1
//! describes model discovery as "an async lookup service with a synchronous
//! warm cache" but leaves the cache's shape unspecified).
//!
//! The decision engine (`src/decision.rs`) must stay synchronous and pure, so
//! it only ever reads [`DiscoveryCache::peek`]; population happens out of
//! band via [`DiscoveryCache::refresh`] — a read-through cache split between
//! whatever does the actual async I/O and the data `router.rs` reads back
//! out synchronously.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Static facts about a backend model needed for routing decisions —
/// context window for overflow checks, capability flags for rule matching,
/// and a family tag for the complexity-upgrade allow-list (§9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMeta {
    pub model_id: String,
    pub context_window_tokens: u64,
    /// Per-model concurrency cap, scaled by a process-wide `concurrencyMultiplier`
    /// (spec §5) to get the effective cap the in-flight accountant enforces.
    pub max_concurrency: u32,
    pub cost_per_million: f64,
    pub supports_vision: bool,
    pub supports_tools: bool,
    pub family: String,
}

/// Injected lookup service. Implementations do the actual network or
/// filesystem I/O; the router never calls this directly on the request path.
pub trait ModelDiscovery: Send + Sync {
    async fn get_model(&self, model_id: &str) -> anyhow::Result<ModelMeta>;
}

#[derive(Debug, Clone)]
struct CachedMeta {
    meta: ModelMeta,
    fetched_at: Instant,
}

/// Read-through warm cache in front of a [`ModelDiscovery`].
///
/// `peek` never blocks and never does I/O — it is what the synchronous
/// decision engine calls. `refresh` does the async lookup and populates the
/// cache for subsequent `peek` calls to see.
pub struct DiscoveryCache<D> {
    inner: D,
    cache: DashMap<String, CachedMeta>,
    ttl: Duration,
}

impl<D: ModelDiscovery> DiscoveryCache<D> {
    pub fn new(inner: D, ttl: Duration) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Synchronous, non-blocking read. Returns a stale entry rather than
    /// `None` if the TTL expired but nothing has refreshed it yet —
    /// "acceptable for observability, not SLA accounting" per the same
    /// tolerance spec §9 grants warmup tagging.
    pub fn peek(&self, model_id: &str) -> Option<ModelMeta> {
        self.cache.get(model_id).map(|e| e.meta.clone())
    }

    pub fn is_fresh(&self, model_id: &str) -> bool {
        self.cache
            .get(model_id)
            .is_some_and(|e| e.fetched_at.elapsed() < self.ttl)
    }

    /// Fetch from the injected discovery service and populate the cache.
    pub async fn refresh(&self, model_id: &str) -> anyhow::Result<ModelMeta> {
        let meta = self.inner.get_model(model_id).await?;
        self.cache.insert(
            model_id.to_string(),
            CachedMeta {
                meta: meta.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(meta)
    }

    /// Read-through: serve a fresh cache hit, otherwise refresh.
    pub async fn get(&self, model_id: &str) -> anyhow::Result<ModelMeta> {
        if self.is_fresh(model_id) {
            if let Some(meta) = self.peek(model_id) {
                return Ok(meta);
            }
        }
        self.refresh(model_id).await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;

    /// In-memory stand-in for a real discovery service, for tests that need
    /// a `ModelDiscovery` without any actual I/O.
    pub struct InMemoryDiscovery {
        pub models: HashMap<String, ModelMeta>,
    }

    impl ModelDiscovery for InMemoryDiscovery {
        async fn get_model(&self, model_id: &str) -> anyhow::Result<ModelMeta> {
            self.models
                .get(model_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown model `{model_id}`"))
        }
    }
}
