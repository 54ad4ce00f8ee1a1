//! Typed failure kinds for the router's admin-facing surface.
//!
//! Per the propagation policy: only catastrophic conditions — an invalid
//! configuration update, or a simulation fed an unsupported snapshot
//! version — are returned as an explicit `Err`. Everything else the router
//! can "fail" at (no routable model, context overflow, persistence falling
//! back to in-memory-only) is surfaced as data on a [`crate::decision::Decision`]
//! or an incremented counter, never as a propagated error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    /// `validateConfig`/`updateConfig` rejected the update outright. In-memory
    /// state is left untouched.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// Normalization succeeded but produced warnings (e.g. cross-tier
    /// duplicate models, an unknown strategy coerced to `balanced`). Routing
    /// continues; this is surfaced to the admin caller alongside the
    /// accepted config.
    #[error("configuration degraded: {0}")]
    ConfigurationDegraded(String),

    /// An override or config write failed. The in-memory state has already
    /// been applied; this only reports that the on-disk copy is stale.
    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    /// `simulateStatefulMode` was given a [`crate::trace::PoolSnapshot`] whose
    /// `version` is not `"1.0"`.
    #[error("unsupported snapshot version: {0}")]
    SnapshotUnsupported(String),
}

pub type RouterResult<T> = Result<T, RouterError>;
