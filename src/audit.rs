//! Audit log sink (spec §1) — an injected interface for decisions worth a
//! durable record beyond the usual `tracing::warn!(error = %e, ...)` line:
//! tier downgrades, drift, and persistence failures, as a typed, swappable
//! trait rather than a hardcoded macro call, since the audit log is an
//! interface callers inject rather than a fixed logging statement.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum AuditEvent<'a> {
    TierDowngrade {
        requested_tier: Option<String>,
        fallback_tier: Option<String>,
        model: Option<&'a str>,
        reason: &'a str,
    },
    DriftDetected {
        tier: Option<String>,
        model: &'a str,
        reason: &'a str,
    },
    PersistenceFailed {
        target: &'a str,
        error: &'a str,
    },
}

/// Default is a no-op; callers that want a durable record inject
/// [`TracingSink`] or their own implementation.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent<'_>);
}

#[derive(Debug, Default)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn record(&self, _event: &AuditEvent<'_>) {}
}

/// Emits every event as a structured `warn!` — never `error!`, since none of
/// these are request failures (spec §7).
#[derive(Debug, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, event: &AuditEvent<'_>) {
        match event {
            AuditEvent::TierDowngrade { requested_tier, fallback_tier, model, reason } => {
                tracing::warn!(?requested_tier, ?fallback_tier, ?model, reason, "tier downgrade");
            }
            AuditEvent::DriftDetected { tier, model, reason } => {
                tracing::warn!(?tier, model, reason, "drift detected");
            }
            AuditEvent::PersistenceFailed { target, error } => {
                tracing::warn!(target, error, "persistence failed");
            }
        }
    }
}
