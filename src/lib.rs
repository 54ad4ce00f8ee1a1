//! Model routing and admission core for a GLM-family LLM proxy.
//!
//! Accepts Anthropic `/v1/messages`-shaped request bodies and decides, on
//! the synchronous request path, which backend model a request should
//! target — without ever blocking on a remote call. See [`router::Router`]
//! for the external surface.

pub mod admission;
pub mod audit;
pub mod classify;
pub mod config;
pub mod cooldown;
pub mod decision;
pub mod discovery;
pub mod drift;
pub mod error;
pub mod inflight;
pub mod overrides;
pub mod penalty;
pub mod persist;
pub mod pool;
pub mod router;
pub mod stats;
pub mod trace;

pub use audit::{AuditEvent, AuditSink};
pub use config::RoutingConfig;
pub use decision::Decision;
pub use discovery::{ModelDiscovery, ModelMeta};
pub use error::{RouterError, RouterResult};
pub use router::{Router, RouterOptions};
pub use trace::Trace;
