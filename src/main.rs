use std::path::PathBuf;

use anyhow::Context;
use tracing::info;

use glm_router_core::config::RoutingConfig;
use glm_router_core::discovery::{ModelDiscovery, ModelMeta};
use glm_router_core::router::{Router, RouterOptions};

/// Demo lookup service: serves fixed metadata for whatever model id it's
/// asked about rather than calling out to a real model directory — this
/// binary exists to walk one request through the router end to end, not to
/// stand up a server.
struct StaticDiscovery;

impl ModelDiscovery for StaticDiscovery {
    async fn get_model(&self, model_id: &str) -> anyhow::Result<ModelMeta> {
        Ok(ModelMeta {
            model_id: model_id.to_string(),
            context_window_tokens: 128_000,
            max_concurrency: 10,
            cost_per_million: 1.0,
            supports_vision: true,
            supports_tools: true,
            family: "glm".to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "glm_router_core=info".into()),
        )
        .init();

    let config_path = std::env::var("GLM_ROUTER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));

    let config = if config_path.exists() {
        RoutingConfig::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        info!(path = %config_path.display(), "no config file found, using a minimal default");
        default_demo_config()
    };

    info!(version = %config.version, "glm-router-core demo starting");

    let router = Router::new(config, StaticDiscovery, RouterOptions::default());
    router.warm_model_metadata("glm-4-plus").await.ok();

    let body = serde_json::json!({
        "model": "claude-3-opus",
        "max_tokens": 1024,
        "messages": [{"role": "user", "content": "hello"}]
    });

    match router.select_model("claude-3-opus", &body, &[]) {
        Some(decision) => {
            info!(decision = %serde_json::to_string_pretty(&decision)?, "routed");
        }
        None => {
            info!("router disabled or in shadow mode — no decision returned");
        }
    }

    Ok(())
}

fn default_demo_config() -> RoutingConfig {
    let raw = serde_json::json!({
        "tiers": {
            "heavy": { "models": ["glm-4-plus", "glm-4-air"], "strategy": "quality" }
        },
        "rules": [{ "match": { "model": "*" }, "tier": "heavy" }]
    });
    glm_router_core::config::normalize(&raw).config
}
