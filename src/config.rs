//! Configuration types and the v1→v2 normalizer for `glm-router-core`.
//!
//! The canonical on-disk shape is v2 (`tiers[t] = { models, strategy }`);
//! legacy v1 configs (`tiers[t] = { targetModel, fallbackModels? }`) are
//! accepted and migrated in place by [`normalize`]. Config is loaded once,
//! normalized, validated, then handed to the router as an immutable
//! `Arc<RoutingConfig>` snapshot — parse, then validate, before the config is
//! ever live.

use std::{collections::HashMap, collections::HashSet, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named bucket of equivalent backend models. Fixed set — bounding tier
/// names to an enum keeps stat-bucket cardinality bounded (see `src/stats.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierName {
    Light,
    Medium,
    Heavy,
}

impl std::fmt::Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Light => "light",
            Self::Medium => "medium",
            Self::Heavy => "heavy",
        })
    }
}

impl TierName {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "light" => Some(Self::Light),
            "medium" => Some(Self::Medium),
            "heavy" => Some(Self::Heavy),
            _ => None,
        }
    }
}

/// The rule by which a tier picks among its ordered `models[]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Quality,
    Throughput,
    Balanced,
    Pool,
}

impl Default for Strategy {
    fn default() -> Self {
        Self::Balanced
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Quality => "quality",
            Self::Throughput => "throughput",
            Self::Balanced => "balanced",
            Self::Pool => "pool",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientModelPolicy {
    RuleMatchOnly,
    AlwaysRoute,
}

impl Default for ClientModelPolicy {
    fn default() -> Self {
        Self::RuleMatchOnly
    }
}

/// A tier's canonical (v2) configuration. Position 0 of `models` is the
/// "target"; the remainder are fallbacks in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub models: Vec<String>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub client_model_policy: ClientModelPolicy,
}

impl TierConfig {
    /// Position-0 model — the tier's preferred target.
    pub fn target(&self) -> Option<&str> {
        self.models.first().map(String::as_str)
    }
}

/// Numeric/boolean predicates used by both the rule matcher and the
/// threshold-based classifier heuristic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    #[serde(default)]
    pub max_tokens_gte: Option<i64>,
    #[serde(default)]
    pub message_count_gte: Option<i64>,
    #[serde(default)]
    pub system_length_gte: Option<i64>,
    #[serde(default)]
    pub has_tools: Option<bool>,
    #[serde(default)]
    pub has_vision: Option<bool>,
}

/// A single classification rule. First match (in declaration order) wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(rename = "match")]
    pub match_: RuleMatch,
    pub tier: TierName,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleMatch {
    /// Glob match against the request's `model` field. `*` is the only
    /// wildcard character that carries meaning.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens_gte: Option<i64>,
    #[serde(default)]
    pub message_count_gte: Option<i64>,
    #[serde(default)]
    pub has_tools: Option<bool>,
    #[serde(default)]
    pub has_vision: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierConfig {
    #[serde(default)]
    pub heavy_thresholds: Thresholds,
    #[serde(default)]
    pub light_thresholds: Thresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownConfig {
    pub default_ms: u64,
    pub max_ms: u64,
    pub decay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_cooldown_entries: usize,
    pub burst_dampening_factor: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            default_ms: 5_000,
            max_ms: 300_000,
            decay_ms: 600_000,
            backoff_multiplier: 2.0,
            max_cooldown_entries: 500,
            burst_dampening_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    pub max_model_switches_per_request: usize,
    pub allow_tier_downgrade: bool,
    pub downgrade_order: Vec<TierName>,
    pub max_tier_downgrades_per_request: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_model_switches_per_request: 3,
            allow_tier_downgrade: false,
            downgrade_order: Vec::new(),
            max_tier_downgrades_per_request: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool429PenaltyConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub penalty_weight: f64,
    pub max_penalty_hits: usize,
    pub max_models: usize,
}

impl Default for Pool429PenaltyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            penalty_weight: 0.5,
            max_penalty_hits: 20,
            max_models: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Glm5Config {
    pub enabled: bool,
    pub preference_percent: u8,
}

impl Default for Glm5Config {
    fn default() -> Self {
        Self {
            enabled: true,
            preference_percent: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityUpgradeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_families: Vec<String>,
    #[serde(default)]
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceConfig {
    pub sampling_rate: f64,
    pub max_payload_size: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 10.0,
            max_payload_size: 100 * 1024,
        }
    }
}

impl TraceConfig {
    const MIN_PAYLOAD: usize = 10 * 1024;
    const MAX_PAYLOAD: usize = 1024 * 1024;

    fn clamp(&mut self) {
        self.sampling_rate = self.sampling_rate.clamp(0.0, 100.0);
        self.max_payload_size = self.max_payload_size.clamp(Self::MIN_PAYLOAD, Self::MAX_PAYLOAD);
    }
}

/// Canonical (v2) routing configuration. Immutable snapshot, replaced
/// wholesale by `Router::update_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    pub enabled: bool,
    pub shadow_mode: bool,
    pub default_model: Option<String>,
    pub version: String,
    pub tiers: HashMap<TierName, TierConfig>,
    pub rules: Vec<Rule>,
    pub classifier: ClassifierConfig,
    pub cooldown: CooldownConfig,
    pub failover: FailoverConfig,
    pub pool429_penalty: Pool429PenaltyConfig,
    pub glm5: Glm5Config,
    pub complexity_upgrade: ComplexityUpgradeConfig,
    pub trace: TraceConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shadow_mode: false,
            default_model: None,
            version: "2.0".to_string(),
            tiers: HashMap::new(),
            rules: Vec::new(),
            classifier: ClassifierConfig::default(),
            cooldown: CooldownConfig::default(),
            failover: FailoverConfig::default(),
            pool429_penalty: Pool429PenaltyConfig::default(),
            glm5: Glm5Config::default(),
            complexity_upgrade: ComplexityUpgradeConfig::default(),
            trace: TraceConfig::default(),
        }
    }
}

impl RoutingConfig {
    pub fn tier(&self, name: TierName) -> Option<&TierConfig> {
        self.tiers.get(&name)
    }

    /// Whether any tier declares `clientModelPolicy: always-route` — this
    /// gates whether the threshold heuristic ever runs (spec §4.5 step 2).
    pub fn heuristic_enabled(&self) -> bool {
        self.tiers
            .values()
            .any(|t| t.client_model_policy == ClientModelPolicy::AlwaysRoute)
    }

    /// Load, validate, and normalize a config from a JSON file on disk.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let raw: Value = serde_json::from_str(&content).context("parsing config JSON")?;
        Self::from_raw(&raw)
    }

    /// Parse a raw JSON/legacy value into a validated, normalized config.
    pub fn from_raw(raw: &Value) -> anyhow::Result<Self> {
        let validated = validate_config(raw);
        anyhow::ensure!(
            validated.valid,
            "{}",
            validated.error.unwrap_or_else(|| "invalid configuration".into())
        );
        let outcome = normalize(raw);
        for w in &outcome.warnings {
            tracing::warn!(warning = %w, "config normalization warning");
        }
        Ok(outcome.config)
    }

    /// Convenience entry point for operators migrating from an older
    /// TOML-based config — parsed into JSON, then run through the
    /// same normalizer as everything else.
    pub fn from_legacy_toml(raw_toml: &str) -> anyhow::Result<NormalizeOutcome> {
        let value: toml::Value = toml::from_str(raw_toml).context("parsing legacy TOML config")?;
        let json = serde_json::to_value(value).context("converting TOML config to JSON")?;
        Ok(normalize(&json))
    }
}

/// Result of [`normalize`].
#[derive(Debug, Clone)]
pub struct NormalizeOutcome {
    pub config: RoutingConfig,
    pub migrated: bool,
    pub warnings: Vec<String>,
}

/// Pure, total v1→v2 config normalizer (spec §4.1).
///
/// Never fails: tiers with no resolvable model are dropped (with a
/// warning) rather than rejected. Callers that need a hard failure on
/// malformed input should call [`validate_config`] first.
pub fn normalize(raw: &Value) -> NormalizeOutcome {
    let mut warnings = Vec::new();
    let mut migrated_any = false;

    let mut tiers = HashMap::new();
    if let Some(raw_tiers) = raw.get("tiers").and_then(Value::as_object) {
        for (name_str, tv) in raw_tiers {
            let Some(tier_name) = TierName::parse(name_str) else {
                warnings.push(format!("unknown tier name `{name_str}` ignored"));
                continue;
            };
            let (maybe_tier, migrated) = normalize_tier(name_str, tv, &mut warnings);
            migrated_any |= migrated;
            if let Some(tier) = maybe_tier {
                tiers.insert(tier_name, tier);
            }
        }
    }

    let rules: Vec<Rule> = raw
        .get("rules")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|r| serde_json::from_value(r.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    let classifier = from_value_or_default(raw.get("classifier"));
    let cooldown = from_value_or_default(raw.get("cooldown"));
    let failover = from_value_or_default(raw.get("failover"));
    let pool429_penalty = from_value_or_default(raw.get("pool429Penalty"));
    let glm5 = from_value_or_default(raw.get("glm5"));
    let complexity_upgrade = from_value_or_default(raw.get("complexityUpgrade"));
    let mut trace: TraceConfig = from_value_or_default(raw.get("trace"));
    trace.clamp();

    let enabled = raw.get("enabled").and_then(Value::as_bool).unwrap_or(true);
    let shadow_mode = raw.get("shadowMode").and_then(Value::as_bool).unwrap_or(false);
    let default_model = raw
        .get("defaultModel")
        .and_then(Value::as_str)
        .map(String::from);

    let config = RoutingConfig {
        enabled,
        shadow_mode,
        default_model,
        version: "2.0".to_string(),
        tiers,
        rules,
        classifier,
        cooldown,
        failover,
        pool429_penalty,
        glm5,
        complexity_upgrade,
        trace,
    };

    NormalizeOutcome {
        config,
        migrated: migrated_any,
        warnings,
    }
}

fn from_value_or_default<T: Default + for<'de> Deserialize<'de>>(v: Option<&Value>) -> T {
    v.cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Normalize one tier's raw JSON (either v1 or v2 shaped) into canonical form.
///
/// Returns `(None, _)` when the tier has no resolvable model — the caller
/// drops it from the config entirely.
fn normalize_tier(name: &str, v: &Value, warnings: &mut Vec<String>) -> (Option<TierConfig>, bool) {
    let Some(obj) = v.as_object() else {
        warnings.push(format!("tier `{name}` is not an object — ignored"));
        return (None, false);
    };

    let is_v1 = obj.contains_key("targetModel") && !obj.contains_key("models");

    let (raw_models, migrated) = if is_v1 {
        let mut list = Vec::new();
        if let Some(t) = obj.get("targetModel").and_then(Value::as_str) {
            list.push(t.to_string());
        }
        if let Some(fallbacks) = obj.get("fallbackModels").and_then(Value::as_array) {
            list.extend(fallbacks.iter().filter_map(|m| m.as_str().map(String::from)));
        } else if let Some(f) = obj.get("failoverModel").and_then(Value::as_str) {
            list.push(f.to_string());
        }
        (list, true)
    } else {
        let list = obj
            .get("models")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|x| x.as_str().map(String::from)).collect())
            .unwrap_or_default();
        (list, false)
    };

    let mut seen = HashSet::new();
    let models: Vec<String> = raw_models
        .into_iter()
        .filter(|m| !m.is_empty() && seen.insert(m.clone()))
        .collect();

    if models.is_empty() {
        warnings.push(format!("tier `{name}` has no resolvable model — dropped"));
        return (None, migrated);
    }

    let models = if models.len() > 10 {
        warnings.push(format!(
            "tier `{name}` had {} models — truncated to 10",
            models.len()
        ));
        models.into_iter().take(10).collect()
    } else {
        models
    };

    let strategy = match obj.get("strategy").and_then(Value::as_str) {
        None => Strategy::Balanced,
        Some(s) => serde_json::from_value::<Strategy>(Value::String(s.to_string())).unwrap_or_else(|_| {
            warnings.push(format!(
                "tier `{name}` has unknown strategy `{s}` — coerced to balanced"
            ));
            Strategy::Balanced
        }),
    };

    let label = obj.get("label").and_then(Value::as_str).map(String::from);
    let client_model_policy = obj
        .get("clientModelPolicy")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_value::<ClientModelPolicy>(Value::String(s.to_string())).ok())
        .unwrap_or_default();

    (
        Some(TierConfig {
            models,
            strategy,
            label,
            client_model_policy,
        }),
        migrated,
    )
}

/// Result of [`validate_config`].
#[derive(Debug, Clone, Default)]
pub struct ValidateOutcome {
    pub valid: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

const META_ONLY_KEYS: &[&str] = &[
    "persistConfigEdits",
    "configFile",
    "overridesFile",
    "maxOverrides",
];

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "enabled",
    "shadowMode",
    "defaultModel",
    "version",
    "tiers",
    "rules",
    "classifier",
    "cooldown",
    "failover",
    "pool429Penalty",
    "glm5",
    "complexityUpgrade",
    "trace",
];

/// Static validation of a config update (spec §6). Does not mutate or
/// normalize anything — call [`normalize`] afterward to get a usable config.
pub fn validate_config(raw: &Value) -> ValidateOutcome {
    let mut warnings = Vec::new();

    let Some(obj) = raw.as_object() else {
        return ValidateOutcome {
            valid: false,
            error: Some("config update must be a JSON object".into()),
            warnings,
        };
    };

    for key in obj.keys() {
        if META_ONLY_KEYS.contains(&key.as_str()) {
            return ValidateOutcome {
                valid: false,
                error: Some(format!(
                    "`{key}` is a meta-only key and cannot be set at runtime"
                )),
                warnings,
            };
        }
        if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
            return ValidateOutcome {
                valid: false,
                error: Some(format!("unknown top-level key `{key}`")),
                warnings,
            };
        }
    }

    let mut tier_model_owner: HashMap<String, String> = HashMap::new();
    if let Some(tiers) = obj.get("tiers") {
        let Some(tiers_obj) = tiers.as_object() else {
            return ValidateOutcome {
                valid: false,
                error: Some("`tiers` must be an object".into()),
                warnings,
            };
        };
        for (name, tv) in tiers_obj {
            let Some(tobj) = tv.as_object() else {
                return ValidateOutcome {
                    valid: false,
                    error: Some(format!("tier `{name}` must be an object")),
                    warnings,
                };
            };

            let has_models = tobj.contains_key("models");
            let has_target = tobj.contains_key("targetModel");
            if !has_models && !has_target {
                return ValidateOutcome {
                    valid: false,
                    error: Some(format!(
                        "tier `{name}` missing `models` (or legacy `targetModel`)"
                    )),
                    warnings,
                };
            }

            if has_models {
                let Some(models) = tobj.get("models").and_then(Value::as_array) else {
                    return ValidateOutcome {
                        valid: false,
                        error: Some(format!("tier `{name}`.models must be an array")),
                        warnings,
                    };
                };
                if models.is_empty() {
                    return ValidateOutcome {
                        valid: false,
                        error: Some(format!("tier `{name}`.models must be non-empty")),
                        warnings,
                    };
                }
                if models.len() > 10 {
                    return ValidateOutcome {
                        valid: false,
                        error: Some(format!("tier `{name}` has more than 10 models")),
                        warnings,
                    };
                }
                for m in models {
                    let Some(ms) = m.as_str() else {
                        return ValidateOutcome {
                            valid: false,
                            error: Some(format!("tier `{name}`.models must contain only strings")),
                            warnings,
                        };
                    };
                    match tier_model_owner.get(ms) {
                        Some(owner) if owner != name => {
                            warnings.push(format!(
                                "model `{ms}` appears in both tier `{owner}` and `{name}`"
                            ));
                        }
                        Some(_) => {}
                        None => {
                            tier_model_owner.insert(ms.to_string(), name.clone());
                        }
                    }
                }
            }

            if let Some(strategy) = tobj.get("strategy").and_then(Value::as_str) {
                if !matches!(strategy, "quality" | "throughput" | "balanced" | "pool") {
                    return ValidateOutcome {
                        valid: false,
                        error: Some(format!("tier `{name}` has invalid strategy `{strategy}`")),
                        warnings,
                    };
                }
            }
        }
    }

    let rules_nonempty = obj
        .get("rules")
        .and_then(Value::as_array)
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    if rules_nonempty {
        let rules = obj.get("rules").unwrap().as_array().unwrap();
        let has_catch_all = rules.iter().any(|r| {
            r.get("match")
                .and_then(|m| m.get("model"))
                .and_then(Value::as_str)
                == Some("*")
        });
        let has_default = obj
            .get("defaultModel")
            .and_then(Value::as_str)
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !has_catch_all && !has_default {
            return ValidateOutcome {
                valid: false,
                error: Some(
                    "rules are defined but no catch-all rule (`model: \"*\"`) or `defaultModel` exists"
                        .into(),
                ),
                warnings,
            };
        }
    }

    if let Some(failover) = obj.get("failover") {
        if let Some(max_switches) = failover.get("maxModelSwitchesPerRequest").and_then(Value::as_u64) {
            if let Some(tiers) = obj.get("tiers").and_then(Value::as_object) {
                let max_models = tiers
                    .values()
                    .filter_map(|t| t.get("models"))
                    .filter_map(Value::as_array)
                    .map(|a| a.len())
                    .max()
                    .unwrap_or(0);
                if (max_switches as usize) > max_models {
                    warnings.push(format!(
                        "failover.maxModelSwitchesPerRequest ({max_switches}) exceeds the largest tier's model count ({max_models})"
                    ));
                }
            }
        }
    }

    ValidateOutcome {
        valid: true,
        error: None,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // normalize — v1 → v2 migration
    // -----------------------------------------------------------------------

    #[test]
    fn migrates_v1_tier_with_fallback_models() {
        let raw = json!({
            "tiers": {
                "heavy": {
                    "targetModel": "glm-4-plus",
                    "fallbackModels": ["glm-4-air", "glm-4-flash"]
                }
            }
        });
        let out = normalize(&raw);
        assert!(out.migrated);
        let tier = out.config.tier(TierName::Heavy).unwrap();
        assert_eq!(tier.models, vec!["glm-4-plus", "glm-4-air", "glm-4-flash"]);
        assert_eq!(tier.strategy, Strategy::Balanced);
    }

    #[test]
    fn migrates_v1_tier_with_failover_model_when_no_fallback_list() {
        let raw = json!({
            "tiers": { "medium": { "targetModel": "a", "failoverModel": "b" } }
        });
        let out = normalize(&raw);
        assert!(out.migrated);
        assert_eq!(out.config.tier(TierName::Medium).unwrap().models, vec!["a", "b"]);
    }

    #[test]
    fn v2_tier_is_not_flagged_as_migrated() {
        let raw = json!({
            "tiers": { "light": { "models": ["a", "b"], "strategy": "pool" } }
        });
        let out = normalize(&raw);
        assert!(!out.migrated);
        assert_eq!(out.config.tier(TierName::Light).unwrap().strategy, Strategy::Pool);
    }

    #[test]
    fn dedupes_models_preserving_first_occurrence() {
        let raw = json!({
            "tiers": { "light": { "models": ["a", "b", "a", "c"] } }
        });
        let out = normalize(&raw);
        assert_eq!(out.config.tier(TierName::Light).unwrap().models, vec!["a", "b", "c"]);
    }

    #[test]
    fn tier_with_no_resolvable_model_is_dropped() {
        let raw = json!({ "tiers": { "light": { "models": [] } } });
        let out = normalize(&raw);
        assert!(out.config.tier(TierName::Light).is_none());
        assert!(out.warnings.iter().any(|w| w.contains("no resolvable model")));
    }

    #[test]
    fn unknown_strategy_coerced_to_balanced_with_warning() {
        let raw = json!({ "tiers": { "light": { "models": ["a"], "strategy": "bogus" } } });
        let out = normalize(&raw);
        assert_eq!(out.config.tier(TierName::Light).unwrap().strategy, Strategy::Balanced);
        assert!(out.warnings.iter().any(|w| w.contains("unknown strategy")));
    }

    #[test]
    fn normalize_is_idempotent() {
        let raw = json!({
            "tiers": { "heavy": { "targetModel": "a", "fallbackModels": ["b"] } }
        });
        let once = normalize(&raw);
        let twice_input = serde_json::to_value(&once.config).unwrap();
        let twice = normalize(&twice_input);
        assert!(!twice.migrated, "re-normalizing an already-v2 config must not report migrated");
    }

    // -----------------------------------------------------------------------
    // validate_config
    // -----------------------------------------------------------------------

    #[test]
    fn rejects_unknown_top_level_key() {
        let out = validate_config(&json!({ "bogus": true }));
        assert!(!out.valid);
        assert!(out.error.unwrap().contains("unknown top-level key"));
    }

    #[test]
    fn rejects_meta_only_key() {
        let out = validate_config(&json!({ "maxOverrides": 10 }));
        assert!(!out.valid);
        assert!(out.error.unwrap().contains("meta-only"));
    }

    #[test]
    fn rejects_tier_missing_models_and_target_model() {
        let out = validate_config(&json!({ "tiers": { "light": {} } }));
        assert!(!out.valid);
    }

    #[test]
    fn rejects_models_length_over_ten() {
        let models: Vec<String> = (0..11).map(|i| format!("m{i}")).collect();
        let out = validate_config(&json!({ "tiers": { "light": { "models": models } } }));
        assert!(!out.valid);
    }

    #[test]
    fn rejects_invalid_strategy() {
        let out = validate_config(&json!({ "tiers": { "light": { "models": ["a"], "strategy": "bogus" } } }));
        assert!(!out.valid);
    }

    #[test]
    fn rejects_rules_without_catch_all_or_default_model() {
        let out = validate_config(&json!({
            "rules": [{ "match": { "hasTools": true }, "tier": "heavy" }]
        }));
        assert!(!out.valid);
    }

    #[test]
    fn accepts_rules_with_catch_all() {
        let out = validate_config(&json!({
            "rules": [{ "match": { "model": "*" }, "tier": "medium" }]
        }));
        assert!(out.valid);
    }

    #[test]
    fn accepts_rules_with_default_model_set() {
        let out = validate_config(&json!({
            "defaultModel": "glm-4-air",
            "rules": [{ "match": { "hasVision": true }, "tier": "heavy" }]
        }));
        assert!(out.valid);
    }

    #[test]
    fn warns_on_cross_tier_duplicate_models() {
        let out = validate_config(&json!({
            "tiers": {
                "light": { "models": ["shared-model"] },
                "medium": { "models": ["shared-model"] }
            }
        }));
        assert!(out.valid);
        assert!(out.warnings.iter().any(|w| w.contains("shared-model")));
    }

    #[test]
    fn warns_when_max_switches_exceeds_model_count() {
        let out = validate_config(&json!({
            "tiers": { "light": { "models": ["a", "b"] } },
            "failover": { "maxModelSwitchesPerRequest": 99 }
        }));
        assert!(out.valid);
        assert!(out.warnings.iter().any(|w| w.contains("exceeds")));
    }

    // -----------------------------------------------------------------------
    // Trace config clamping
    // -----------------------------------------------------------------------

    #[test]
    fn trace_sampling_rate_is_clamped_to_0_100() {
        let raw = json!({ "trace": { "samplingRate": 250.0, "maxPayloadSize": 1 } });
        let out = normalize(&raw);
        assert_eq!(out.config.trace.sampling_rate, 100.0);
        assert_eq!(out.config.trace.max_payload_size, 10 * 1024);
    }
}
