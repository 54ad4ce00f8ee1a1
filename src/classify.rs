//! Feature extraction and classification (spec §4.5).
//!
//! Pulls a small, fixed feature vector out of an Anthropic `/v1/messages`-shaped
//! request body, then classifies it to a tier two ways: declared `rules[]`
//! (first match wins, in declaration order) and a fallback numeric/boolean
//! heuristic over `classifier.heavyThresholds`/`lightThresholds`. Pure
//! functions over already-parsed JSON — a standalone, unit-testable heuristic with no
//! network or lock dependency.

use serde_json::Value;

use crate::config::{ClassifierConfig, Rule, TierName, Thresholds};

/// The fixed feature vector extracted from a request (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFeatures {
    pub model: String,
    /// `null`/absent in the request body, not coerced to `0` — a missing
    /// `max_tokens` must fail a `maxTokensGte` predicate outright rather than
    /// silently compare against zero.
    pub max_tokens: Option<i64>,
    pub message_count: usize,
    pub system_length: usize,
    pub has_tools: bool,
    pub has_vision: bool,
    pub stream: bool,
    /// Total character count across all message/system text content, used
    /// only for token estimation — not part of the classifier's own surface.
    pub text_chars: usize,
    pub image_count: usize,
}

/// Extract [`RequestFeatures`] from a parsed Anthropic-shaped request body.
/// Missing or malformed fields degrade to safe defaults rather than failing
/// — feature extraction never rejects a request.
pub fn extract_features(body: &Value) -> RequestFeatures {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let max_tokens = body.get("max_tokens").and_then(Value::as_i64);
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let messages = body.get("messages").and_then(Value::as_array);
    let message_count = messages.map(Vec::len).unwrap_or(0);

    let mut text_chars = 0usize;
    let mut image_count = 0usize;
    let mut has_vision = false;

    if let Some(system) = body.get("system") {
        text_chars += system_text_len(system);
    }

    if let Some(messages) = messages {
        for m in messages {
            let Some(content) = m.get("content") else { continue };
            match content {
                Value::String(s) => text_chars += s.chars().count(),
                Value::Array(blocks) => {
                    for block in blocks {
                        match block.get("type").and_then(Value::as_str) {
                            Some("text") => {
                                text_chars += block
                                    .get("text")
                                    .and_then(Value::as_str)
                                    .map(|s| s.chars().count())
                                    .unwrap_or(0);
                            }
                            Some("image") => {
                                image_count += 1;
                                has_vision = true;
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let has_tools = body
        .get("tools")
        .and_then(Value::as_array)
        .map(|a| !a.is_empty())
        .unwrap_or(false);

    let system_length = body
        .get("system")
        .map(system_text_len)
        .unwrap_or(0);

    RequestFeatures {
        model,
        max_tokens,
        message_count,
        system_length,
        has_tools,
        has_vision,
        stream,
        text_chars,
        image_count,
    }
}

fn system_text_len(system: &Value) -> usize {
    match system {
        Value::String(s) => s.chars().count(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .map(|s| s.chars().count())
            .sum(),
        _ => 0,
    }
}

/// Rough prompt-token estimate: ~4 chars/token, ~260 tokens/image, scaled by
/// a 0.82 efficiency factor. Deliberately has no safety margin — it is an
/// estimate for context-overflow checks, not a billing figure.
pub fn estimate_tokens(features: &RequestFeatures) -> u64 {
    let text_tokens = features.text_chars as f64 / 4.0;
    let image_tokens = features.image_count as f64 * 260.0;
    ((text_tokens + image_tokens) * 0.82).round() as u64
}

/// Glob-match a model id against a pattern containing at most one `*`.
fn glob_match(pattern: &str, value: &str) -> bool {
    match pattern.find('*') {
        None => pattern == value,
        Some(idx) => {
            let (prefix, rest) = pattern.split_at(idx);
            let suffix = &rest[1..];
            value.len() >= prefix.len() + suffix.len()
                && value.starts_with(prefix)
                && value.ends_with(suffix)
        }
    }
}

fn rule_matches(rule_match: &crate::config::RuleMatch, f: &RequestFeatures) -> bool {
    if let Some(pattern) = &rule_match.model {
        if !glob_match(pattern, &f.model) {
            return false;
        }
    }
    if let Some(min) = rule_match.max_tokens_gte {
        match f.max_tokens {
            Some(v) if v >= min => {}
            _ => return false,
        }
    }
    if let Some(min) = rule_match.message_count_gte {
        if (f.message_count as i64) < min {
            return false;
        }
    }
    if let Some(expected) = rule_match.has_tools {
        if f.has_tools != expected {
            return false;
        }
    }
    if let Some(expected) = rule_match.has_vision {
        if f.has_vision != expected {
            return false;
        }
    }
    true
}

/// First matching declared rule, in declaration order.
pub fn classify_rules(rules: &[Rule], f: &RequestFeatures) -> Option<TierName> {
    rules.iter().find(|r| rule_matches(&r.match_, f)).map(|r| r.tier)
}

impl Thresholds {
    /// True if at least one field is set and the request satisfies it
    /// (logical OR across configured fields).
    fn any_match(&self, f: &RequestFeatures) -> bool {
        (self.max_tokens_gte.is_some_and(|t| f.max_tokens.is_some_and(|v| v >= t)))
            || (self.message_count_gte.is_some_and(|t| f.message_count as i64 >= t))
            || (self.system_length_gte.is_some_and(|t| f.system_length as i64 >= t))
            || (self.has_tools.is_some_and(|t| f.has_tools == t))
            || (self.has_vision.is_some_and(|t| f.has_vision == t))
    }

    /// `None` if no field is configured; otherwise whether every configured
    /// field matches (logical AND across configured fields).
    fn all_match(&self, f: &RequestFeatures) -> Option<bool> {
        let checks = [
            self.max_tokens_gte.map(|t| f.max_tokens.is_some_and(|v| v >= t)),
            self.message_count_gte.map(|t| f.message_count as i64 >= t),
            self.system_length_gte.map(|t| f.system_length as i64 >= t),
            self.has_tools.map(|t| f.has_tools == t),
            self.has_vision.map(|t| f.has_vision == t),
        ];
        let configured: Vec<bool> = checks.into_iter().flatten().collect();
        if configured.is_empty() {
            None
        } else {
            Some(configured.into_iter().all(|ok| ok))
        }
    }
}

/// Fallback numeric/boolean heuristic classifier (spec §4.5 step 3): used
/// only when no declared rule matched. Heavy thresholds are checked first
/// (any match promotes to heavy); light thresholds require every configured
/// field to match.
pub fn classify_heuristic(cfg: &ClassifierConfig, f: &RequestFeatures) -> Option<TierName> {
    if cfg.heavy_thresholds.any_match(f) {
        return Some(TierName::Heavy);
    }
    if cfg.light_thresholds.all_match(f) == Some(true) {
        return Some(TierName::Light);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn features(body: Value) -> RequestFeatures {
        extract_features(&body)
    }

    // -----------------------------------------------------------------------
    // extraction
    // -----------------------------------------------------------------------

    #[test]
    fn extracts_basic_fields() {
        let f = features(json!({
            "model": "claude-3-opus",
            "max_tokens": 1024,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(f.model, "claude-3-opus");
        assert_eq!(f.max_tokens, Some(1024));
        assert!(f.stream);
        assert_eq!(f.message_count, 1);
    }

    #[test]
    fn detects_tools_and_vision() {
        let f = features(json!({
            "model": "m",
            "tools": [{"name": "search"}],
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "what's in this?"},
                    {"type": "image", "source": {}}
                ]
            }]
        }));
        assert!(f.has_tools);
        assert!(f.has_vision);
        assert_eq!(f.image_count, 1);
    }

    #[test]
    fn missing_fields_degrade_to_defaults() {
        let f = features(json!({}));
        assert_eq!(f.model, "");
        assert_eq!(f.max_tokens, None);
        assert_eq!(f.message_count, 0);
        assert!(!f.has_tools);
        assert!(!f.has_vision);
    }

    #[test]
    fn system_prompt_length_counts_array_and_string_forms() {
        let f1 = features(json!({ "system": "abcde" }));
        assert_eq!(f1.system_length, 5);
        let f2 = features(json!({ "system": [{"type": "text", "text": "abcde"}, {"type": "text", "text": "fg"}] }));
        assert_eq!(f2.system_length, 7);
    }

    // -----------------------------------------------------------------------
    // token estimation
    // -----------------------------------------------------------------------

    #[test]
    fn estimates_tokens_from_chars_and_images() {
        let f = features(json!({
            "messages": [{"role": "user", "content": "x".repeat(400)}]
        }));
        // 400 chars / 4 = 100 tokens, * 0.82 efficiency = 82
        assert_eq!(estimate_tokens(&f), 82);
    }

    #[test]
    fn images_add_a_fixed_token_cost() {
        let f = features(json!({
            "messages": [{"role": "user", "content": [{"type": "image", "source": {}}]}]
        }));
        // 260 tokens * 0.82 = 213.2 -> rounds to 213
        assert_eq!(estimate_tokens(&f), 213);
    }

    // -----------------------------------------------------------------------
    // rule classification
    // -----------------------------------------------------------------------

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            Rule {
                match_: crate::config::RuleMatch { model: Some("claude-*".into()), ..Default::default() },
                tier: TierName::Heavy,
            },
            Rule {
                match_: crate::config::RuleMatch { model: Some("*".into()), ..Default::default() },
                tier: TierName::Light,
            },
        ];
        let f = features(json!({ "model": "claude-3-opus" }));
        assert_eq!(classify_rules(&rules, &f), Some(TierName::Heavy));

        let f2 = features(json!({ "model": "gpt-4o" }));
        assert_eq!(classify_rules(&rules, &f2), Some(TierName::Light));
    }

    #[test]
    fn no_rule_matches_returns_none() {
        let rules = vec![Rule {
            match_: crate::config::RuleMatch { model: Some("claude-*".into()), ..Default::default() },
            tier: TierName::Heavy,
        }];
        let f = features(json!({ "model": "gpt-4o" }));
        assert_eq!(classify_rules(&rules, &f), None);
    }

    // -----------------------------------------------------------------------
    // heuristic classification
    // -----------------------------------------------------------------------

    #[test]
    fn heavy_threshold_any_match_promotes_to_heavy() {
        let cfg = ClassifierConfig {
            heavy_thresholds: Thresholds { has_tools: Some(true), ..Default::default() },
            light_thresholds: Thresholds::default(),
        };
        let f = features(json!({ "tools": [{"name": "x"}] }));
        assert_eq!(classify_heuristic(&cfg, &f), Some(TierName::Heavy));
    }

    #[test]
    fn light_threshold_requires_all_configured_fields_to_match() {
        let cfg = ClassifierConfig {
            heavy_thresholds: Thresholds::default(),
            light_thresholds: Thresholds {
                max_tokens_gte: Some(1),
                has_tools: Some(false),
                ..Default::default()
            },
        };
        let f = features(json!({ "max_tokens": 10 }));
        assert_eq!(classify_heuristic(&cfg, &f), Some(TierName::Light));

        let f2 = features(json!({ "max_tokens": 10, "tools": [{"name": "x"}] }));
        assert_eq!(classify_heuristic(&cfg, &f2), None);
    }

    #[test]
    fn unconfigured_thresholds_never_match() {
        let cfg = ClassifierConfig::default();
        let f = features(json!({ "max_tokens": 999999 }));
        assert_eq!(classify_heuristic(&cfg, &f), None);
    }
}
