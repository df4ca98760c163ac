//! Request complexity classifier.
//!
//! Runs a heuristic pre-filter over the request shape first; if that isn't
//! confident, falls through to a pluggable ML-style score mapped onto the
//! tier ladder via descending thresholds. Never raises to the caller — any
//! missing signal or scorer error returns the caller-supplied default tier.

use async_trait::async_trait;
use serde_json::Value;

use super::config::ClassifierConfig;

/// External scorer boundary, in place of the original's `routellm.controller.Controller`.
/// Returns a scalar win-rate-like score in `[0, 1]`; higher means the request
/// needs a stronger model.
#[async_trait]
pub trait ComplexityScorer: Send + Sync {
    async fn score(&self, prompt: &str) -> Result<f64, String>;
}

/// Deterministic fallback scorer so `SMART_ROUTER_ENABLED=true` without an
/// external ML scorer configured still produces a sensible score instead of
/// always degrading to the default tier. Not a substitute for a real
/// classifier — just length/shape heuristics bucketed into `[0, 1]`.
pub struct HeuristicScorer;

#[async_trait]
impl ComplexityScorer for HeuristicScorer {
    async fn score(&self, prompt: &str) -> Result<f64, String> {
        if prompt.is_empty() {
            return Err("empty prompt".to_string());
        }
        let len = prompt.chars().count() as f64;
        let question_marks = prompt.matches('?').count() as f64;
        let code_fences = prompt.matches("```").count() as f64;
        let raw = (len / 2000.0) + (question_marks * 0.05) + (code_fences * 0.15);
        Ok(raw.clamp(0.0, 1.0))
    }
}

fn text_block_len(content: &Value) -> usize {
    match content {
        Value::String(s) => s.chars().count(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .map(|b| {
                b.get("text")
                    .and_then(Value::as_str)
                    .map(|t| t.chars().count())
                    .unwrap_or(0)
            })
            .sum(),
        _ => 0,
    }
}

fn text_block_string(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Last `user` message's text, concatenating `text`-typed blocks if content
/// is a list. Empty string if there is no user message.
fn extract_prompt_text(messages: &[Value]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .map(|m| text_block_string(m.get("content").unwrap_or(&Value::Null)))
        .unwrap_or_default()
}

fn last_user_text_len(messages: &[Value]) -> usize {
    messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .map(|m| text_block_len(m.get("content").unwrap_or(&Value::Null)))
        .unwrap_or(0)
}

fn is_truthy(v: Option<&Value>) -> bool {
    match v {
        None => false,
        Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

/// Obvious-case pre-filter. `None` means "needs ML classification".
fn heuristic_classify(body: &Value, tier_order: &[String]) -> Option<String> {
    let highest = tier_order.first()?;
    let lowest = tier_order.last()?;

    let messages = body.get("messages").and_then(Value::as_array);
    let msg_count = messages.map(|m| m.len()).unwrap_or(0);
    let tool_count = body
        .get("tools")
        .and_then(Value::as_array)
        .map(|t| t.len())
        .unwrap_or(0);
    let last_user_len = messages.map(last_user_text_len).unwrap_or(0);

    if msg_count <= 3 && tool_count == 0 && last_user_len < 200 {
        return Some(lowest.clone());
    }
    if msg_count > 20 || tool_count > 5 {
        return Some(highest.clone());
    }
    if is_truthy(body.get("thinking")) || is_truthy(body.get("extended_thinking")) {
        return Some(highest.clone());
    }
    None
}

/// Classifies a request body into one of `tier_order`'s entries.
///
/// Runs the heuristic pre-filter first (if `config.heuristic_bypass`), then
/// falls through to `scorer` and walks descending thresholds: the first
/// `thresholds[i]` the score exceeds yields `tier_order[i]`; if none match,
/// yields the lowest tier. Any missing tier order, missing scorer, empty
/// prompt, or scorer error returns `default_tier` — this function never
/// raises to the caller.
pub async fn classify_request(
    body: &Value,
    config: &ClassifierConfig,
    tier_order: &[String],
    scorer: Option<&(dyn ComplexityScorer)>,
    default_tier: &str,
) -> String {
    if tier_order.is_empty() {
        return default_tier.to_string();
    }

    if config.heuristic_bypass {
        if let Some(tier) = heuristic_classify(body, tier_order) {
            tracing::debug!(tier, "heuristic classified request");
            return tier;
        }
    }

    let Some(scorer) = scorer else {
        tracing::debug!("no complexity scorer configured, using default tier");
        return default_tier.to_string();
    };

    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let prompt = extract_prompt_text(&messages);
    if prompt.is_empty() {
        return default_tier.to_string();
    }

    match scorer.score(&prompt).await {
        Ok(score) => {
            let mut tier = tier_order.last().expect("non-empty checked above").clone();
            for (i, threshold) in config.thresholds.iter().enumerate() {
                if score > *threshold {
                    tier = tier_order[i].clone();
                    break;
                }
            }
            tracing::info!(score, tier, "classifier score mapped to tier");
            tier
        }
        Err(e) => {
            tracing::warn!(error = %e, default_tier, "classification failed, using default tier");
            default_tier.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tiers() -> Vec<String> {
        vec!["tier1".into(), "tier2".into(), "tier3".into()]
    }

    fn default_classifier_config() -> ClassifierConfig {
        ClassifierConfig {
            router: "mf".into(),
            thresholds: vec![0.7, 0.3],
            heuristic_bypass: true,
        }
    }

    #[tokio::test]
    async fn short_conversation_no_tools_goes_lowest() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let tier = classify_request(&body, &default_classifier_config(), &tiers(), None, "tier2").await;
        assert_eq!(tier, "tier3");
    }

    #[tokio::test]
    async fn many_messages_goes_highest() {
        let messages: Vec<Value> = (0..25)
            .map(|i| json!({"role": "user", "content": format!("msg {i}")}))
            .collect();
        let body = json!({"messages": messages});
        let tier = classify_request(&body, &default_classifier_config(), &tiers(), None, "tier2").await;
        assert_eq!(tier, "tier1");
    }

    #[tokio::test]
    async fn many_tools_goes_highest() {
        let tools: Vec<Value> = (0..6).map(|i| json!({"name": format!("tool{i}")})).collect();
        let body = json!({"messages": [{"role": "user", "content": "x"}], "tools": tools});
        let tier = classify_request(&body, &default_classifier_config(), &tiers(), None, "tier2").await;
        assert_eq!(tier, "tier1");
    }

    #[tokio::test]
    async fn thinking_flag_goes_highest() {
        let body = json!({
            "messages": [
                {"role": "user", "content": "a"},
                {"role": "assistant", "content": "b"},
                {"role": "user", "content": "c"},
                {"role": "user", "content": "d"}
            ],
            "thinking": {"budget_tokens": 5000},
        });
        let tier = classify_request(&body, &default_classifier_config(), &tiers(), None, "tier2").await;
        assert_eq!(tier, "tier1");
    }

    #[tokio::test]
    async fn no_scorer_mid_sized_request_uses_default() {
        // 4 messages, no tools, long enough to dodge the lowest-tier
        // shortcut but not so many as to trip the highest-tier shortcut.
        let long_text = "x".repeat(500);
        let body = json!({
            "messages": [
                {"role": "user", "content": "setup"},
                {"role": "assistant", "content": "ok"},
                {"role": "user", "content": "followup"},
                {"role": "user", "content": long_text}
            ],
        });
        let tier = classify_request(&body, &default_classifier_config(), &tiers(), None, "tier2").await;
        assert_eq!(tier, "tier2");
    }

    #[tokio::test]
    async fn scorer_walks_descending_thresholds() {
        struct FixedScorer(f64);
        #[async_trait]
        impl ComplexityScorer for FixedScorer {
            async fn score(&self, _prompt: &str) -> Result<f64, String> {
                Ok(self.0)
            }
        }
        let long_text = "x".repeat(500);
        let body = json!({
            "messages": [
                {"role": "user", "content": "setup"},
                {"role": "assistant", "content": "ok"},
                {"role": "user", "content": "followup"},
                {"role": "user", "content": long_text}
            ],
        });
        let cfg = default_classifier_config();

        let high = FixedScorer(0.8);
        assert_eq!(
            classify_request(&body, &cfg, &tiers(), Some(&high), "tier2").await,
            "tier1"
        );

        let mid = FixedScorer(0.5);
        assert_eq!(
            classify_request(&body, &cfg, &tiers(), Some(&mid), "tier2").await,
            "tier2"
        );

        let low = FixedScorer(0.1);
        assert_eq!(
            classify_request(&body, &cfg, &tiers(), Some(&low), "tier2").await,
            "tier3"
        );
    }

    #[tokio::test]
    async fn scorer_error_fails_open_to_default() {
        struct FailingScorer;
        #[async_trait]
        impl ComplexityScorer for FailingScorer {
            async fn score(&self, _prompt: &str) -> Result<f64, String> {
                Err("scorer unavailable".to_string())
            }
        }
        let long_text = "x".repeat(500);
        let body = json!({
            "messages": [
                {"role": "user", "content": "setup"},
                {"role": "assistant", "content": "ok"},
                {"role": "user", "content": "followup"},
                {"role": "user", "content": long_text}
            ],
        });
        let tier = classify_request(
            &body,
            &default_classifier_config(),
            &tiers(),
            Some(&FailingScorer),
            "tier2",
        )
        .await;
        assert_eq!(tier, "tier2");
    }

    #[tokio::test]
    async fn empty_tier_order_returns_default() {
        let body = json!({"messages": [{"role": "user", "content": "hi"}]});
        let tier =
            classify_request(&body, &default_classifier_config(), &[], None, "tier2").await;
        assert_eq!(tier, "tier2");
    }

    #[test]
    fn heuristic_text_len_sums_text_blocks() {
        let messages = vec![json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "hello "},
                {"type": "tool_use", "id": "1"},
                {"type": "text", "text": "world"},
            ]
        })];
        assert_eq!(last_user_text_len(&messages), 11);
    }
}
