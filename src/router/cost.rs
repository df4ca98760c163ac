//! Pure model pricing lookup.
//!
//! No state, no errors: given a model name and token counts, produce a USD
//! cost. Exact match wins; on miss, try a prefix match in both directions
//! (the request model is a prefix of a known key, or vice versa); on a
//! complete miss, fall back to conservative default pricing.

/// (input $ per 1M tokens, output $ per 1M tokens).
type Pricing = (f64, f64);

const DEFAULT_INPUT_COST_PER_1M: f64 = 3.00;
const DEFAULT_OUTPUT_COST_PER_1M: f64 = 15.00;

const MODEL_COSTS: &[(&str, Pricing)] = &[
    // Anthropic
    ("claude-opus-4-1-20250805", (15.00, 75.00)),
    ("claude-opus-4-20250514", (15.00, 75.00)),
    ("claude-sonnet-4-5-20250929", (3.00, 15.00)),
    ("claude-sonnet-4-20250514", (3.00, 15.00)),
    ("claude-3-7-sonnet-20250219", (3.00, 15.00)),
    ("claude-3-5-sonnet-20241022", (3.00, 15.00)),
    ("claude-3-5-haiku-20241022", (0.80, 4.00)),
    ("claude-3-opus-20240229", (15.00, 75.00)),
    ("claude-3-haiku-20240307", (0.25, 1.25)),
    // OpenAI
    ("gpt-4o", (2.50, 10.00)),
    ("gpt-4o-mini", (0.15, 0.60)),
    ("gpt-4-turbo", (10.00, 30.00)),
    ("gpt-4", (30.00, 60.00)),
    ("gpt-3.5-turbo", (0.50, 1.50)),
    ("o1", (15.00, 60.00)),
    ("o1-mini", (1.10, 4.40)),
    ("o3-mini", (1.10, 4.40)),
    // Google
    ("gemini-1.5-pro", (1.25, 5.00)),
    ("gemini-1.5-flash", (0.075, 0.30)),
    ("gemini-2.0-flash", (0.10, 0.40)),
];

fn pricing_for_model(model: &str) -> Pricing {
    for (known, pricing) in MODEL_COSTS {
        if *known == model {
            return *pricing;
        }
    }
    for (known, pricing) in MODEL_COSTS {
        if model.starts_with(known) || known.starts_with(model) {
            return *pricing;
        }
    }
    (DEFAULT_INPUT_COST_PER_1M, DEFAULT_OUTPUT_COST_PER_1M)
}

/// Cost in USD for `input_tokens`/`output_tokens` against `model`.
pub fn cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let (input_price, output_price) = pricing_for_model(model);
    (input_tokens as f64 * input_price + output_tokens as f64 * output_price) / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_known_model() {
        let c = cost("claude-sonnet-4-5-20250929", 10, 20);
        assert!((c - 0.00033).abs() < 1e-9);
    }

    #[test]
    fn prefix_match_request_model_longer() {
        // Request carries a dated suffix the table key doesn't have.
        let c = cost("gpt-4o-2024-08-06", 1_000_000, 0);
        assert!((c - 2.50).abs() < 1e-9);
    }

    #[test]
    fn prefix_match_known_key_longer() {
        // A shorter request model name that is itself a prefix of a table key
        // is not expected in practice, but the rule is symmetric; exercise
        // the known-key-starts-with-model branch via an exact truncation.
        let c = cost("claude-3-5-haiku", 1_000_000, 0);
        assert!((c - 0.80).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_uses_defaults() {
        let c = cost("some-unreleased-model", 1_000_000, 1_000_000);
        assert!((c - (DEFAULT_INPUT_COST_PER_1M + DEFAULT_OUTPUT_COST_PER_1M)).abs() < 1e-9);
    }

    #[test]
    fn zero_tokens_zero_cost() {
        assert_eq!(cost("claude-opus-4-1-20250805", 0, 0), 0.0);
    }
}
