use tracing::warn;

/// Per-million-token pricing for one model family
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    /// Cached-prefix read price; equals the input price when the family
    /// has no cache discount
    pub cached_input_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input: f64, output: f64, cached: f64) -> Self {
        Self {
            input_per_million: input,
            output_per_million: output,
            cached_input_per_million: cached,
        }
    }

    /// Cost in USD for a prompt/completion token pair
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 * self.input_per_million
            + completion_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

const ZERO: ModelPricing = ModelPricing::new(0.0, 0.0, 0.0);

/// Family pricing table, matched by model-name substring.
///
/// First match wins, so more specific names sort before their family
/// defaults.
const PRICING_TABLE: &[(&str, ModelPricing)] = &[
    ("claude-3-5-haiku", ModelPricing::new(0.80, 4.00, 0.08)),
    ("claude-haiku", ModelPricing::new(0.80, 4.00, 0.08)),
    ("claude-opus", ModelPricing::new(15.00, 75.00, 1.50)),
    ("claude-sonnet", ModelPricing::new(3.00, 15.00, 0.30)),
    ("claude", ModelPricing::new(3.00, 15.00, 0.30)),
    ("o1-mini", ModelPricing::new(1.10, 4.40, 0.55)),
    ("o1", ModelPricing::new(15.00, 60.00, 7.50)),
    ("o3-mini", ModelPricing::new(1.10, 4.40, 0.55)),
    ("o3", ModelPricing::new(2.00, 8.00, 0.50)),
    ("o4-mini", ModelPricing::new(1.10, 4.40, 0.275)),
    ("gpt-4o-mini", ModelPricing::new(0.15, 0.60, 0.075)),
    ("gpt-4o", ModelPricing::new(2.50, 10.00, 1.25)),
    ("gpt-4", ModelPricing::new(30.00, 60.00, 30.00)),
    ("grok", ModelPricing::new(3.00, 15.00, 0.75)),
    ("gemini-1.5-flash", ModelPricing::new(0.075, 0.30, 0.01875)),
    ("gemini-1.5-pro", ModelPricing::new(1.25, 5.00, 0.3125)),
    ("gemini-2.0-flash", ModelPricing::new(0.10, 0.40, 0.025)),
    ("gemini", ModelPricing::new(1.25, 5.00, 0.3125)),
    ("deepseek-reasoner", ModelPricing::new(0.55, 2.19, 0.14)),
    ("deepseek-r1", ModelPricing::new(0.55, 2.19, 0.14)),
    ("deepseek", ModelPricing::new(0.27, 1.10, 0.07)),
    ("qwq", ModelPricing::new(0.80, 2.40, 0.80)),
    ("qwen", ModelPricing::new(0.40, 1.20, 0.40)),
    ("amazon.titan", ModelPricing::new(0.50, 1.50, 0.50)),
    ("ai21.j2", ModelPricing::new(12.50, 12.50, 12.50)),
    ("cohere.command", ModelPricing::new(1.00, 2.00, 1.00)),
    ("meta.llama", ModelPricing::new(0.30, 0.60, 0.30)),
];

/// Look up pricing for a model name.
///
/// Unknown models price at zero so cost accounting degrades gracefully
/// rather than failing a request.
pub fn pricing_for(model: &str) -> ModelPricing {
    let lower = model.to_lowercase();
    for (needle, pricing) in PRICING_TABLE {
        if lower.contains(needle) {
            return *pricing;
        }
    }
    warn!(model = %model, "no pricing data for model, costing at zero");
    ZERO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pricing_substring_match() {
        let p = pricing_for("claude-3-5-sonnet-20241022");
        assert_eq!(p.input_per_million, 3.00);
        assert_eq!(p.output_per_million, 15.00);
    }

    #[test]
    fn test_pricing_specific_before_family() {
        // haiku must not fall through to the generic claude row
        let p = pricing_for("claude-3-5-haiku-20241022");
        assert_eq!(p.input_per_million, 0.80);
    }

    #[test]
    fn test_pricing_bedrock_ids() {
        let p = pricing_for("amazon.titan-text-express-v1");
        assert_eq!(p.input_per_million, 0.50);
        let p = pricing_for("meta.llama3-70b-instruct-v1:0");
        assert_eq!(p.input_per_million, 0.30);
    }

    #[test]
    fn test_pricing_unknown_model_is_zero() {
        let p = pricing_for("totally-unknown-model");
        assert_eq!(p.cost(1_000_000, 1_000_000), 0.0);
    }

    #[test]
    fn test_cost_per_million() {
        let p = ModelPricing::new(3.0, 15.0, 0.3);
        let cost = p.cost(1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < f64::EPSILON);
    }
}
