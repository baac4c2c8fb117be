use crate::pricing::pricing_for;
use crate::types::{ChatRequest, EffortLevel, ReasoningConfig};

/// Model families with a reasoning / extended-thinking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningFamily {
    /// OpenAI o1 / o3 / o4 series
    OpenAi,
    /// Anthropic Claude Opus / Sonnet extended thinking
    Anthropic,
    /// DeepSeek R1 / reasoner
    DeepSeek,
    /// Alibaba QwQ
    Alibaba,
}

/// Default thinking tag scanned for in assistant output
pub const DEFAULT_THINKING_TAG: &str = "thinking";

/// Fraction of max output tokens allotted to thinking when the request
/// carries no explicit budget
const DEFAULT_BUDGET_FRACTION: f64 = 0.8;

/// Output-token fallback when the request leaves max_tokens at zero
const FALLBACK_MAX_TOKENS: u32 = 4096;

const TRIGGER_KEYWORDS: &[&str] = &[
    "think",
    "reason",
    "analyze",
    "consider",
    "explain why",
    "step by step",
];

/// Detect a reasoning-capable family from the model name
pub fn detect_family(model: &str) -> Option<ReasoningFamily> {
    let lower = model.to_lowercase();
    if lower.starts_with("o1") || lower.starts_with("o3") || lower.starts_with("o4") {
        return Some(ReasoningFamily::OpenAi);
    }
    if lower.contains("claude-opus") || lower.contains("claude-sonnet") {
        return Some(ReasoningFamily::Anthropic);
    }
    if lower.contains("deepseek") && (lower.contains("r1") || lower.contains("reasoner")) {
        return Some(ReasoningFamily::DeepSeek);
    }
    if lower.contains("qwq") {
        return Some(ReasoningFamily::Alibaba);
    }
    None
}

pub fn supports_reasoning(model: &str) -> bool {
    detect_family(model).is_some()
}

/// Whether the conversation itself asks for deliberate reasoning.
/// Only meaningful for models whose family supports it.
pub fn wants_reasoning(request: &ChatRequest) -> bool {
    if !supports_reasoning(&request.model) {
        return false;
    }
    let text = request.user_text().to_lowercase();
    TRIGGER_KEYWORDS.iter().any(|k| text.contains(k))
}

/// Resolved thinking parameters handed to an adapter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThinkingConfig {
    pub budget_tokens: u32,
    pub effort: EffortLevel,
}

/// Compute the thinking configuration the pipeline attaches to a request.
///
/// An explicit `reasoning` field wins; otherwise a config is synthesized
/// when the model family supports reasoning and the user text triggers
/// it. The default budget is 80% of the request's max output tokens.
pub fn thinking_config_for(request: &ChatRequest) -> Option<ThinkingConfig> {
    let max_tokens = if request.max_tokens > 0 {
        request.max_tokens
    } else {
        FALLBACK_MAX_TOKENS
    };
    let default_budget = (max_tokens as f64 * DEFAULT_BUDGET_FRACTION) as u32;

    match &request.reasoning {
        Some(cfg) if cfg.enabled => Some(ThinkingConfig {
            budget_tokens: cfg.budget_tokens.unwrap_or(default_budget),
            effort: cfg.effort,
        }),
        Some(_) => None,
        None if wants_reasoning(request) => Some(ThinkingConfig {
            budget_tokens: default_budget,
            effort: ReasoningConfig::default().effort,
        }),
        None => None,
    }
}

/// Split assistant output into (visible, thinking) by scanning balanced
/// `<tag>…</tag>` regions. Unclosed tags are left in the visible text.
pub fn extract_thinking(text: &str, tag: &str) -> (String, String) {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut visible = String::new();
    let mut thinking = String::new();
    let mut rest = text;

    while let Some(start) = rest.find(&open) {
        let after_open = &rest[start + open.len()..];

        // Find the matching close, honoring nested open tags
        let mut depth = 1usize;
        let mut cursor = 0usize;
        let mut end = None;
        while depth > 0 {
            let next_open = after_open[cursor..].find(&open);
            let next_close = after_open[cursor..].find(&close);
            match (next_open, next_close) {
                (Some(o), Some(c)) if o < c => {
                    depth += 1;
                    cursor += o + open.len();
                }
                (_, Some(c)) => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(cursor + c);
                    } else {
                        cursor += c + close.len();
                    }
                }
                _ => break,
            }
        }

        match end {
            Some(end) => {
                visible.push_str(&rest[..start]);
                thinking.push_str(&after_open[..end]);
                rest = &after_open[end + close.len()..];
            }
            None => break,
        }
    }

    visible.push_str(rest);
    (visible.trim().to_string(), thinking.trim().to_string())
}

/// Estimate the cost of a reasoning request in USD.
/// Thinking tokens bill at the completion rate.
pub fn estimate_cost(
    model: &str,
    prompt_tokens: u64,
    completion_tokens: u64,
    thinking_tokens: u64,
) -> f64 {
    pricing_for(model).cost(prompt_tokens, completion_tokens + thinking_tokens)
}

/// Recommended thinking budget per analysis depth
pub fn recommended_budget(depth: &str) -> u32 {
    match depth {
        "simple" => 2_048,
        "standard" => 8_192,
        "complex" => 16_384,
        "detailed" => 24_576,
        "exhaustive" => 32_768,
        _ => 8_192,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    #[test]
    fn test_detect_family_openai_series() {
        assert_eq!(detect_family("o1-preview"), Some(ReasoningFamily::OpenAi));
        assert_eq!(detect_family("o3-mini"), Some(ReasoningFamily::OpenAi));
        assert_eq!(detect_family("o4-mini"), Some(ReasoningFamily::OpenAi));
        assert_eq!(detect_family("gpt-4o"), None);
    }

    #[test]
    fn test_detect_family_anthropic_deepseek_qwq() {
        assert_eq!(detect_family("claude-sonnet-4-20250514"), Some(ReasoningFamily::Anthropic));
        assert_eq!(detect_family("claude-opus-4"), Some(ReasoningFamily::Anthropic));
        assert_eq!(detect_family("claude-3-5-haiku"), None);
        assert_eq!(detect_family("deepseek-r1"), Some(ReasoningFamily::DeepSeek));
        assert_eq!(detect_family("deepseek-reasoner"), Some(ReasoningFamily::DeepSeek));
        assert_eq!(detect_family("qwq-32b"), Some(ReasoningFamily::Alibaba));
    }

    #[test]
    fn test_wants_reasoning_keyword_trigger() {
        let mut req = ChatRequest::new(
            "claude-sonnet-4",
            vec![ChatMessage::user("Please think step by step about this")],
        );
        assert!(wants_reasoning(&req));

        req.messages = vec![ChatMessage::user("Hello there")];
        assert!(!wants_reasoning(&req));

        // Unsupported family never triggers
        let req = ChatRequest::new("gpt-4o", vec![ChatMessage::user("think hard")]);
        assert!(!wants_reasoning(&req));
    }

    #[test]
    fn test_thinking_config_default_budget_is_80_percent() {
        let mut req = ChatRequest::new("claude-sonnet-4", vec![ChatMessage::user("analyze this")]);
        req.max_tokens = 1000;
        let cfg = thinking_config_for(&req).unwrap();
        assert_eq!(cfg.budget_tokens, 800);
    }

    #[test]
    fn test_thinking_config_explicit_budget_wins() {
        let mut req = ChatRequest::new("claude-sonnet-4", vec![ChatMessage::user("hi")]);
        req.max_tokens = 1000;
        req.reasoning = Some(ReasoningConfig {
            enabled: true,
            budget_tokens: Some(12_000),
            effort: EffortLevel::High,
        });
        let cfg = thinking_config_for(&req).unwrap();
        assert_eq!(cfg.budget_tokens, 12_000);
        assert_eq!(cfg.effort, EffortLevel::High);
    }

    #[test]
    fn test_thinking_config_disabled_is_none() {
        let mut req = ChatRequest::new("claude-sonnet-4", vec![ChatMessage::user("think")]);
        req.reasoning = Some(ReasoningConfig {
            enabled: false,
            budget_tokens: None,
            effort: EffortLevel::Medium,
        });
        assert!(thinking_config_for(&req).is_none());
    }

    #[test]
    fn test_extract_thinking_basic() {
        let (visible, thinking) =
            extract_thinking("<thinking>hmm</thinking>The answer is 4.", DEFAULT_THINKING_TAG);
        assert_eq!(visible, "The answer is 4.");
        assert_eq!(thinking, "hmm");
    }

    #[test]
    fn test_extract_thinking_nested_and_multiple() {
        let text = "a<thinking>outer<thinking>inner</thinking>tail</thinking>b<thinking>2nd</thinking>c";
        let (visible, thinking) = extract_thinking(text, DEFAULT_THINKING_TAG);
        assert_eq!(visible, "abc");
        assert_eq!(thinking, "outer<thinking>inner</thinking>tail2nd");
    }

    #[test]
    fn test_extract_thinking_unclosed_left_visible() {
        let (visible, thinking) = extract_thinking("start <thinking>never closed", DEFAULT_THINKING_TAG);
        assert_eq!(visible, "start <thinking>never closed");
        assert_eq!(thinking, "");
    }

    #[test]
    fn test_estimate_cost_counts_thinking_as_completion() {
        let with_thinking = estimate_cost("claude-sonnet-4", 1000, 500, 500);
        let without = estimate_cost("claude-sonnet-4", 1000, 1000, 0);
        assert!((with_thinking - without).abs() < 1e-12);
    }

    #[test]
    fn test_recommended_budget_ladder() {
        assert_eq!(recommended_budget("simple"), 2_048);
        assert_eq!(recommended_budget("exhaustive"), 32_768);
        assert_eq!(recommended_budget("unknown"), 8_192);
    }
}
