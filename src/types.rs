use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::GatewayError;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A single message in the canonical conversation format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role
    pub role: Role,
    /// Text content
    pub content: String,
    /// Optional participant name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Binding to a prior tool call (for role == tool)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Ephemeral cache marker, set only by the cache-control engine
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_hint: bool,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Tool result message bound to a prior tool call
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            cache_hint: false,
        }
    }
}

/// A callable tool descriptor exposed to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name
    pub name: String,
    /// Prose description
    pub description: String,
    /// JSON-schema parameter object, passed to vendors unchanged
    pub parameters: serde_json::Value,
}

/// A tool-call invocation returned by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique id within one response
    pub id: String,
    /// Function name
    pub name: String,
    /// Argument object
    pub arguments: serde_json::Value,
}

/// Reasoning effort level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffortLevel {
    Minimal,
    Low,
    Medium,
    High,
}

/// Per-request reasoning / extended-thinking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Whether reasoning mode is requested
    pub enabled: bool,
    /// Explicit thinking-token budget; defaulted by the reasoning engine when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
    /// Effort level hint
    pub effort: EffortLevel,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            budget_tokens: None,
            effort: EffortLevel::Medium,
        }
    }
}

/// Cache-hint placement strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
    /// No messages marked
    None,
    /// First message iff it is the system message
    System,
    /// First system message iff tools are present
    Tools,
    /// First system message plus the last two user messages
    Context,
    /// First system message plus every user message
    Aggressive,
}

/// Per-request prompt-caching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub strategy: CacheStrategy,
    /// Minimum estimated prompt tokens before hints are attached
    pub min_tokens: u32,
    /// Requested cache lifetime
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: CacheStrategy::System,
            min_tokens: 1024,
            ttl_seconds: 300,
        }
    }
}

/// Canonical chat-completion request, the gateway's public input shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Unique request identifier
    pub id: String,
    /// Target model name
    pub model: String,
    /// Ordered conversation
    pub messages: Vec<ChatMessage>,
    /// Maximum output tokens; 0 means "use the adapter default"
    pub max_tokens: u32,
    /// Sampling temperature; 0.0 means "unset"
    pub temperature: f32,
    /// Nucleus sampling; 0.0 means "unset"
    pub top_p: f32,
    /// Streaming or unary for the whole life of the request
    pub stream: bool,
    /// Callable tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    /// Reasoning configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
    /// Prompt-caching configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            messages,
            max_tokens: 0,
            temperature: 0.0,
            top_p: 0.0,
            stream: false,
            tools: Vec::new(),
            reasoning: None,
            cache: None,
        }
    }

    /// Concatenated text of all user messages (keyword scans, token estimates)
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Token usage triple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Build a usage triple maintaining `total == prompt + completion`
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Canonical chat-completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Response identifier (vendor id when available, else generated)
    pub id: String,
    /// Originating request identifier
    pub request_id: String,
    /// Aggregated assistant text
    pub content: String,
    /// Tool-call invocations; ids unique within the response
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Token usage
    pub usage: Usage,
    /// Vendor-agnostic finish reason
    pub finish_reason: String,
    /// Wall-clock processing duration in milliseconds
    pub latency_ms: u64,
    /// Creation timestamp
    pub created: DateTime<Utc>,
    /// Provider-side metadata (cache token counters, raw stop reasons, …)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Incremental text fragment of a streaming response.
/// Deltas never carry usage; that arrives only on the terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseDelta {
    pub request_id: String,
    pub content: String,
}

/// One item on a streaming channel
#[derive(Debug)]
pub enum StreamItem {
    /// Incremental fragment, delivered in wire order
    Delta(ResponseDelta),
    /// Exactly one terminal event with accumulated text, tool calls and final usage
    Done(Box<ChatResponse>),
    /// Terminal failure with the last-known partial state
    Error {
        error: GatewayError,
        partial_text: String,
        usage: Option<Usage>,
    },
}

/// Canonical finish-reason values used when collapsing free-form vendor messages
pub const FINISH_STOP: &str = "stop";
pub const FINISH_LENGTH: &str = "length";
pub const FINISH_TOOL_CALLS: &str = "tool_calls";
pub const FINISH_CONTENT_FILTER: &str = "content_filter";
pub const FINISH_ERROR: &str = "error";

/// Normalize a vendor finish reason.
///
/// Short vendor tokens (`end_turn`, `STOP`, `max_tokens`, …) are forwarded
/// as-is; free-form messages collapse to one of the canonical values.
pub fn normalize_finish_reason(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return FINISH_STOP.to_string();
    }
    if trimmed.len() <= 24 && !trimmed.contains(char::is_whitespace) {
        return trimmed.to_string();
    }

    let lower = trimmed.to_lowercase();
    if lower.contains("filter") || lower.contains("safety") || lower.contains("blocked") {
        FINISH_CONTENT_FILTER.to_string()
    } else if lower.contains("length") || lower.contains("max token") || lower.contains("truncat") {
        FINISH_LENGTH.to_string()
    } else if lower.contains("tool") || lower.contains("function") {
        FINISH_TOOL_CALLS.to_string()
    } else if lower.contains("error") || lower.contains("fail") {
        FINISH_ERROR.to_string()
    } else {
        FINISH_STOP.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_total_invariant() {
        let usage = Usage::new(10, 20);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }

    #[test]
    fn test_chat_request_defaults() {
        let req = ChatRequest::new("claude-3-5-sonnet-latest", vec![ChatMessage::user("Hello")]);
        assert!(!req.id.is_empty());
        assert_eq!(req.max_tokens, 0);
        assert_eq!(req.temperature, 0.0);
        assert!(!req.stream);
        assert!(req.tools.is_empty());
    }

    #[test]
    fn test_role_serde_snake_case() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, r#""assistant""#);
        let role: Role = serde_json::from_str(r#""tool""#).unwrap();
        assert_eq!(role, Role::Tool);
    }

    #[test]
    fn test_tool_message_binds_call_id() {
        let msg = ChatMessage::tool("call_1", "42");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_normalize_finish_reason_short_tokens_pass_through() {
        assert_eq!(normalize_finish_reason("end_turn"), "end_turn");
        assert_eq!(normalize_finish_reason("STOP"), "STOP");
        assert_eq!(normalize_finish_reason("max_tokens"), "max_tokens");
    }

    #[test]
    fn test_normalize_finish_reason_collapses_free_form() {
        assert_eq!(
            normalize_finish_reason("the response was blocked by the content filter"),
            FINISH_CONTENT_FILTER
        );
        assert_eq!(
            normalize_finish_reason("stopped because the max token budget was reached"),
            FINISH_LENGTH
        );
        assert_eq!(
            normalize_finish_reason("model requested a function invocation"),
            FINISH_TOOL_CALLS
        );
        assert_eq!(normalize_finish_reason("an internal error occurred upstream"), FINISH_ERROR);
        assert_eq!(normalize_finish_reason("completed without incident at all"), FINISH_STOP);
    }
}
