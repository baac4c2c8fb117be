use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{ChatRequest, ChatResponse, StreamItem};

/// Vendor families the gateway can route to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    OpenAi,
    Xai,
    OpenRouter,
    Qwen,
    Local,
    Anthropic,
    Bedrock,
    Vertex,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Xai => "xai",
            Self::OpenRouter => "openrouter",
            Self::Qwen => "qwen",
            Self::Local => "local",
            Self::Anthropic => "anthropic",
            Self::Bedrock => "bedrock",
            Self::Vertex => "vertex",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an adapter can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Streaming,
    Tools,
    Vision,
    Reasoning,
    Caching,
}

/// Static description of one servable model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: ProviderType,
    /// Maximum context window in tokens
    pub context_window: u32,
    /// Default maximum output tokens
    pub max_output_tokens: u32,
    pub capabilities: Vec<Capability>,
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub description: String,
}

/// Probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health record for one adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
    pub error_count: u32,
    pub model_count: usize,
}

/// Uniform capability contract each vendor adapter implements.
///
/// Adapters are created once at registration, own their HTTP connection
/// pool, and must be safe for concurrent use: no per-request mutable
/// state. Cancellation is observed at the network await, the stream
/// parse, and the delta send.
#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    fn display_name(&self) -> &str;

    fn models(&self) -> Vec<ModelInfo>;

    fn capabilities(&self) -> Vec<Capability>;

    /// Unary generation
    async fn generate(&self, request: &ChatRequest, cancel: &CancellationToken)
        -> Result<ChatResponse>;

    /// Streaming generation. Deltas arrive in wire order on a bounded
    /// channel, followed by exactly one terminal item.
    async fn generate_stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamItem>>;

    /// Cheap reachability probe (endpoint answers at all)
    async fn is_available(&self) -> bool;

    /// One minimal generation against the adapter's cheapest model,
    /// recording observed latency
    async fn health_check(&self) -> Result<ProviderHealth>;

    /// Release idle connections. Idempotent, never fails.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_display() {
        assert_eq!(ProviderType::OpenAi.to_string(), "openai");
        assert_eq!(ProviderType::OpenRouter.to_string(), "openrouter");
        assert_eq!(ProviderType::Bedrock.as_str(), "bedrock");
    }

    #[test]
    fn test_provider_type_serde_round_trip() {
        let json = serde_json::to_string(&ProviderType::Vertex).unwrap();
        assert_eq!(json, r#""vertex""#);
        let back: ProviderType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ProviderType::Vertex);
    }

    #[test]
    fn test_health_status_serde() {
        let json = serde_json::to_string(&HealthStatus::Degraded).unwrap();
        assert_eq!(json, r#""degraded""#);
    }
}
