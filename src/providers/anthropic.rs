use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{resolve_credential, AnthropicSettings};
use crate::error::{GatewayError, Result};
use crate::models::anthropic as wire;
use crate::provider::{
    Capability, HealthStatus, ModelInfo, Provider, ProviderHealth, ProviderType,
};
use crate::providers::{classify_response, effective_temperature, effective_top_p, send_cancellable};
use crate::reasoning::thinking_config_for;
use crate::streaming::{delta_channel, DeltaPump};
use crate::types::{
    normalize_finish_reason, ChatMessage, ChatRequest, ChatResponse, Role, StreamItem, ToolCall,
    Usage, FINISH_STOP,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const CHEAPEST_MODEL: &str = "claude-3-5-haiku-20241022";

/// Adapter for the native Anthropic Messages API.
///
/// Auth is `x-api-key` plus the pinned `anthropic-version` header. System
/// messages leave the positional history and ride the request's `system`
/// slot, as string or cache-hinted text blocks.
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_version: String,
    timeout: Duration,
    error_count: AtomicU32,
}

impl AnthropicProvider {
    pub fn new(settings: &AnthropicSettings) -> Self {
        Self {
            client: Client::new(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: resolve_credential(settings.api_key.as_deref(), &["ANTHROPIC_API_KEY"]),
            api_version: settings.api_version.clone(),
            timeout: Duration::from_secs(settings.timeout_seconds),
            error_count: AtomicU32::new(0),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    fn request_builder(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("anthropic-version", &self.api_version)
            .header("Content-Type", "application/json")
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        builder
    }

    /// Translate the canonical conversation into the Messages shape.
    /// Shared with the Bedrock and Vertex Claude branches, which reuse
    /// the same body with their own version strings.
    pub(crate) fn build_wire_request(request: &ChatRequest, stream: bool) -> wire::MessagesRequest {
        let (system, messages) = convert_messages(&request.messages);

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| wire::Tool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.parameters.clone(),
                        cache_control: None,
                    })
                    .collect(),
            )
        };

        let thinking = thinking_config_for(request);

        wire::MessagesRequest {
            model: request.model.clone(),
            system,
            messages,
            max_tokens: if request.max_tokens > 0 {
                request.max_tokens
            } else {
                DEFAULT_MAX_TOKENS
            },
            temperature: effective_temperature(request.temperature, thinking.is_some()),
            top_p: effective_top_p(request.top_p),
            stream: if stream { Some(true) } else { None },
            stop_sequences: None,
            tools,
            thinking: thinking.map(|cfg| wire::ThinkingParam::enabled(cfg.budget_tokens)),
            anthropic_version: None,
        }
    }

    fn note_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }
}

fn convert_messages(messages: &[ChatMessage]) -> (Option<wire::SystemContent>, Vec<wire::Message>) {
    let system_messages: Vec<&ChatMessage> =
        messages.iter().filter(|m| m.role == Role::System).collect();

    let system = match system_messages.as_slice() {
        [] => None,
        [only] if !only.cache_hint => Some(wire::SystemContent::Text(only.content.clone())),
        many => Some(wire::SystemContent::Blocks(
            many.iter()
                .map(|m| wire::SystemBlock {
                    block_type: "text".to_string(),
                    text: m.content.clone(),
                    cache_control: m.cache_hint.then(wire::CacheControl::ephemeral),
                })
                .collect(),
        )),
    };

    let history = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| match m.role {
            Role::Tool => wire::Message {
                role: "user".to_string(),
                content: wire::MessageContent::Blocks(vec![wire::ContentBlock::tool_result(
                    m.tool_call_id.clone().unwrap_or_default(),
                    serde_json::Value::String(m.content.clone()),
                )]),
            },
            role => {
                let wire_role = if role == Role::Assistant { "assistant" } else { "user" };
                let content = if m.cache_hint {
                    let mut block = wire::ContentBlock::text(m.content.clone());
                    block.cache_control = Some(wire::CacheControl::ephemeral());
                    wire::MessageContent::Blocks(vec![block])
                } else {
                    wire::MessageContent::Text(m.content.clone())
                };
                wire::Message {
                    role: wire_role.to_string(),
                    content,
                }
            }
        })
        .collect();

    (system, history)
}

/// Fold the response usage into canonical form plus cache metadata
fn usage_metadata(usage: &wire::TokenUsage) -> (Usage, HashMap<String, serde_json::Value>) {
    let canonical = Usage::new(usage.input_tokens, usage.output_tokens);
    let mut metadata = HashMap::new();
    if let Some(creation) = usage.cache_creation_input_tokens {
        metadata.insert("cache_creation_tokens".to_string(), creation.into());
    }
    if let Some(read) = usage.cache_read_input_tokens {
        metadata.insert("cache_read_tokens".to_string(), read.into());
    }
    (canonical, metadata)
}

/// A Messages response reduced to canonical pieces. Shared with the
/// Bedrock and Vertex Claude branches, which speak the same shape.
pub(crate) struct ParsedMessage {
    pub id: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    pub finish_reason: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

pub(crate) fn parse_messages_response(message: wire::MessagesResponse) -> ParsedMessage {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in &message.content {
        match block.block_type.as_str() {
            "text" => {
                if let Some(text) = &block.text {
                    content.push_str(text);
                }
            }
            "tool_use" => tool_calls.push(ToolCall {
                id: block.id.clone().unwrap_or_default(),
                name: block.name.clone().unwrap_or_default(),
                arguments: block.input.clone().unwrap_or(serde_json::Value::Null),
            }),
            _ => {}
        }
    }
    let (usage, metadata) = usage_metadata(&message.usage);
    ParsedMessage {
        id: message.id,
        content,
        tool_calls,
        usage,
        finish_reason: message.stop_reason.unwrap_or_else(|| FINISH_STOP.to_string()),
        metadata,
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    fn display_name(&self) -> &str {
        "Anthropic"
    }

    fn models(&self) -> Vec<ModelInfo> {
        let full = vec![
            Capability::Chat,
            Capability::Streaming,
            Capability::Tools,
            Capability::Vision,
            Capability::Reasoning,
            Capability::Caching,
        ];
        let entry = |name: &str, out: u32, desc: &str| ModelInfo {
            name: name.to_string(),
            provider: ProviderType::Anthropic,
            context_window: 200_000,
            max_output_tokens: out,
            capabilities: full.clone(),
            supports_tools: true,
            supports_vision: true,
            description: desc.to_string(),
        };
        vec![
            entry("claude-3-5-sonnet-latest", 8_192, "Balanced flagship"),
            entry("claude-3-5-haiku-20241022", 8_192, "Fast, low-cost tier"),
            entry("claude-sonnet-4-20250514", 64_000, "Sonnet 4 with extended thinking"),
            entry("claude-opus-4-20250514", 32_000, "Opus 4 with extended thinking"),
        ]
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::Chat,
            Capability::Streaming,
            Capability::Tools,
            Capability::Vision,
            Capability::Reasoning,
            Capability::Caching,
        ]
    }

    async fn generate(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let body = Self::build_wire_request(request, false);
        let started = Instant::now();

        let response = send_cancellable(self.request_builder(&self.messages_url()).json(&body), cancel)
            .await
            .inspect_err(|_| self.note_error())?;

        if !response.status().is_success() {
            self.note_error();
            return Err(classify_response(response).await);
        }

        let message: wire::MessagesResponse = response.json().await.map_err(|e| {
            self.note_error();
            GatewayError::Transport(format!("failed to decode response: {}", e))
        })?;

        let parsed = parse_messages_response(message);

        Ok(ChatResponse {
            id: parsed.id,
            request_id: request.id.clone(),
            content: parsed.content,
            tool_calls: parsed.tool_calls,
            usage: parsed.usage,
            finish_reason: normalize_finish_reason(&parsed.finish_reason),
            latency_ms: started.elapsed().as_millis() as u64,
            created: Utc::now(),
            metadata: parsed.metadata,
        })
    }

    async fn generate_stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamItem>> {
        let body = Self::build_wire_request(request, true);

        let response = send_cancellable(self.request_builder(&self.messages_url()).json(&body), &cancel)
            .await
            .inspect_err(|_| self.note_error())?;

        if !response.status().is_success() {
            self.note_error();
            return Err(classify_response(response).await);
        }

        let (tx, rx) = delta_channel();
        let mut pump = DeltaPump::new(request.id.clone(), tx, cancel.clone());

        tokio::spawn(async move {
            let mut events = response.bytes_stream().eventsource();
            let mut input_tokens = 0u64;
            let mut output_tokens = 0u64;
            // Tool input streams as partial JSON between block start/stop
            let mut open_tool: Option<(String, String, String)> = None;

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.next() => event,
                };

                let event = match event {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        pump.fail(GatewayError::Transport(e.to_string())).await;
                        return;
                    }
                    None => {
                        // Dropped before message_stop
                        pump.fail(GatewayError::Transport(
                            "stream ended before message_stop".to_string(),
                        ))
                        .await;
                        return;
                    }
                };

                let parsed: wire::StreamEvent = match serde_json::from_str(&event.data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(error = %e, "skipping unparseable stream event");
                        continue;
                    }
                };

                match parsed.event_type.as_str() {
                    "message_start" => {
                        if let Some(message) = &parsed.message {
                            pump.set_response_id(message.id.clone());
                            if let Some(usage) = &message.usage {
                                input_tokens = usage.input_tokens;
                                if let Some(creation) = usage.cache_creation_input_tokens {
                                    pump.insert_metadata("cache_creation_tokens", creation.into());
                                }
                                if let Some(read) = usage.cache_read_input_tokens {
                                    pump.insert_metadata("cache_read_tokens", read.into());
                                }
                            }
                        }
                    }
                    "content_block_start" => {
                        if let Some(block) = &parsed.content_block {
                            if block.block_type == "tool_use" {
                                open_tool = Some((
                                    block.id.clone().unwrap_or_default(),
                                    block.name.clone().unwrap_or_default(),
                                    String::new(),
                                ));
                            }
                        }
                    }
                    "content_block_delta" => {
                        if let Some(delta) = &parsed.delta {
                            if let Some(text) = &delta.text {
                                if !pump.send_delta(text).await {
                                    return;
                                }
                            }
                            if let Some(partial) = &delta.partial_json {
                                if let Some((_, _, input)) = open_tool.as_mut() {
                                    input.push_str(partial);
                                }
                            }
                        }
                    }
                    "content_block_stop" => {
                        if let Some((id, name, input)) = open_tool.take() {
                            pump.push_tool_call(ToolCall {
                                id,
                                name,
                                arguments: serde_json::from_str(&input)
                                    .unwrap_or(serde_json::Value::Null),
                            });
                        }
                    }
                    "message_delta" => {
                        if let Some(delta) = &parsed.delta {
                            if let Some(reason) = &delta.stop_reason {
                                pump.set_finish_reason(reason.clone());
                            }
                        }
                        if let Some(usage) = &parsed.usage {
                            output_tokens = usage.output_tokens;
                        }
                    }
                    "message_stop" => {
                        pump.set_usage(Usage::new(input_tokens, output_tokens));
                        pump.finish().await;
                        return;
                    }
                    "error" => {
                        let message = parsed
                            .error
                            .map(|e| e.message)
                            .unwrap_or_else(|| "unknown stream error".to_string());
                        pump.set_usage(Usage::new(input_tokens, output_tokens));
                        pump.fail(GatewayError::ServiceUnavailable(message)).await;
                        return;
                    }
                    _ => {}
                }
            }
        });

        Ok(rx)
    }

    async fn is_available(&self) -> bool {
        // The Messages endpoint rejects GETs, so probe the models listing
        let url = format!("{}/models", self.base_url);
        let mut builder = self.client.get(&url).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        builder = builder.header("anthropic-version", &self.api_version);
        match builder.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "availability probe failed");
                false
            }
        }
    }

    async fn health_check(&self) -> Result<ProviderHealth> {
        let mut probe = ChatRequest::new(CHEAPEST_MODEL, vec![ChatMessage::user("Hi")]);
        probe.max_tokens = 1;

        let started = Instant::now();
        let cancel = CancellationToken::new();
        let result = self.generate(&probe, &cancel).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = match &result {
            Ok(_) if latency_ms < 5_000 => HealthStatus::Healthy,
            Ok(_) => HealthStatus::Degraded,
            Err(e) => {
                warn!(error = %e, "health probe failed");
                HealthStatus::Unhealthy
            }
        };

        Ok(ProviderHealth {
            status,
            latency_ms,
            checked_at: Utc::now(),
            error_count: self.error_count.load(Ordering::Relaxed),
            model_count: self.models().len(),
        })
    }

    async fn shutdown(&self) {
        debug!("anthropic adapter shut down");
    }
}
