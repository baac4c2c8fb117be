use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{AwsCredentials, BedrockSettings};
use crate::error::{classify_bedrock, classify_http, GatewayError, Result};
use crate::models::anthropic as anthropic_wire;
use crate::models::bedrock as wire;
use crate::provider::{
    Capability, HealthStatus, ModelInfo, Provider, ProviderHealth, ProviderType,
};
use crate::providers::{effective_temperature, effective_top_p};
use crate::streaming::{delta_channel, DeltaPump};
use crate::types::{
    normalize_finish_reason, ChatMessage, ChatRequest, ChatResponse, Role, StreamItem, ToolCall,
    Usage, FINISH_STOP,
};

const CHEAPEST_MODEL: &str = "anthropic.claude-3-5-haiku-20241022-v1:0";

/// Model families Bedrock serves through the shared runtime endpoint.
/// Each family keeps its own body and response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BedrockFamily {
    Anthropic,
    Titan,
    Jurassic,
    CohereCommand,
    Llama,
}

/// Dispatch by model-id prefix. Cross-region ids (`us.anthropic.…`)
/// resolve through their embedded vendor segment.
pub fn family_for(model_id: &str) -> Option<BedrockFamily> {
    let id = model_id
        .split_once('.')
        .filter(|(region, _)| matches!(*region, "us" | "eu" | "apac"))
        .map(|(_, rest)| rest)
        .unwrap_or(model_id);

    if id.starts_with("anthropic.") {
        Some(BedrockFamily::Anthropic)
    } else if id.starts_with("amazon.titan") {
        Some(BedrockFamily::Titan)
    } else if id.starts_with("ai21.") {
        Some(BedrockFamily::Jurassic)
    } else if id.starts_with("cohere.command") {
        Some(BedrockFamily::CohereCommand)
    } else if id.starts_with("meta.llama") {
        Some(BedrockFamily::Llama)
    } else {
        None
    }
}

/// Adapter for AWS Bedrock with SigV4 request signing.
///
/// URL: `https://bedrock-runtime.{region}.amazonaws.com/model/{id}/invoke`
/// (or `invoke-with-response-stream`). When cross-region inference is
/// enabled the inference-profile ARN replaces the model id in the path.
pub struct BedrockProvider {
    client: Client,
    region: String,
    credentials: AwsCredentials,
    inference_profile_arn: Option<String>,
    cross_region: bool,
    runtime_endpoint: String,
    timeout: Duration,
    error_count: AtomicU32,
}

impl BedrockProvider {
    pub fn new(settings: &BedrockSettings) -> Result<Self> {
        let region = settings.resolve_region();
        let runtime_endpoint = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://bedrock-runtime.{}.amazonaws.com", region))
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client: Client::new(),
            region,
            credentials: settings.resolve_credentials()?,
            inference_profile_arn: settings.inference_profile_arn.clone(),
            cross_region: settings.cross_region,
            runtime_endpoint,
            timeout: Duration::from_secs(settings.timeout_seconds),
            error_count: AtomicU32::new(0),
        })
    }

    /// The model id placed on the wire: the inference-profile ARN when
    /// cross-region inference is enabled, else the requested id.
    fn effective_model_id<'a>(&'a self, model: &'a str) -> &'a str {
        match (&self.inference_profile_arn, self.cross_region) {
            (Some(arn), true) => arn.as_str(),
            _ => model,
        }
    }

    fn invoke_url(&self, model: &str, stream: bool) -> String {
        let endpoint = if stream {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        format!(
            "{}/model/{}/{}",
            self.runtime_endpoint,
            url_encode_path(self.effective_model_id(model)),
            endpoint
        )
    }

    fn build_body(&self, family: BedrockFamily, request: &ChatRequest) -> Result<Vec<u8>> {
        let body = match family {
            BedrockFamily::Anthropic => {
                let mut messages =
                    super::anthropic::AnthropicProvider::build_wire_request(request, false);
                messages.stream = None;
                messages.anthropic_version = Some("bedrock-2023-05-31".to_string());
                let mut value = serde_json::to_value(&messages)?;
                // Bedrock carries the model in the URL, not the body
                if let Some(object) = value.as_object_mut() {
                    object.remove("model");
                }
                value
            }
            BedrockFamily::Titan => serde_json::to_value(wire::TitanRequest {
                input_text: flatten_prompt(&request.messages),
                text_generation_config: wire::TitanGenerationConfig {
                    max_token_count: if request.max_tokens > 0 {
                        request.max_tokens
                    } else {
                        8_192
                    },
                    temperature: effective_temperature(request.temperature, false),
                    top_p: effective_top_p(request.top_p),
                    stop_sequences: None,
                },
            })?,
            BedrockFamily::Jurassic => serde_json::to_value(wire::JurassicRequest {
                prompt: flatten_prompt(&request.messages),
                max_tokens: if request.max_tokens > 0 {
                    request.max_tokens
                } else {
                    2_048
                },
                temperature: effective_temperature(request.temperature, false),
                top_p: effective_top_p(request.top_p),
            })?,
            BedrockFamily::CohereCommand => {
                let (message, chat_history, preamble) = cohere_turns(&request.messages);
                serde_json::to_value(wire::CohereRequest {
                    message,
                    chat_history: if chat_history.is_empty() {
                        None
                    } else {
                        Some(chat_history)
                    },
                    preamble,
                    max_tokens: if request.max_tokens > 0 {
                        request.max_tokens
                    } else {
                        4_000
                    },
                    temperature: effective_temperature(request.temperature, false),
                    p: effective_top_p(request.top_p),
                    tools: if request.tools.is_empty() {
                        None
                    } else {
                        Some(
                            request
                                .tools
                                .iter()
                                .map(|t| wire::CohereTool {
                                    name: t.name.clone(),
                                    description: t.description.clone(),
                                    parameter_definitions: Some(t.parameters.clone()),
                                })
                                .collect(),
                        )
                    },
                    stream: None,
                })?
            }
            BedrockFamily::Llama => serde_json::to_value(wire::LlamaRequest {
                prompt: flatten_prompt(&request.messages),
                max_gen_len: if request.max_tokens > 0 {
                    request.max_tokens
                } else {
                    2_048
                },
                temperature: effective_temperature(request.temperature, false),
                top_p: effective_top_p(request.top_p),
            })?,
        };
        Ok(serde_json::to_vec(&body)?)
    }

    /// Sign and dispatch one runtime call
    async fn send_invoke(
        &self,
        url: &str,
        body: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let parsed = url::Url::parse(url)
            .map_err(|e| GatewayError::Internal(format!("invalid URL: {}", e)))?;
        let signed_headers = sigv4_sign(
            "POST",
            &parsed,
            &[("content-type", "application/json")],
            &body,
            &self.credentials,
            &self.region,
            "bedrock",
        );

        let mut builder = self.client.post(url).timeout(self.timeout);
        for (name, value) in &signed_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = builder.header("Content-Type", "application/json").body(body);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            result = builder.send() => result.map_err(GatewayError::from)?,
        };
        Ok(response)
    }

    async fn classify_failure(&self, response: reqwest::Response) -> GatewayError {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        let status = response.status().as_u16();
        let exception_type = response
            .headers()
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.text().await.unwrap_or_default();

        if let Some(exception) = exception_type {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or(body);
            classify_bedrock(&exception, &message)
        } else {
            classify_http(status, &body)
        }
    }
}

/// Render the conversation as a flat prompt for the completion-style
/// families (Titan, Jurassic, Llama).
fn flatten_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let label = match message.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

/// Split the conversation into Cohere's (current message, history,
/// preamble) triple. History roles are USER / CHATBOT.
fn cohere_turns(messages: &[ChatMessage]) -> (String, Vec<wire::CohereChatTurn>, Option<String>) {
    let preamble = messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.clone());

    let positional: Vec<&ChatMessage> = messages
        .iter()
        .filter(|m| m.role == Role::User || m.role == Role::Assistant)
        .collect();

    let (current, history) = match positional.split_last() {
        Some((last, rest)) if last.role == Role::User => (last.content.clone(), rest),
        _ => (String::new(), positional.as_slice()),
    };

    let chat_history = history
        .iter()
        .map(|m| wire::CohereChatTurn {
            role: if m.role == Role::Assistant {
                "CHATBOT".to_string()
            } else {
                "USER".to_string()
            },
            message: m.content.clone(),
        })
        .collect();

    (current, chat_history, preamble)
}

/// Parsed unary response, shared across the family parsers
struct ParsedBody {
    content: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
    finish_reason: String,
    metadata: HashMap<String, serde_json::Value>,
}

fn parse_body(family: BedrockFamily, bytes: &[u8]) -> Result<ParsedBody> {
    match family {
        BedrockFamily::Anthropic => {
            let message: anthropic_wire::MessagesResponse = serde_json::from_slice(bytes)?;
            let parsed = super::anthropic::parse_messages_response(message);
            Ok(ParsedBody {
                content: parsed.content,
                tool_calls: parsed.tool_calls,
                usage: parsed.usage,
                finish_reason: parsed.finish_reason,
                metadata: parsed.metadata,
            })
        }
        BedrockFamily::Titan => {
            let response: wire::TitanResponse = serde_json::from_slice(bytes)?;
            let result = response
                .results
                .first()
                .ok_or_else(|| GatewayError::Transport("empty Titan results".to_string()))?;
            Ok(ParsedBody {
                content: result.output_text.clone(),
                tool_calls: Vec::new(),
                usage: Usage::new(response.input_text_token_count, result.token_count),
                finish_reason: result
                    .completion_reason
                    .clone()
                    .unwrap_or_else(|| FINISH_STOP.to_string()),
                metadata: HashMap::new(),
            })
        }
        BedrockFamily::Jurassic => {
            let response: wire::JurassicResponse = serde_json::from_slice(bytes)?;
            let completion = response
                .completions
                .first()
                .ok_or_else(|| GatewayError::Transport("empty Jurassic completions".to_string()))?;
            Ok(ParsedBody {
                content: completion.data.text.clone(),
                tool_calls: Vec::new(),
                usage: Usage::default(),
                finish_reason: completion
                    .finish_reason
                    .as_ref()
                    .map(|r| r.reason.clone())
                    .unwrap_or_else(|| FINISH_STOP.to_string()),
                metadata: HashMap::new(),
            })
        }
        BedrockFamily::CohereCommand => {
            let response: wire::CohereResponse = serde_json::from_slice(bytes)?;
            let usage = response
                .meta
                .as_ref()
                .and_then(|m| m.billed_units.as_ref())
                .map(|u| Usage::new(u.input_tokens, u.output_tokens))
                .unwrap_or_default();
            Ok(ParsedBody {
                content: response.text,
                tool_calls: Vec::new(),
                usage,
                finish_reason: response
                    .finish_reason
                    .unwrap_or_else(|| FINISH_STOP.to_string()),
                metadata: HashMap::new(),
            })
        }
        BedrockFamily::Llama => {
            let response: wire::LlamaResponse = serde_json::from_slice(bytes)?;
            Ok(ParsedBody {
                content: response.generation,
                tool_calls: Vec::new(),
                usage: Usage::new(response.prompt_token_count, response.generation_token_count),
                finish_reason: response.stop_reason.unwrap_or_else(|| FINISH_STOP.to_string()),
                metadata: HashMap::new(),
            })
        }
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Bedrock
    }

    fn display_name(&self) -> &str {
        "AWS Bedrock"
    }

    fn models(&self) -> Vec<ModelInfo> {
        let base = vec![Capability::Chat, Capability::Streaming];
        let claude = vec![
            Capability::Chat,
            Capability::Streaming,
            Capability::Tools,
            Capability::Vision,
        ];
        let entry = |name: &str, ctx: u32, out: u32, caps: &Vec<Capability>, desc: &str| ModelInfo {
            name: name.to_string(),
            provider: ProviderType::Bedrock,
            context_window: ctx,
            max_output_tokens: out,
            capabilities: caps.clone(),
            supports_tools: caps.contains(&Capability::Tools),
            supports_vision: caps.contains(&Capability::Vision),
            description: desc.to_string(),
        };
        vec![
            entry(
                "anthropic.claude-3-5-sonnet-20241022-v2:0",
                200_000,
                8_192,
                &claude,
                "Claude 3.5 Sonnet on Bedrock",
            ),
            entry(
                "anthropic.claude-3-5-haiku-20241022-v1:0",
                200_000,
                8_192,
                &claude,
                "Claude 3.5 Haiku on Bedrock",
            ),
            entry("amazon.titan-text-express-v1", 8_192, 8_192, &base, "Titan Text Express"),
            entry("ai21.j2-ultra-v1", 8_192, 8_191, &base, "Jurassic-2 Ultra"),
            entry("cohere.command-r-plus-v1:0", 128_000, 4_000, &base, "Command R+"),
            entry("meta.llama3-70b-instruct-v1:0", 8_192, 2_048, &base, "Llama 3 70B Instruct"),
        ]
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Chat, Capability::Streaming, Capability::Tools]
    }

    async fn generate(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let family = family_for(&request.model).ok_or_else(|| {
            GatewayError::ModelNotFound(format!("unknown Bedrock model family: {}", request.model))
        })?;
        let body = self.build_body(family, request)?;
        let url = self.invoke_url(&request.model, false);
        let started = Instant::now();

        let response = self.send_invoke(&url, body, cancel).await?;
        if !response.status().is_success() {
            return Err(self.classify_failure(response).await);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let parsed = parse_body(family, &bytes)?;

        Ok(ChatResponse {
            id: uuid::Uuid::new_v4().to_string(),
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
        let family = family_for(&request.model).ok_or_else(|| {
            GatewayError::ModelNotFound(format!("unknown Bedrock model family: {}", request.model))
        })?;
        if family == BedrockFamily::Jurassic {
            return Err(GatewayError::InvalidRequest(
                "Jurassic models do not support streaming on Bedrock".to_string(),
            ));
        }

        let body = self.build_body(family, request)?;
        let url = self.invoke_url(&request.model, true);

        let response = self.send_invoke(&url, body, &cancel).await?;
        if !response.status().is_success() {
            return Err(self.classify_failure(response).await);
        }

        let (tx, rx) = delta_channel();
        let mut pump = DeltaPump::new(request.id.clone(), tx, cancel.clone());

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut parser = EventStreamParser::default();
            let mut state = StreamState::default();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = byte_stream.next() => chunk,
                };

                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        pump.fail(GatewayError::Transport(e.to_string())).await;
                        return;
                    }
                    None => {
                        pump.fail(GatewayError::Transport(
                            "stream ended before the terminal event".to_string(),
                        ))
                        .await;
                        return;
                    }
                };

                for frame in parser.feed(&bytes) {
                    if let Some(exception) = frame.exception_type {
                        let message = serde_json::from_slice::<serde_json::Value>(&frame.payload)
                            .ok()
                            .and_then(|v| {
                                v.get("message").and_then(|m| m.as_str()).map(String::from)
                            })
                            .unwrap_or_else(|| "stream exception".to_string());
                        pump.fail(classify_bedrock(&exception, &message)).await;
                        return;
                    }

                    if frame.event_type.as_deref().is_some_and(|t| t != "chunk") {
                        continue;
                    }
                    let Some(chunk_bytes) = decode_chunk_payload(&frame.payload) else {
                        continue;
                    };

                    match handle_family_chunk(family, &chunk_bytes, &mut pump, &mut state).await {
                        ChunkOutcome::Continue => {}
                        ChunkOutcome::Stopped => return,
                        ChunkOutcome::Finished => {
                            if let Some(usage) = state.usage() {
                                pump.set_usage(usage);
                            }
                            pump.finish().await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn is_available(&self) -> bool {
        let url = format!("https://bedrock.{}.amazonaws.com/foundation-models", self.region);
        let Ok(parsed) = url::Url::parse(&url) else {
            return false;
        };
        let signed_headers = sigv4_sign(
            "GET",
            &parsed,
            &[],
            b"",
            &self.credentials,
            &self.region,
            "bedrock",
        );
        let mut builder = self.client.get(&url).timeout(self.timeout);
        for (name, value) in &signed_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
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
        debug!("bedrock adapter shut down");
    }
}

// ============================================================
// Streaming chunk handling per family
// ============================================================

#[derive(Default)]
struct StreamState {
    input_tokens: u64,
    output_tokens: u64,
    have_usage: bool,
}

impl StreamState {
    fn usage(&self) -> Option<Usage> {
        self.have_usage
            .then(|| Usage::new(self.input_tokens, self.output_tokens))
    }
}

enum ChunkOutcome {
    Continue,
    /// Consumer went away or request cancelled; pump already dropped
    Stopped,
    Finished,
}

async fn handle_family_chunk(
    family: BedrockFamily,
    bytes: &[u8],
    pump: &mut DeltaPump,
    state: &mut StreamState,
) -> ChunkOutcome {
    // The final chunk of every family carries invocation metrics
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
        if let Some(metrics) = value.get("amazon-bedrock-invocationMetrics") {
            if let (Some(input), Some(output)) = (
                metrics.get("inputTokenCount").and_then(|v| v.as_u64()),
                metrics.get("outputTokenCount").and_then(|v| v.as_u64()),
            ) {
                state.input_tokens = input;
                state.output_tokens = output;
                state.have_usage = true;
            }
        }
    }

    match family {
        BedrockFamily::Anthropic => {
            let Ok(event) = serde_json::from_slice::<anthropic_wire::StreamEvent>(bytes) else {
                return ChunkOutcome::Continue;
            };
            match event.event_type.as_str() {
                "message_start" => {
                    if let Some(usage) = event.message.as_ref().and_then(|m| m.usage.as_ref()) {
                        state.input_tokens = usage.input_tokens;
                    }
                }
                "content_block_delta" => {
                    if let Some(text) = event.delta.as_ref().and_then(|d| d.text.as_ref()) {
                        if !pump.send_delta(text).await {
                            return ChunkOutcome::Stopped;
                        }
                    }
                }
                "message_delta" => {
                    if let Some(reason) =
                        event.delta.as_ref().and_then(|d| d.stop_reason.as_ref())
                    {
                        pump.set_finish_reason(reason.clone());
                    }
                    if let Some(usage) = &event.usage {
                        state.output_tokens = usage.output_tokens;
                        state.have_usage = true;
                    }
                }
                "message_stop" => return ChunkOutcome::Finished,
                _ => {}
            }
            ChunkOutcome::Continue
        }
        BedrockFamily::Titan => {
            let Ok(chunk) = serde_json::from_slice::<wire::TitanChunk>(bytes) else {
                return ChunkOutcome::Continue;
            };
            if !chunk.output_text.is_empty() && !pump.send_delta(&chunk.output_text).await {
                return ChunkOutcome::Stopped;
            }
            if let Some(input) = chunk.input_text_token_count {
                state.input_tokens = input;
            }
            if let Some(output) = chunk.total_output_text_token_count {
                state.output_tokens = output;
                state.have_usage = true;
            }
            if let Some(reason) = chunk.completion_reason {
                pump.set_finish_reason(reason);
                return ChunkOutcome::Finished;
            }
            ChunkOutcome::Continue
        }
        BedrockFamily::CohereCommand => {
            let Ok(chunk) = serde_json::from_slice::<wire::CohereChunk>(bytes) else {
                return ChunkOutcome::Continue;
            };
            if !chunk.text.is_empty() && !pump.send_delta(&chunk.text).await {
                return ChunkOutcome::Stopped;
            }
            if chunk.is_finished {
                if let Some(reason) = chunk.finish_reason {
                    pump.set_finish_reason(reason);
                }
                return ChunkOutcome::Finished;
            }
            ChunkOutcome::Continue
        }
        BedrockFamily::Llama => {
            let Ok(chunk) = serde_json::from_slice::<wire::LlamaChunk>(bytes) else {
                return ChunkOutcome::Continue;
            };
            if !chunk.generation.is_empty() && !pump.send_delta(&chunk.generation).await {
                return ChunkOutcome::Stopped;
            }
            if let Some(input) = chunk.prompt_token_count {
                state.input_tokens = input;
            }
            if let Some(output) = chunk.generation_token_count {
                state.output_tokens = output;
                state.have_usage = true;
            }
            if let Some(reason) = chunk.stop_reason {
                pump.set_finish_reason(reason);
                return ChunkOutcome::Finished;
            }
            ChunkOutcome::Continue
        }
        // Rejected before the stream starts
        BedrockFamily::Jurassic => ChunkOutcome::Continue,
    }
}

/// Decode a `chunk` event payload: `{"bytes": "<base64>"}` wrapping the
/// family chunk JSON.
fn decode_chunk_payload(payload: &[u8]) -> Option<Vec<u8>> {
    let envelope: wire::StreamPayload = serde_json::from_slice(payload).ok()?;
    base64::engine::general_purpose::STANDARD
        .decode(envelope.bytes.as_bytes())
        .ok()
}

// ============================================================
// AWS event-stream binary framing
// ============================================================

/// One decoded event-stream frame
struct EventFrame {
    event_type: Option<String>,
    exception_type: Option<String>,
    payload: Vec<u8>,
}

/// Incremental parser for the AWS event-stream framing used by
/// `invoke-with-response-stream`.
///
/// Frame layout: 4-byte total length, 4-byte headers length, 4-byte
/// prelude CRC, headers, payload, 4-byte message CRC (big endian
/// throughout). CRCs are not validated; TLS already covers integrity.
#[derive(Default)]
struct EventStreamParser {
    buffer: Vec<u8>,
}

impl EventStreamParser {
    fn feed(&mut self, bytes: &[u8]) -> Vec<EventFrame> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < 16 {
                break;
            }
            let total_len = u32::from_be_bytes(self.buffer[0..4].try_into().unwrap()) as usize;
            if total_len < 16 || self.buffer.len() < total_len {
                break;
            }
            let headers_len = u32::from_be_bytes(self.buffer[4..8].try_into().unwrap()) as usize;

            let frame: Vec<u8> = self.buffer.drain(..total_len).collect();
            let headers_end = 12 + headers_len;
            if headers_end + 4 > frame.len() {
                continue; // malformed frame, skip
            }
            let headers = parse_event_headers(&frame[12..headers_end]);
            let payload = frame[headers_end..frame.len() - 4].to_vec();

            frames.push(EventFrame {
                event_type: headers.get(":event-type").cloned(),
                exception_type: headers.get(":exception-type").cloned(),
                payload,
            });
        }

        frames
    }
}

/// Parse event-stream headers; only string-valued (type 7) headers are
/// retained, which covers `:event-type` / `:exception-type` /
/// `:message-type`.
fn parse_event_headers(mut bytes: &[u8]) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    while bytes.len() >= 2 {
        let name_len = bytes[0] as usize;
        if bytes.len() < 1 + name_len + 1 {
            break;
        }
        let name = String::from_utf8_lossy(&bytes[1..1 + name_len]).to_string();
        let value_type = bytes[1 + name_len];
        bytes = &bytes[1 + name_len + 1..];

        match value_type {
            // string: u16 length prefix
            7 => {
                if bytes.len() < 2 {
                    break;
                }
                let len = u16::from_be_bytes(bytes[0..2].try_into().unwrap()) as usize;
                if bytes.len() < 2 + len {
                    break;
                }
                let value = String::from_utf8_lossy(&bytes[2..2 + len]).to_string();
                headers.insert(name, value);
                bytes = &bytes[2 + len..];
            }
            // bool true/false carry no payload
            0 | 1 => {}
            // byte, i16, i32/f32 would need sized skips; none appear in
            // bedrock streams, so stop rather than misparse
            _ => break,
        }
    }
    headers
}

// ============================================================
// AWS SigV4 Signing
// ============================================================

/// URL-encode a path segment (colons in Bedrock model ids, ARN slashes
/// stay encoded too).
fn url_encode_path(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => c.to_string(),
            _ => {
                let mut buf = [0u8; 4];
                let bytes = c.encode_utf8(&mut buf).as_bytes();
                bytes.iter().map(|b| format!("%{:02X}", b)).collect::<String>()
            }
        })
        .collect()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex_encode(&Sha256::digest(data))
}

/// Sign an HTTP request with AWS SigV4; returns the headers to attach.
fn sigv4_sign(
    method: &str,
    url: &url::Url,
    extra_headers: &[(&str, &str)],
    body: &[u8],
    credentials: &AwsCredentials,
    region: &str,
    service: &str,
) -> Vec<(String, String)> {
    let now = Utc::now();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    let host = url.host_str().unwrap_or("");
    let payload_hash = sha256_hex(body);

    // Canonical headers, sorted by lowercase name
    let mut headers_map: BTreeMap<&str, String> = BTreeMap::new();
    headers_map.insert("host", host.to_string());
    headers_map.insert("x-amz-date", amz_date.clone());
    headers_map.insert("x-amz-content-sha256", payload_hash.clone());
    if let Some(token) = &credentials.session_token {
        headers_map.insert("x-amz-security-token", token.clone());
    }
    for (name, value) in extra_headers {
        headers_map.insert(name, value.to_string());
    }

    let canonical_headers: String = headers_map
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    let signed_headers: String = headers_map.keys().copied().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        url.path(),
        url.query().unwrap_or(""),
        canonical_headers,
        signed_headers,
        payload_hash
    );

    let algorithm = "AWS4-HMAC-SHA256";
    let credential_scope = format!("{}/{}/{}/aws4_request", date_stamp, region, service);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        algorithm,
        amz_date,
        credential_scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac_sha256(
        format!("AWS4{}", credentials.secret_access_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex_encode(&hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        algorithm, credentials.access_key_id, credential_scope, signed_headers, signature
    );

    let mut result = vec![
        ("Authorization".to_string(), authorization),
        ("x-amz-date".to_string(), amz_date),
        ("x-amz-content-sha256".to_string(), payload_hash),
    ];
    if let Some(token) = &credentials.session_token {
        result.push(("x-amz-security-token".to_string(), token.clone()));
    }
    result
}
