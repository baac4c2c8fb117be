use std::collections::BTreeMap;
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

use crate::config::{resolve_credential, OpenAiSettings};
use crate::error::{GatewayError, Result};
use crate::models::openai as wire;
use crate::provider::{
    Capability, HealthStatus, ModelInfo, Provider, ProviderHealth, ProviderType,
};
use crate::providers::{classify_response, effective_temperature, effective_top_p, send_cancellable};
use crate::reasoning::thinking_config_for;
use crate::streaming::{delta_channel, DeltaPump};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, EffortLevel, StreamItem, ToolCall, Usage,
};

/// Which OpenAI-compatible service this adapter fronts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenAiFlavor {
    OpenAi,
    Xai,
    OpenRouter,
    Qwen,
    /// A locally-hosted OpenAI-compatible server (llama.cpp, vLLM, …)
    Local,
}

/// Adapter for the OpenAI chat-completions wire format.
///
/// One implementation serves OpenAI, xAI, OpenRouter, Qwen/DashScope and
/// locally-hosted servers; only base URL, credential source and model
/// table differ per flavor.
pub struct OpenAiCompatibleProvider {
    flavor: OpenAiFlavor,
    provider_type: ProviderType,
    display_name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    /// Informational headers OpenRouter asks clients to send
    extra_headers: Vec<(&'static str, String)>,
    error_count: AtomicU32,
}

impl OpenAiCompatibleProvider {
    pub fn openai(settings: &OpenAiSettings) -> Self {
        Self::build(
            OpenAiFlavor::OpenAi,
            ProviderType::OpenAi,
            "OpenAI",
            "https://api.openai.com/v1",
            &["OPENAI_API_KEY"],
            settings,
        )
    }

    pub fn xai(settings: &OpenAiSettings) -> Self {
        Self::build(
            OpenAiFlavor::Xai,
            ProviderType::Xai,
            "xAI",
            "https://api.x.ai/v1",
            &["XAI_API_KEY"],
            settings,
        )
    }

    pub fn openrouter(settings: &OpenAiSettings) -> Self {
        let mut provider = Self::build(
            OpenAiFlavor::OpenRouter,
            ProviderType::OpenRouter,
            "OpenRouter",
            "https://openrouter.ai/api/v1",
            &["OPENROUTER_API_KEY"],
            settings,
        );
        provider.extra_headers = vec![
            ("HTTP-Referer", "https://github.com/llm-gateway".to_string()),
            ("X-Title", "llm-gateway".to_string()),
        ];
        provider
    }

    pub fn qwen(settings: &OpenAiSettings) -> Self {
        Self::build(
            OpenAiFlavor::Qwen,
            ProviderType::Qwen,
            "Qwen",
            "https://dashscope.aliyuncs.com/compatible-mode/v1",
            &["DASHSCOPE_API_KEY"],
            settings,
        )
    }

    /// Locally-hosted server; `base_url` in the settings is required in
    /// practice (there is no meaningful default beyond localhost).
    pub fn local(display_name: impl Into<String>, settings: &OpenAiSettings) -> Self {
        let mut provider = Self::build(
            OpenAiFlavor::Local,
            ProviderType::Local,
            "Local",
            "http://localhost:8080/v1",
            &[],
            settings,
        );
        provider.display_name = display_name.into();
        provider
    }

    fn build(
        flavor: OpenAiFlavor,
        provider_type: ProviderType,
        display_name: &str,
        default_base: &str,
        key_env_vars: &[&str],
        settings: &OpenAiSettings,
    ) -> Self {
        let api_key = resolve_credential(settings.api_key.as_deref(), key_env_vars);
        Self {
            flavor,
            provider_type,
            display_name: display_name.to_string(),
            client: Client::new(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| default_base.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            timeout: Duration::from_secs(settings.timeout_seconds),
            extra_headers: Vec::new(),
            error_count: AtomicU32::new(0),
        }
    }

    fn request_builder(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(*name, value);
        }
        builder
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_wire_request(&self, request: &ChatRequest, stream: bool) -> wire::ChatCompletionRequest {
        // The OpenAI system slot is positional, so messages pass through
        // in order with only role/name translation.
        let messages = request
            .messages
            .iter()
            .map(|m: &ChatMessage| wire::ChatMessage {
                role: m.role.as_str().to_string(),
                content: Some(m.content.clone()),
                name: m.name.clone(),
                tool_call_id: m.tool_call_id.clone(),
                tool_calls: None,
            })
            .collect();

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| wire::Tool {
                        tool_type: "function".to_string(),
                        function: wire::FunctionDef {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };

        let thinking = thinking_config_for(request);
        let reasoning_effort = thinking.map(|cfg| {
            match cfg.effort {
                EffortLevel::Minimal => "minimal",
                EffortLevel::Low => "low",
                EffortLevel::Medium => "medium",
                EffortLevel::High => "high",
            }
            .to_string()
        });

        wire::ChatCompletionRequest {
            model: request.model.clone(),
            messages,
            max_tokens: if request.max_tokens > 0 {
                Some(request.max_tokens)
            } else {
                None
            },
            temperature: effective_temperature(request.temperature, thinking.is_some()),
            top_p: effective_top_p(request.top_p),
            stream: if stream { Some(true) } else { None },
            stream_options: if stream {
                Some(wire::StreamOptions { include_usage: true })
            } else {
                None
            },
            tools,
            reasoning_effort,
        }
    }

    fn cheapest_model(&self) -> &'static str {
        match self.flavor {
            OpenAiFlavor::OpenAi => "gpt-4o-mini",
            OpenAiFlavor::Xai => "grok-2-latest",
            OpenAiFlavor::OpenRouter => "openai/gpt-4o-mini",
            OpenAiFlavor::Qwen => "qwen-turbo",
            OpenAiFlavor::Local => "local-default",
        }
    }

    fn note_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }
}

fn parse_tool_calls(message: &wire::ChatMessage) -> Vec<ToolCall> {
    message
        .tool_calls
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|call| ToolCall {
            id: call.id.clone(),
            name: call.function.name.clone(),
            arguments: serde_json::from_str(&call.function.arguments)
                .unwrap_or(serde_json::Value::Null),
        })
        .collect()
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn models(&self) -> Vec<ModelInfo> {
        let chat = vec![Capability::Chat, Capability::Streaming, Capability::Tools];
        let with_vision = vec![
            Capability::Chat,
            Capability::Streaming,
            Capability::Tools,
            Capability::Vision,
        ];
        let reasoning = vec![Capability::Chat, Capability::Streaming, Capability::Reasoning];

        let entry = |name: &str, ctx: u32, out: u32, caps: &Vec<Capability>, desc: &str| ModelInfo {
            name: name.to_string(),
            provider: self.provider_type,
            context_window: ctx,
            max_output_tokens: out,
            capabilities: caps.clone(),
            supports_tools: caps.contains(&Capability::Tools),
            supports_vision: caps.contains(&Capability::Vision),
            description: desc.to_string(),
        };

        match self.flavor {
            OpenAiFlavor::OpenAi => vec![
                entry("gpt-4o", 128_000, 16_384, &with_vision, "Flagship multimodal model"),
                entry("gpt-4o-mini", 128_000, 16_384, &with_vision, "Fast, low-cost multimodal model"),
                entry("o1", 200_000, 100_000, &reasoning, "Reasoning model"),
                entry("o3-mini", 200_000, 100_000, &reasoning, "Small reasoning model"),
            ],
            OpenAiFlavor::Xai => vec![
                entry("grok-2-latest", 131_072, 8_192, &chat, "Grok 2"),
                entry("grok-beta", 131_072, 8_192, &chat, "Grok beta"),
            ],
            OpenAiFlavor::OpenRouter => vec![
                entry("openai/gpt-4o-mini", 128_000, 16_384, &chat, "GPT-4o mini via OpenRouter"),
                entry(
                    "anthropic/claude-3.5-sonnet",
                    200_000,
                    8_192,
                    &chat,
                    "Claude 3.5 Sonnet via OpenRouter",
                ),
                entry(
                    "meta-llama/llama-3.1-70b-instruct",
                    131_072,
                    4_096,
                    &chat,
                    "Llama 3.1 70B via OpenRouter",
                ),
            ],
            OpenAiFlavor::Qwen => vec![
                entry("qwen-max", 32_768, 8_192, &chat, "Qwen flagship"),
                entry("qwen-plus", 131_072, 8_192, &chat, "Qwen balanced"),
                entry("qwen-turbo", 1_000_000, 8_192, &chat, "Qwen fast tier"),
                entry("qwq-32b-preview", 32_768, 16_384, &reasoning, "QwQ reasoning preview"),
            ],
            OpenAiFlavor::Local => vec![entry(
                "local-default",
                8_192,
                4_096,
                &chat,
                "Model served by the local endpoint",
            )],
        }
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::Chat,
            Capability::Streaming,
            Capability::Tools,
            Capability::Reasoning,
        ]
    }

    async fn generate(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let body = self.build_wire_request(request, false);
        let started = Instant::now();

        let response = send_cancellable(
            self.request_builder(&self.completions_url()).json(&body),
            cancel,
        )
        .await
        .inspect_err(|_| self.note_error())?;

        if !response.status().is_success() {
            self.note_error();
            return Err(classify_response(response).await);
        }

        let completion: wire::ChatCompletionResponse = response.json().await.map_err(|e| {
            self.note_error();
            GatewayError::Transport(format!("failed to decode response: {}", e))
        })?;

        let choice = completion
            .choices
            .first()
            .ok_or_else(|| GatewayError::Transport("response carried no choices".to_string()))?;

        let usage = completion
            .usage
            .as_ref()
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let tool_calls = parse_tool_calls(&choice.message);
        let finish_reason = choice
            .finish_reason
            .clone()
            .unwrap_or_else(|| crate::types::FINISH_STOP.to_string());

        Ok(ChatResponse {
            id: completion.id,
            request_id: request.id.clone(),
            content: choice.message.content.clone().unwrap_or_default(),
            tool_calls,
            usage,
            finish_reason: crate::types::normalize_finish_reason(&finish_reason),
            latency_ms: started.elapsed().as_millis() as u64,
            created: Utc::now(),
            metadata: Default::default(),
        })
    }

    async fn generate_stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamItem>> {
        let body = self.build_wire_request(request, true);

        let response = send_cancellable(
            self.request_builder(&self.completions_url()).json(&body),
            &cancel,
        )
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
            // Tool calls stream as indexed fragments
            let mut calls: BTreeMap<u32, (String, String, String)> = BTreeMap::new();
            let mut terminal_seen = false;

            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return, // channel closes, no terminal event
                    event = events.next() => event,
                };

                let event = match event {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        pump.fail(GatewayError::Transport(e.to_string())).await;
                        return;
                    }
                    None => break,
                };

                if event.data == "[DONE]" {
                    terminal_seen = true;
                    break;
                }

                let chunk: wire::ChatCompletionChunk = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(error = %e, "skipping unparseable stream chunk");
                        continue;
                    }
                };

                pump.set_response_id(chunk.id.clone());
                if let Some(usage) = &chunk.usage {
                    pump.set_usage(Usage::new(usage.prompt_tokens, usage.completion_tokens));
                }
                if let Some(choice) = chunk.choices.first() {
                    if let Some(fragment) = &choice.delta.content {
                        if !pump.send_delta(fragment).await {
                            return;
                        }
                    }
                    for partial in choice.delta.tool_calls.as_deref().unwrap_or_default() {
                        let slot = calls.entry(partial.index).or_default();
                        if let Some(id) = &partial.id {
                            slot.0 = id.clone();
                        }
                        if let Some(function) = &partial.function {
                            if let Some(name) = &function.name {
                                slot.1 = name.clone();
                            }
                            if let Some(arguments) = &function.arguments {
                                slot.2.push_str(arguments);
                            }
                        }
                    }
                    if let Some(reason) = &choice.finish_reason {
                        pump.set_finish_reason(reason.clone());
                        terminal_seen = true;
                    }
                }
            }

            if !terminal_seen {
                pump.fail(GatewayError::Transport(
                    "stream ended before the terminal event".to_string(),
                ))
                .await;
                return;
            }

            for (_, (id, name, arguments)) in calls {
                pump.push_tool_call(ToolCall {
                    id,
                    name,
                    arguments: serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null),
                });
            }
            pump.finish().await;
        });

        Ok(rx)
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/models", self.base_url);
        let mut builder = self.client.get(&url).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        match builder.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(provider = %self.provider_type, error = %e, "availability probe failed");
                false
            }
        }
    }

    async fn health_check(&self) -> Result<ProviderHealth> {
        let mut probe = ChatRequest::new(self.cheapest_model(), vec![ChatMessage::user("Hi")]);
        probe.max_tokens = 1;

        let started = Instant::now();
        let cancel = CancellationToken::new();
        let result = self.generate(&probe, &cancel).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = match &result {
            Ok(_) if latency_ms < 5_000 => HealthStatus::Healthy,
            Ok(_) => HealthStatus::Degraded,
            Err(e) => {
                warn!(provider = %self.provider_type, error = %e, "health probe failed");
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
        // reqwest pools close as the last clone drops; nothing to tear
        // down beyond noting the event.
        debug!(provider = %self.provider_type, "adapter shut down");
    }
}
