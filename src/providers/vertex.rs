use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{resolve_credential, VertexSettings};
use crate::error::{GatewayError, Result};
use crate::models::gemini as wire;
use crate::provider::{
    Capability, HealthStatus, ModelInfo, Provider, ProviderHealth, ProviderType,
};
use crate::providers::{classify_response, effective_temperature, effective_top_p, send_cancellable};
use crate::streaming::{delta_channel, DeltaPump};
use crate::types::{
    normalize_finish_reason, ChatMessage, ChatRequest, ChatResponse, Role, StreamItem, ToolCall,
    Usage, FINISH_STOP,
};

const DEFAULT_LOCATION: &str = "us-central1";
const CHEAPEST_MODEL: &str = "gemini-1.5-flash";
const CLAUDE_VERTEX_VERSION: &str = "vertex-2023-10-16";
const CLOUD_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Refresh tokens one minute before they expire
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Adapter for Google Vertex AI.
///
/// Speaks two sub-protocols behind one endpoint family: Gemini
/// `generateContent`/`streamGenerateContent`, and Claude through the
/// Model Garden `rawPredict` route (which offers no streaming).
pub struct VertexProvider {
    client: Client,
    project: String,
    location: String,
    endpoint: String,
    tokens: TokenManager,
    timeout: Duration,
    error_count: AtomicU32,
}

impl VertexProvider {
    pub fn new(settings: &VertexSettings) -> Result<Self> {
        let project = resolve_credential(settings.project_id.as_deref(), &["VERTEX_PROJECT_ID"])
            .ok_or_else(|| {
                GatewayError::AuthFailed("no Vertex project id configured".to_string())
            })?;
        let location = resolve_credential(settings.location.as_deref(), &["VERTEX_LOCATION"])
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string());
        let endpoint = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com", location))
            .trim_end_matches('/')
            .to_string();
        let client = Client::new();
        Ok(Self {
            tokens: TokenManager::new(
                client.clone(),
                settings.access_token.clone(),
                resolve_credential(
                    settings.credentials_path.as_deref(),
                    &["GOOGLE_APPLICATION_CREDENTIALS"],
                ),
            ),
            client,
            project,
            location,
            endpoint,
            timeout: Duration::from_secs(settings.timeout_seconds),
            error_count: AtomicU32::new(0),
        })
    }

    fn model_url(&self, publisher: &str, model: &str, action: &str) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/publishers/{}/models/{}:{}",
            self.endpoint, self.project, self.location, publisher, model, action
        )
    }

    fn is_claude_model(model: &str) -> bool {
        model.starts_with("claude")
    }

    fn build_gemini_request(&self, request: &ChatRequest) -> wire::GenerateContentRequest {
        let system_parts: Vec<wire::Part> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| wire::Part::Text {
                text: m.content.clone(),
            })
            .collect();

        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match m.role {
                // Gemini calls the assistant side "model"
                Role::Assistant => wire::Content {
                    role: "model".to_string(),
                    parts: vec![wire::Part::Text {
                        text: m.content.clone(),
                    }],
                },
                Role::Tool => wire::Content {
                    role: "user".to_string(),
                    parts: vec![wire::Part::FunctionResponse {
                        function_response: wire::FunctionResponse {
                            name: m
                                .name
                                .clone()
                                .or_else(|| m.tool_call_id.clone())
                                .unwrap_or_default(),
                            response: serde_json::json!({ "result": m.content }),
                        },
                    }],
                },
                _ => wire::Content {
                    role: "user".to_string(),
                    parts: vec![wire::Part::Text {
                        text: m.content.clone(),
                    }],
                },
            })
            .collect();

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(vec![wire::Tool {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| wire::FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: Some(t.parameters.clone()),
                    })
                    .collect(),
            }])
        };

        wire::GenerateContentRequest {
            contents,
            system_instruction: if system_parts.is_empty() {
                None
            } else {
                Some(wire::SystemInstruction {
                    parts: system_parts,
                })
            },
            generation_config: Some(wire::GenerationConfig {
                temperature: effective_temperature(request.temperature, false),
                top_p: effective_top_p(request.top_p),
                max_output_tokens: if request.max_tokens > 0 {
                    Some(request.max_tokens)
                } else {
                    None
                },
                stop_sequences: None,
            }),
            safety_settings: Some(wire::default_safety_settings()),
            tool_config: tools.as_ref().map(|_| wire::ToolConfig {
                function_calling_config: wire::FunctionCallingConfig {
                    mode: "AUTO".to_string(),
                    allowed_function_names: None,
                },
            }),
            tools,
        }
    }

    async fn authorized_post(&self, url: &str) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.access_token().await?;
        Ok(self
            .client
            .post(url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .timeout(self.timeout))
    }

    async fn generate_gemini(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let body = self.build_gemini_request(request);
        let url = self.model_url("google", &request.model, "generateContent");
        let started = Instant::now();

        let response = send_cancellable(self.authorized_post(&url).await?.json(&body), cancel)
            .await
            .inspect_err(|_| self.note_error())?;

        if !response.status().is_success() {
            self.note_error();
            return Err(classify_response(response).await);
        }

        let parsed: wire::GenerateContentResponse = response.json().await.map_err(|e| {
            self.note_error();
            GatewayError::Transport(format!("failed to decode response: {}", e))
        })?;

        let (content, tool_calls, finish_reason) = collect_candidate(&parsed);
        let usage = parsed
            .usage_metadata
            .as_ref()
            .map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();

        Ok(ChatResponse {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request.id.clone(),
            content,
            tool_calls,
            usage,
            finish_reason: normalize_finish_reason(&finish_reason),
            latency_ms: started.elapsed().as_millis() as u64,
            created: Utc::now(),
            metadata: Default::default(),
        })
    }

    async fn generate_claude(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let mut messages = super::anthropic::AnthropicProvider::build_wire_request(request, false);
        messages.stream = None;
        messages.anthropic_version = Some(CLAUDE_VERTEX_VERSION.to_string());
        let mut body = serde_json::to_value(&messages)?;
        // rawPredict addresses the model through the URL
        if let Some(object) = body.as_object_mut() {
            object.remove("model");
        }

        let url = self.model_url("anthropic", &request.model, "rawPredict");
        let started = Instant::now();

        let response = send_cancellable(self.authorized_post(&url).await?.json(&body), cancel)
            .await
            .inspect_err(|_| self.note_error())?;

        if !response.status().is_success() {
            self.note_error();
            return Err(classify_response(response).await);
        }

        let message: crate::models::anthropic::MessagesResponse =
            response.json().await.map_err(|e| {
                self.note_error();
                GatewayError::Transport(format!("failed to decode response: {}", e))
            })?;
        let parsed = super::anthropic::parse_messages_response(message);

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

    fn note_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reduce the first candidate to (text, tool calls, finish reason)
fn collect_candidate(response: &wire::GenerateContentResponse) -> (String, Vec<ToolCall>, String) {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    let mut finish_reason = FINISH_STOP.to_string();

    if let Some(candidate) = response.candidates.first() {
        if let Some(body) = &candidate.content {
            for part in &body.parts {
                match part {
                    wire::Part::Text { text } => content.push_str(text),
                    wire::Part::FunctionCall { function_call } => tool_calls.push(ToolCall {
                        id: format!("call_{}", tool_calls.len() + 1),
                        name: function_call.name.clone(),
                        arguments: function_call.args.clone(),
                    }),
                    _ => {}
                }
            }
        }
        if let Some(reason) = &candidate.finish_reason {
            finish_reason = reason.clone();
        }
    }

    (content, tool_calls, finish_reason)
}

#[async_trait]
impl Provider for VertexProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Vertex
    }

    fn display_name(&self) -> &str {
        "Google Vertex AI"
    }

    fn models(&self) -> Vec<ModelInfo> {
        let gemini = vec![
            Capability::Chat,
            Capability::Streaming,
            Capability::Tools,
            Capability::Vision,
        ];
        let claude = vec![Capability::Chat, Capability::Tools, Capability::Vision];
        let entry = |name: &str, ctx: u32, out: u32, caps: &Vec<Capability>, desc: &str| ModelInfo {
            name: name.to_string(),
            provider: ProviderType::Vertex,
            context_window: ctx,
            max_output_tokens: out,
            capabilities: caps.clone(),
            supports_tools: true,
            supports_vision: true,
            description: desc.to_string(),
        };
        vec![
            entry("gemini-1.5-pro", 2_097_152, 8_192, &gemini, "Gemini 1.5 Pro"),
            entry("gemini-1.5-flash", 1_048_576, 8_192, &gemini, "Gemini 1.5 Flash"),
            entry("gemini-2.0-flash", 1_048_576, 8_192, &gemini, "Gemini 2.0 Flash"),
            entry(
                "claude-3-5-sonnet-v2@20241022",
                200_000,
                8_192,
                &claude,
                "Claude 3.5 Sonnet via Model Garden (no streaming)",
            ),
        ]
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::Chat,
            Capability::Streaming,
            Capability::Tools,
            Capability::Vision,
        ]
    }

    async fn generate(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        if Self::is_claude_model(&request.model) {
            self.generate_claude(request, cancel).await
        } else {
            self.generate_gemini(request, cancel).await
        }
    }

    async fn generate_stream(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamItem>> {
        if Self::is_claude_model(&request.model) {
            return Err(GatewayError::InvalidRequest(
                "streaming is not offered for Claude models on Vertex AI".to_string(),
            ));
        }

        let body = self.build_gemini_request(request);
        let url = format!(
            "{}?alt=sse",
            self.model_url("google", &request.model, "streamGenerateContent")
        );

        let response = send_cancellable(self.authorized_post(&url).await?.json(&body), &cancel)
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
            let mut finish_seen = false;

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
                    None => break,
                };

                let chunk: wire::GenerateContentResponse = match serde_json::from_str(&event.data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        debug!(error = %e, "skipping unparseable stream chunk");
                        continue;
                    }
                };

                let (text, calls, _) = collect_candidate(&chunk);
                if !text.is_empty() && !pump.send_delta(&text).await {
                    return;
                }
                for call in calls {
                    pump.push_tool_call(call);
                }
                if let Some(reason) = chunk
                    .candidates
                    .first()
                    .and_then(|c| c.finish_reason.as_ref())
                {
                    pump.set_finish_reason(reason.clone());
                    finish_seen = true;
                }
                if let Some(usage) = &chunk.usage_metadata {
                    pump.set_usage(Usage::new(
                        usage.prompt_token_count,
                        usage.candidates_token_count,
                    ));
                }
            }

            if finish_seen {
                pump.finish().await;
            } else {
                pump.fail(GatewayError::Transport(
                    "stream ended before a finish reason".to_string(),
                ))
                .await;
            }
        });

        Ok(rx)
    }

    async fn is_available(&self) -> bool {
        // Credentials that cannot mint a token make the adapter unusable
        // regardless of endpoint reachability.
        if self.tokens.access_token().await.is_err() {
            return false;
        }
        match self.client.get(&self.endpoint).timeout(self.timeout).send().await {
            Ok(_) => true,
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
        debug!("vertex adapter shut down");
    }
}

// ============================================================
// Service-account token exchange
// ============================================================

/// Minimal slice of a Google service-account key file
#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Resolves and caches OAuth2 access tokens.
///
/// An explicit token from configuration wins; otherwise a JWT-bearer
/// assertion signed with the service-account key is exchanged at the
/// key's token endpoint, and the result cached until shortly before
/// expiry.
struct TokenManager {
    client: Client,
    explicit: Option<String>,
    credentials_path: Option<String>,
    cached: tokio::sync::Mutex<Option<CachedToken>>,
}

impl TokenManager {
    fn new(client: Client, explicit: Option<String>, credentials_path: Option<String>) -> Self {
        Self {
            client,
            explicit,
            credentials_path,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String> {
        if let Some(token) = &self.explicit {
            return Ok(token.clone());
        }

        let mut cached = self.cached.lock().await;
        if let Some(existing) = cached.as_ref() {
            if existing.expires_at > Instant::now() + TOKEN_EXPIRY_SKEW {
                return Ok(existing.token.clone());
            }
        }

        let path = self.credentials_path.as_ref().ok_or_else(|| {
            GatewayError::AuthFailed(
                "no Vertex access token or service-account credentials configured".to_string(),
            )
        })?;
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::AuthFailed(format!("cannot read service-account file: {}", e))
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::AuthFailed(format!("malformed service-account file: {}", e))
        })?;

        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &key.client_email,
            scope: CLOUD_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_rsa_pem(key.private_key.as_bytes())
                .map_err(|e| GatewayError::AuthFailed(format!("bad private key: {}", e)))?,
        )
        .map_err(|e| GatewayError::AuthFailed(format!("JWT signing failed: {}", e)))?;

        let response = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::AuthFailed(format!("token exchange failed: {}", e)))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::AuthFailed(format!(
                "token endpoint rejected the assertion: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::AuthFailed(format!("bad token response: {}", e)))?;

        let result = token.access_token.clone();
        *cached = Some(CachedToken {
            token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> VertexProvider {
        VertexProvider::new(&VertexSettings {
            project_id: Some("test-project".to_string()),
            location: Some("us-central1".to_string()),
            access_token: Some("ya29.test".to_string()),
            ..VertexSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn test_model_url_shape() {
        let provider = provider();
        let url = provider.model_url("google", "gemini-1.5-flash", "generateContent");
        assert_eq!(
            url,
            "https://us-central1-aiplatform.googleapis.com/v1/projects/test-project/locations/us-central1/publishers/google/models/gemini-1.5-flash:generateContent"
        );
    }

    #[test]
    fn test_assistant_role_maps_to_model() {
        let provider = provider();
        let request = ChatRequest::new(
            "gemini-1.5-flash",
            vec![
                ChatMessage::user("Hi"),
                ChatMessage::assistant("Hello!"),
                ChatMessage::user("How are you?"),
            ],
        );
        let body = provider.build_gemini_request(&request);
        let roles: Vec<&str> = body.contents.iter().map(|c| c.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
    }

    #[test]
    fn test_system_goes_to_system_instruction() {
        let provider = provider();
        let request = ChatRequest::new(
            "gemini-1.5-flash",
            vec![ChatMessage::system("Be terse"), ChatMessage::user("Hi")],
        );
        let body = provider.build_gemini_request(&request);
        assert!(body.system_instruction.is_some());
        assert_eq!(body.contents.len(), 1);
    }

    #[test]
    fn test_safety_settings_always_attached() {
        let provider = provider();
        let request = ChatRequest::new("gemini-1.5-flash", vec![ChatMessage::user("Hi")]);
        let body = provider.build_gemini_request(&request);
        let safety = body.safety_settings.unwrap();
        assert_eq!(safety.len(), 4);
        assert!(safety.iter().all(|s| s.threshold == "BLOCK_ONLY_HIGH"));
    }

    #[test]
    fn test_tools_bring_tool_config() {
        let provider = provider();
        let mut request = ChatRequest::new("gemini-1.5-flash", vec![ChatMessage::user("Weather?")]);
        request.tools = vec![crate::types::ToolSpec {
            name: "get_weather".to_string(),
            description: "Weather lookup".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let body = provider.build_gemini_request(&request);
        assert_eq!(
            body.tool_config.unwrap().function_calling_config.mode,
            "AUTO"
        );
        let tools = body.tools.unwrap();
        assert_eq!(tools[0].function_declarations[0].name, "get_weather");
    }

    #[test]
    fn test_claude_detection() {
        assert!(VertexProvider::is_claude_model("claude-3-5-sonnet-v2@20241022"));
        assert!(!VertexProvider::is_claude_model("gemini-1.5-pro"));
    }

    #[tokio::test]
    async fn test_claude_streaming_rejected() {
        let provider = provider();
        let mut request =
            ChatRequest::new("claude-3-5-sonnet-v2@20241022", vec![ChatMessage::user("Hi")]);
        request.stream = true;
        let result = provider
            .generate_stream(&request, CancellationToken::new())
            .await;
        match result {
            Err(GatewayError::InvalidRequest(message)) => {
                assert!(message.contains("streaming is not offered"))
            }
            other => panic!("expected invalid-request, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_collect_candidate_text_and_calls() {
        let response = wire::GenerateContentResponse {
            candidates: vec![wire::Candidate {
                content: Some(wire::Content {
                    role: "model".to_string(),
                    parts: vec![
                        wire::Part::Text {
                            text: "Checking ".to_string(),
                        },
                        wire::Part::FunctionCall {
                            function_call: wire::FunctionCall {
                                name: "get_weather".to_string(),
                                args: serde_json::json!({"city": "Paris"}),
                            },
                        },
                    ],
                }),
                finish_reason: Some("STOP".to_string()),
            }],
            usage_metadata: None,
            model_version: None,
        };
        let (text, calls, finish) = collect_candidate(&response);
        assert_eq!(text, "Checking ");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(finish, "STOP");
    }

    #[tokio::test]
    async fn test_explicit_access_token_short_circuits() {
        let manager = TokenManager::new(Client::new(), Some("tok".to_string()), None);
        assert_eq!(manager.access_token().await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn test_missing_credentials_is_auth_failed() {
        let manager = TokenManager::new(Client::new(), None, None);
        assert!(matches!(
            manager.access_token().await,
            Err(GatewayError::AuthFailed(_))
        ));
    }
}
