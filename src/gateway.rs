use std::sync::{Arc, LazyLock, Mutex};
use std::time::Instant;

use tiktoken_rs::{cl100k_base, CoreBPE};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::analytics::{RequestMetrics, UsageAnalytics};
use crate::cache::{self, CacheMetrics, CacheStats};
use crate::error::Result;
use crate::pricing::pricing_for;
use crate::provider::ProviderType;
use crate::reasoning;
use crate::registry::ProviderRegistry;
use crate::streaming::delta_channel;
use crate::tracker::{Budget, BudgetDecision, TokenTracker};
use crate::types::{ChatRequest, ChatResponse, ReasoningConfig, StreamItem};

static BPE: LazyLock<Option<CoreBPE>> = LazyLock::new(|| cl100k_base().ok());

/// Outcome of a unary pipeline run: a response, or a structured budget
/// denial (a policy decision, not an error).
#[derive(Debug)]
pub enum ChatOutcome {
    Completed(ChatResponse),
    Denied(BudgetDecision),
}

/// Outcome of a streaming pipeline run
pub enum StreamOutcome {
    Streaming(mpsc::Receiver<StreamItem>),
    Denied(BudgetDecision),
}

/// The request pipeline: cache annotation, reasoning configuration,
/// budget gating, adapter dispatch, then accounting.
pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    tracker: Arc<TokenTracker>,
    analytics: Arc<UsageAnalytics>,
    cache_metrics: Arc<Mutex<CacheMetrics>>,
}

impl Gateway {
    pub fn new(registry: Arc<ProviderRegistry>, budget: Budget, analytics: Arc<UsageAnalytics>) -> Self {
        Self {
            registry,
            tracker: Arc::new(TokenTracker::new(budget)),
            analytics,
            cache_metrics: Arc::new(Mutex::new(CacheMetrics::default())),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &TokenTracker {
        &self.tracker
    }

    pub fn analytics(&self) -> &Arc<UsageAnalytics> {
        &self.analytics
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        *self.cache_metrics.lock().expect("cache metrics mutex poisoned")
    }

    /// Unary chat completion
    pub async fn chat(
        &self,
        provider_type: ProviderType,
        session_id: &str,
        mut request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome> {
        request.stream = false;
        self.prepare(&mut request);

        let (estimated_tokens, estimated_cost) = estimate(&request);
        let decision = self
            .tracker
            .check_budget(session_id, estimated_tokens, estimated_cost);
        if !decision.allowed {
            debug!(session = %session_id, reason = %decision.reason, "request denied by budget gate");
            return Ok(ChatOutcome::Denied(decision));
        }
        if decision.warning {
            warn!(session = %session_id, reason = %decision.reason, "budget warning");
        }

        let provider = self.registry.get(provider_type).await?;
        let started = Instant::now();

        match provider.generate(&request, cancel).await {
            Ok(mut response) => {
                let thinking_tokens = reconcile_thinking(&request, &mut response);
                settle(
                    &self.tracker,
                    &self.analytics,
                    &self.cache_metrics,
                    session_id,
                    &request.model,
                    &response,
                    thinking_tokens,
                );
                Ok(ChatOutcome::Completed(response))
            }
            Err(e) => {
                self.analytics.record_request(
                    &request.model,
                    &RequestMetrics {
                        latency_ms: started.elapsed().as_millis() as u64,
                        success: false,
                        ..RequestMetrics::default()
                    },
                );
                Err(e)
            }
        }
    }

    /// Streaming chat completion. The returned channel delivers deltas
    /// in wire order and exactly one terminal item; accounting happens
    /// as the terminal event passes through.
    pub async fn chat_stream(
        &self,
        provider_type: ProviderType,
        session_id: &str,
        mut request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome> {
        request.stream = true;
        self.prepare(&mut request);

        let (estimated_tokens, estimated_cost) = estimate(&request);
        let decision = self
            .tracker
            .check_budget(session_id, estimated_tokens, estimated_cost);
        if !decision.allowed {
            return Ok(StreamOutcome::Denied(decision));
        }

        let provider = self.registry.get(provider_type).await?;
        let mut upstream = provider.generate_stream(&request, cancel).await?;

        let (tx, rx) = delta_channel();
        let tracker = self.tracker.clone();
        let analytics = self.analytics.clone();
        let cache_metrics = self.cache_metrics.clone();
        let session = session_id.to_string();
        let model = request.model.clone();

        tokio::spawn(async move {
            while let Some(item) = upstream.recv().await {
                match &item {
                    StreamItem::Done(response) => {
                        settle(&tracker, &analytics, &cache_metrics, &session, &model, response, 0);
                    }
                    StreamItem::Error { .. } => {
                        analytics.record_request(
                            &model,
                            &RequestMetrics {
                                success: false,
                                ..RequestMetrics::default()
                            },
                        );
                    }
                    StreamItem::Delta(_) => {}
                }
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });

        Ok(StreamOutcome::Streaming(rx))
    }

    /// Cache annotation then reasoning configuration, in pipeline order
    fn prepare(&self, request: &mut ChatRequest) {
        if request.cache.is_some() {
            request.messages =
                cache::annotate(&request.messages, &request.tools, request.cache.as_ref());
        }
        if request.reasoning.is_none() && reasoning::wants_reasoning(request) {
            request.reasoning = Some(ReasoningConfig::default());
        }
    }
}

/// (projected tokens, projected cost) for the budget gate
fn estimate(request: &ChatRequest) -> (u64, f64) {
    let prompt: String = request
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let prompt_tokens = match BPE.as_ref() {
        Some(bpe) => bpe.encode_ordinary(&prompt).len() as u64,
        None => (prompt.len() / 4) as u64,
    };
    let output_tokens = request.max_tokens as u64;
    let cost = pricing_for(&request.model).cost(prompt_tokens, output_tokens);
    (prompt_tokens + output_tokens, cost)
}

/// Strip an inline thinking trace and estimate its token share
fn reconcile_thinking(request: &ChatRequest, response: &mut ChatResponse) -> u64 {
    if request.reasoning.as_ref().map(|r| r.enabled) != Some(true) {
        return 0;
    }
    let (visible, thinking) =
        reasoning::extract_thinking(&response.content, reasoning::DEFAULT_THINKING_TAG);
    if thinking.is_empty() {
        return 0;
    }
    let thinking_tokens = (thinking.len() / 4) as u64;
    response.content = visible;
    response
        .metadata
        .insert("thinking_tokens".to_string(), thinking_tokens.into());
    thinking_tokens
}

/// Post-completion accounting: tracker, analytics, cache metrics
fn settle(
    tracker: &TokenTracker,
    analytics: &UsageAnalytics,
    cache_metrics: &Mutex<CacheMetrics>,
    session_id: &str,
    model: &str,
    response: &ChatResponse,
    thinking_tokens: u64,
) {
    let pricing = pricing_for(model);
    let usage = &response.usage;
    let cost = pricing.cost(usage.prompt_tokens, usage.completion_tokens + thinking_tokens);
    tracker.track_request(session_id, usage, thinking_tokens, cost, model);

    let tokens_per_second = if response.latency_ms > 0 {
        usage.completion_tokens as f64 * 1000.0 / response.latency_ms as f64
    } else {
        0.0
    };
    analytics.record_request(
        model,
        &RequestMetrics {
            latency_ms: response.latency_ms,
            success: true,
            tokens_per_second,
            memory_mb: 0.0,
            rating: None,
        },
    );

    let creation = metadata_count(response, "cache_creation_tokens");
    let read = metadata_count(response, "cache_read_tokens");
    let savings = cache::cost_savings(
        &CacheStats {
            total_input_tokens: usage.prompt_tokens + creation + read,
            cache_creation_tokens: creation,
            cache_read_tokens: read,
            output_tokens: usage.completion_tokens,
        },
        pricing.input_per_million / 1000.0,
        pricing.cached_input_per_million / 1000.0,
    );
    cache_metrics
        .lock()
        .expect("cache metrics mutex poisoned")
        .record(creation, read, savings.savings_percent);
}

fn metadata_count(response: &ChatResponse, key: &str) -> u64 {
    response
        .metadata
        .get(key)
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::provider::{
        Capability, HealthStatus, ModelInfo, Provider, ProviderHealth, ProviderType,
    };
    use crate::types::{ChatMessage, ResponseDelta, Usage};
    use async_trait::async_trait;
    use chrono::Utc;
    use tempfile::TempDir;

    struct ScriptedProvider {
        usage: Usage,
        fail: bool,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn provider_type(&self) -> ProviderType {
            ProviderType::Anthropic
        }

        fn display_name(&self) -> &str {
            "Scripted"
        }

        fn models(&self) -> Vec<ModelInfo> {
            Vec::new()
        }

        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::Chat, Capability::Streaming]
        }

        async fn generate(
            &self,
            request: &ChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<ChatResponse> {
            if self.fail {
                return Err(GatewayError::ServiceUnavailable("scripted failure".into()));
            }
            Ok(ChatResponse {
                id: "resp-1".to_string(),
                request_id: request.id.clone(),
                content: "Hello there".to_string(),
                tool_calls: Vec::new(),
                usage: self.usage,
                finish_reason: "end_turn".to_string(),
                latency_ms: 20,
                created: Utc::now(),
                metadata: Default::default(),
            })
        }

        async fn generate_stream(
            &self,
            request: &ChatRequest,
            cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<StreamItem>> {
            let (tx, rx) = delta_channel();
            let request_id = request.id.clone();
            let usage = self.usage;
            tokio::spawn(async move {
                for fragment in ["Hel", "lo"] {
                    if tx
                        .send(StreamItem::Delta(ResponseDelta {
                            request_id: request_id.clone(),
                            content: fragment.to_string(),
                        }))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                let _ = tx
                    .send(StreamItem::Done(Box::new(ChatResponse {
                        id: "resp-s".to_string(),
                        request_id,
                        content: "Hello".to_string(),
                        tool_calls: Vec::new(),
                        usage,
                        finish_reason: "stop".to_string(),
                        latency_ms: 10,
                        created: Utc::now(),
                        metadata: Default::default(),
                    })))
                    .await;
                drop(cancel);
            });
            Ok(rx)
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn health_check(&self) -> Result<ProviderHealth> {
            Ok(ProviderHealth {
                status: HealthStatus::Healthy,
                latency_ms: 1,
                checked_at: Utc::now(),
                error_count: 0,
                model_count: 0,
            })
        }

        async fn shutdown(&self) {}
    }

    async fn gateway_with(provider: ScriptedProvider, budget: Budget) -> (Gateway, TempDir) {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::new(provider)).await.unwrap();
        let analytics = Arc::new(UsageAnalytics::new(dir.path()));
        (Gateway::new(registry, budget, analytics), dir)
    }

    #[tokio::test]
    async fn test_chat_settles_tracker_and_analytics() {
        let (gateway, _dir) = gateway_with(
            ScriptedProvider {
                usage: Usage::new(10, 20),
                fail: false,
            },
            Budget::default(),
        )
        .await;

        let request = ChatRequest::new("claude-3-5-sonnet-latest", vec![ChatMessage::user("Hello")]);
        let outcome = gateway
            .chat(ProviderType::Anthropic, "s1", request, &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            ChatOutcome::Completed(response) => assert_eq!(response.usage.total_tokens, 30),
            ChatOutcome::Denied(decision) => panic!("unexpected denial: {}", decision.reason),
        }

        let session = gateway.tracker().session_usage("s1").unwrap();
        assert_eq!(session.total_tokens, 30);
        let stats = gateway.analytics().stats_for("claude-3-5-sonnet-latest").unwrap();
        assert_eq!(stats.total_requests, 1);
        assert!((stats.success_rate - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_chat_denied_by_per_request_gate() {
        let budget = Budget {
            max_tokens_per_request: 1,
            ..Budget::default()
        };
        let (gateway, _dir) = gateway_with(
            ScriptedProvider {
                usage: Usage::new(1, 1),
                fail: false,
            },
            budget,
        )
        .await;

        let mut request =
            ChatRequest::new("claude-3-5-sonnet-latest", vec![ChatMessage::user("Hello world")]);
        request.max_tokens = 100;
        let outcome = gateway
            .chat(ProviderType::Anthropic, "s1", request, &CancellationToken::new())
            .await
            .unwrap();

        match outcome {
            ChatOutcome::Denied(decision) => {
                assert_eq!(decision.reason, "per-request-exceeded");
                assert!(!decision.allowed);
            }
            ChatOutcome::Completed(_) => panic!("expected denial"),
        }
        // Nothing tracked for a denied request
        assert!(gateway.tracker().session_usage("s1").is_none() || {
            gateway.tracker().session_usage("s1").unwrap().total_tokens == 0
        });
    }

    #[tokio::test]
    async fn test_chat_failure_recorded_in_analytics() {
        let (gateway, _dir) = gateway_with(
            ScriptedProvider {
                usage: Usage::default(),
                fail: true,
            },
            Budget::default(),
        )
        .await;

        let request = ChatRequest::new("claude-3-5-sonnet-latest", vec![ChatMessage::user("Hi")]);
        let result = gateway
            .chat(ProviderType::Anthropic, "s1", request, &CancellationToken::new())
            .await;
        assert!(result.is_err());

        let stats = gateway.analytics().stats_for("claude-3-5-sonnet-latest").unwrap();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.successful_requests, 0);
    }

    #[tokio::test]
    async fn test_chat_stream_relays_and_settles() {
        let (gateway, _dir) = gateway_with(
            ScriptedProvider {
                usage: Usage::new(5, 10),
                fail: false,
            },
            Budget::default(),
        )
        .await;

        let request = ChatRequest::new("claude-3-5-sonnet-latest", vec![ChatMessage::user("Hi")]);
        let outcome = gateway
            .chat_stream(ProviderType::Anthropic, "s1", request, CancellationToken::new())
            .await
            .unwrap();

        let mut rx = match outcome {
            StreamOutcome::Streaming(rx) => rx,
            StreamOutcome::Denied(decision) => panic!("unexpected denial: {}", decision.reason),
        };

        let mut text = String::new();
        let mut terminal = None;
        while let Some(item) = rx.recv().await {
            match item {
                StreamItem::Delta(delta) => text.push_str(&delta.content),
                StreamItem::Done(response) => terminal = Some(response),
                StreamItem::Error { error, .. } => panic!("unexpected error: {}", error),
            }
        }
        assert_eq!(text, "Hello");
        assert_eq!(terminal.unwrap().usage.total_tokens, 15);

        // Terminal event settled the tracker
        let session = gateway.tracker().session_usage("s1").unwrap();
        assert_eq!(session.total_tokens, 15);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_not_found() {
        let (gateway, _dir) = gateway_with(
            ScriptedProvider {
                usage: Usage::default(),
                fail: false,
            },
            Budget::default(),
        )
        .await;

        let request = ChatRequest::new("gpt-4o", vec![ChatMessage::user("Hi")]);
        let result = gateway
            .chat(ProviderType::OpenAi, "s1", request, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(GatewayError::ProviderNotFound(_))));
    }

    #[tokio::test]
    async fn test_reconcile_thinking_strips_trace() {
        let request = {
            let mut r = ChatRequest::new("deepseek-r1", vec![ChatMessage::user("why?")]);
            r.reasoning = Some(ReasoningConfig::default());
            r
        };
        let mut response = ChatResponse {
            id: "r".to_string(),
            request_id: request.id.clone(),
            content: "<thinking>chain of thought</thinking>The answer.".to_string(),
            tool_calls: Vec::new(),
            usage: Usage::new(1, 1),
            finish_reason: "stop".to_string(),
            latency_ms: 1,
            created: Utc::now(),
            metadata: Default::default(),
        };
        let thinking_tokens = reconcile_thinking(&request, &mut response);
        assert!(thinking_tokens > 0);
        assert_eq!(response.content, "The answer.");
        assert!(response.metadata.contains_key("thinking_tokens"));
    }

    #[test]
    fn test_estimate_counts_prompt_and_projected_output() {
        let mut request = ChatRequest::new(
            "claude-3-5-sonnet-latest",
            vec![ChatMessage::user("Hello world, this is a prompt")],
        );
        request.max_tokens = 100;
        let (tokens, cost) = estimate(&request);
        assert!(tokens > 100);
        assert!(cost > 0.0);
    }
}
