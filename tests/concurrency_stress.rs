//! Concurrency scenarios: many in-flight requests sharing one adapter,
//! budget accounting under contention, and parallel health sweeps.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use llm_gateway_core::analytics::UsageAnalytics;
use llm_gateway_core::config::AnthropicSettings;
use llm_gateway_core::gateway::{ChatOutcome, Gateway};
use llm_gateway_core::providers::AnthropicProvider;
use llm_gateway_core::{
    Budget, ChatMessage, ChatRequest, HealthStatus, Provider, ProviderRegistry, ProviderType,
};

async fn setup_messages_mock(latency_ms: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(latency_ms))
                .set_body_json(serde_json::json!({
                    "id": "msg_stress",
                    "type": "message",
                    "role": "assistant",
                    "content": [{"type": "text", "text": "ok"}],
                    "model": "claude-3-5-sonnet-latest",
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 3, "output_tokens": 7}
                })),
        )
        .mount(&server)
        .await;
    server
}

fn provider_for(server: &MockServer) -> AnthropicProvider {
    AnthropicProvider::new(&AnthropicSettings {
        api_key: Some("sk-ant-test".to_string()),
        base_url: Some(format!("{}/v1", server.uri())),
        ..AnthropicSettings::default()
    })
}

#[tokio::test]
async fn test_concurrent_requests_share_one_adapter() {
    let server = setup_messages_mock(5).await;

    let dir = tempfile::TempDir::new().unwrap();
    let registry = Arc::new(ProviderRegistry::new());
    registry
        .register(Arc::new(provider_for(&server)))
        .await
        .unwrap();
    let gateway = Arc::new(Gateway::new(
        registry,
        Budget {
            max_requests_per_minute: 1_000,
            ..Budget::default()
        },
        Arc::new(UsageAnalytics::new(dir.path())),
    ));

    let mut tasks = JoinSet::new();
    for i in 0..32 {
        let gateway = gateway.clone();
        tasks.spawn(async move {
            let request =
                ChatRequest::new("claude-3-5-sonnet-latest", vec![ChatMessage::user("Hello")]);
            gateway
                .chat(
                    ProviderType::Anthropic,
                    &format!("session-{}", i % 4),
                    request,
                    &CancellationToken::new(),
                )
                .await
        });
    }

    let mut completed = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap().unwrap() {
            ChatOutcome::Completed(response) => {
                assert_eq!(response.usage.total_tokens, 10);
                completed += 1;
            }
            ChatOutcome::Denied(decision) => panic!("unexpected denial: {}", decision.reason),
        }
    }
    assert_eq!(completed, 32);

    // 32 requests spread over 4 sessions, 8 each
    for session in 0..4 {
        let usage = gateway
            .tracker()
            .session_usage(&format!("session-{}", session))
            .unwrap();
        assert_eq!(usage.total_tokens, 80);
    }

    let stats = gateway
        .analytics()
        .stats_for("claude-3-5-sonnet-latest")
        .unwrap();
    assert_eq!(stats.total_requests, 32);
}

#[tokio::test]
async fn test_rate_gate_under_concurrency_admits_exactly_n() {
    let server = setup_messages_mock(0).await;

    let dir = tempfile::TempDir::new().unwrap();
    let registry = Arc::new(ProviderRegistry::new());
    registry
        .register(Arc::new(provider_for(&server)))
        .await
        .unwrap();
    let gateway = Arc::new(Gateway::new(
        registry,
        Budget {
            max_requests_per_minute: 10,
            ..Budget::default()
        },
        Arc::new(UsageAnalytics::new(dir.path())),
    ));

    let mut tasks = JoinSet::new();
    for _ in 0..25 {
        let gateway = gateway.clone();
        tasks.spawn(async move {
            let request =
                ChatRequest::new("claude-3-5-sonnet-latest", vec![ChatMessage::user("Hi")]);
            gateway
                .chat(
                    ProviderType::Anthropic,
                    "shared-session",
                    request,
                    &CancellationToken::new(),
                )
                .await
        });
    }

    let mut admitted = 0;
    let mut denied = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap().unwrap() {
            ChatOutcome::Completed(_) => admitted += 1,
            ChatOutcome::Denied(decision) => {
                assert_eq!(decision.reason, "rate-limit-exceeded");
                denied += 1;
            }
        }
    }
    // The window admits exactly the configured quota
    assert_eq!(admitted, 10);
    assert_eq!(denied, 15);
}

#[tokio::test]
async fn test_parallel_health_sweep_with_slow_endpoint() {
    // Endpoint slower than the sweep timeout
    let slow = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(10))
                .set_body_json(serde_json::json!({
                    "id": "msg",
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": "m",
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 1, "output_tokens": 1}
                })),
        )
        .mount(&slow)
        .await;

    let registry = ProviderRegistry::with_health_timeout(Duration::from_millis(200));
    registry
        .register(Arc::new(provider_for(&slow)))
        .await
        .unwrap();

    let report = registry.health_check_all().await;
    assert_eq!(report[&ProviderType::Anthropic].status, HealthStatus::Unhealthy);
    // The adapter survives the failed probe
    assert!(registry.has_provider(ProviderType::Anthropic).await);
    let provider = registry.get(ProviderType::Anthropic).await.unwrap();
    assert_eq!(provider.provider_type(), ProviderType::Anthropic);
}
