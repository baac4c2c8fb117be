use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::provider::{HealthStatus, Provider, ProviderHealth, ProviderType};

const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Central registry mapping provider types to adapter instances.
///
/// The map is read-heavy: lookups happen per request while registration
/// happens once at startup, so an RwLock guards it. Adapters live here
/// for the registry's lifetime and are handed out as shared references.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<ProviderType, Arc<dyn Provider>>>,
    health_timeout: Duration,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::with_health_timeout(DEFAULT_HEALTH_TIMEOUT)
    }

    pub fn with_health_timeout(health_timeout: Duration) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            health_timeout,
        }
    }

    /// Register an adapter. Fails when its type is already present.
    pub async fn register(&self, provider: Arc<dyn Provider>) -> Result<()> {
        let provider_type = provider.provider_type();
        let mut providers = self.providers.write().await;
        if providers.contains_key(&provider_type) {
            return Err(GatewayError::ProviderAlreadyRegistered(
                provider_type.to_string(),
            ));
        }
        info!(provider = %provider_type, name = provider.display_name(), "provider registered");
        providers.insert(provider_type, provider);
        Ok(())
    }

    /// Look up an adapter by type
    pub async fn get(&self, provider_type: ProviderType) -> Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        providers
            .get(&provider_type)
            .cloned()
            .ok_or_else(|| GatewayError::ProviderNotFound(provider_type.to_string()))
    }

    pub async fn has_provider(&self, provider_type: ProviderType) -> bool {
        self.providers.read().await.contains_key(&provider_type)
    }

    pub async fn provider_types(&self) -> Vec<ProviderType> {
        self.providers.read().await.keys().copied().collect()
    }

    /// All models across registered adapters
    pub async fn all_models(&self) -> Vec<crate::provider::ModelInfo> {
        let providers = self.providers.read().await;
        providers.values().flat_map(|p| p.models()).collect()
    }

    /// Probe every adapter concurrently, each under the bounded timeout.
    /// A failed or timed-out probe reports Unhealthy; the adapter stays
    /// registered.
    pub async fn health_check_all(&self) -> HashMap<ProviderType, ProviderHealth> {
        let snapshot: Vec<(ProviderType, Arc<dyn Provider>)> = {
            let providers = self.providers.read().await;
            providers.iter().map(|(t, p)| (*t, p.clone())).collect()
        };

        let timeout = self.health_timeout;
        let probes = snapshot.into_iter().map(|(provider_type, provider)| async move {
            let started = std::time::Instant::now();
            let result = tokio::time::timeout(timeout, provider.health_check()).await;
            let health = match result {
                Ok(Ok(health)) => health,
                Ok(Err(e)) => {
                    warn!(provider = %provider_type, error = %e, "health probe failed");
                    ProviderHealth {
                        status: HealthStatus::Unhealthy,
                        latency_ms: started.elapsed().as_millis() as u64,
                        checked_at: Utc::now(),
                        error_count: 0,
                        model_count: provider.models().len(),
                    }
                }
                Err(_) => {
                    warn!(provider = %provider_type, "health probe timed out");
                    ProviderHealth {
                        status: HealthStatus::Unhealthy,
                        latency_ms: timeout.as_millis() as u64,
                        checked_at: Utc::now(),
                        error_count: 0,
                        model_count: provider.models().len(),
                    }
                }
            };
            (provider_type, health)
        });

        futures::future::join_all(probes).await.into_iter().collect()
    }

    /// Tear down every adapter and empty the registry
    pub async fn shutdown_all(&self) {
        let mut providers = self.providers.write().await;
        for (provider_type, provider) in providers.drain() {
            provider.shutdown().await;
            info!(provider = %provider_type, "provider shut down");
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatRequest, ChatResponse, StreamItem};
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct MockProvider {
        provider_type: ProviderType,
        health_delay: Duration,
        healthy: bool,
    }

    impl MockProvider {
        fn new(provider_type: ProviderType) -> Self {
            Self {
                provider_type,
                health_delay: Duration::ZERO,
                healthy: true,
            }
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn provider_type(&self) -> ProviderType {
            self.provider_type
        }

        fn display_name(&self) -> &str {
            "Mock"
        }

        fn models(&self) -> Vec<crate::provider::ModelInfo> {
            Vec::new()
        }

        fn capabilities(&self) -> Vec<crate::provider::Capability> {
            vec![crate::provider::Capability::Chat]
        }

        async fn generate(
            &self,
            _request: &ChatRequest,
            _cancel: &CancellationToken,
        ) -> crate::error::Result<ChatResponse> {
            Err(GatewayError::Internal("not implemented".into()))
        }

        async fn generate_stream(
            &self,
            _request: &ChatRequest,
            _cancel: CancellationToken,
        ) -> crate::error::Result<mpsc::Receiver<StreamItem>> {
            Err(GatewayError::Internal("not implemented".into()))
        }

        async fn is_available(&self) -> bool {
            self.healthy
        }

        async fn health_check(&self) -> crate::error::Result<ProviderHealth> {
            tokio::time::sleep(self.health_delay).await;
            if self.healthy {
                Ok(ProviderHealth {
                    status: HealthStatus::Healthy,
                    latency_ms: 5,
                    checked_at: Utc::now(),
                    error_count: 0,
                    model_count: 0,
                })
            } else {
                Err(GatewayError::ServiceUnavailable("down".into()))
            }
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(MockProvider::new(ProviderType::Anthropic)))
            .await
            .unwrap();
        let provider = registry.get(ProviderType::Anthropic).await.unwrap();
        assert_eq!(provider.provider_type(), ProviderType::Anthropic);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(MockProvider::new(ProviderType::OpenAi)))
            .await
            .unwrap();
        let result = registry
            .register(Arc::new(MockProvider::new(ProviderType::OpenAi)))
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::ProviderAlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_missing_provider() {
        let registry = ProviderRegistry::new();
        let result = registry.get(ProviderType::Bedrock).await;
        assert!(matches!(result, Err(GatewayError::ProviderNotFound(_))));
    }

    #[tokio::test]
    async fn test_health_check_all_reports_per_provider() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(MockProvider::new(ProviderType::Anthropic)))
            .await
            .unwrap();
        registry
            .register(Arc::new(MockProvider {
                provider_type: ProviderType::OpenAi,
                health_delay: Duration::ZERO,
                healthy: false,
            }))
            .await
            .unwrap();

        let report = registry.health_check_all().await;
        assert_eq!(report.len(), 2);
        assert_eq!(report[&ProviderType::Anthropic].status, HealthStatus::Healthy);
        assert_eq!(report[&ProviderType::OpenAi].status, HealthStatus::Unhealthy);
        // The failed probe did not evict the adapter
        assert!(registry.has_provider(ProviderType::OpenAi).await);
    }

    #[tokio::test]
    async fn test_health_check_timeout_is_unhealthy() {
        let registry = ProviderRegistry::with_health_timeout(Duration::from_millis(50));
        registry
            .register(Arc::new(MockProvider {
                provider_type: ProviderType::Qwen,
                health_delay: Duration::from_secs(5),
                healthy: true,
            }))
            .await
            .unwrap();

        let report = registry.health_check_all().await;
        assert_eq!(report[&ProviderType::Qwen].status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_shutdown_all_empties_registry() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(MockProvider::new(ProviderType::Local)))
            .await
            .unwrap();
        registry.shutdown_all().await;
        assert!(registry.provider_types().await.is_empty());
        // Idempotent
        registry.shutdown_all().await;
    }
}
