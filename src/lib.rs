//! Multi-provider LLM gateway core.
//!
//! One canonical request/response vocabulary, per-vendor adapters
//! (OpenAI-compatible, Anthropic, AWS Bedrock, Google Vertex AI), a
//! budget-gated request pipeline with prompt-caching and reasoning
//! policies, streaming delivery, and persistent usage analytics.

pub mod analytics;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod pricing;
pub mod provider;
pub mod providers;
pub mod reasoning;
pub mod registry;
pub mod streaming;
pub mod tracker;
pub mod types;

pub use error::{GatewayError, Result};
pub use gateway::{ChatOutcome, Gateway, StreamOutcome};
pub use provider::{Capability, HealthStatus, ModelInfo, Provider, ProviderHealth, ProviderType};
pub use registry::ProviderRegistry;
pub use tracker::{Budget, BudgetDecision, TokenTracker};
pub use types::{ChatMessage, ChatRequest, ChatResponse, Role, StreamItem, Usage};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
