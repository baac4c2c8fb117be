pub mod anthropic;
pub mod bedrock;
pub mod openai;
pub mod vertex;

pub use anthropic::AnthropicProvider;
pub use bedrock::BedrockProvider;
pub use openai::{OpenAiCompatibleProvider, OpenAiFlavor};
pub use vertex::VertexProvider;

use tokio_util::sync::CancellationToken;

use crate::error::{classify_http, GatewayError, Result};

/// Await an HTTP send while observing the request's cancellation token.
/// Dropping the in-flight future aborts the underlying request.
pub(crate) async fn send_cancellable(
    builder: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<reqwest::Response> {
    tokio::select! {
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        result = builder.send() => result.map_err(GatewayError::from),
    }
}

/// Drain a failed response body and classify the status into the error
/// taxonomy.
pub(crate) async fn classify_response(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    classify_http(status, &body)
}

/// Resolve the effective temperature: zero means unset, except that
/// extended-thinking modes require 1.0.
pub(crate) fn effective_temperature(temperature: f32, reasoning_enabled: bool) -> Option<f32> {
    if temperature == 0.0 {
        if reasoning_enabled {
            Some(1.0)
        } else {
            None
        }
    } else {
        Some(temperature)
    }
}

pub(crate) fn effective_top_p(top_p: f32) -> Option<f32> {
    if top_p == 0.0 {
        None
    } else {
        Some(top_p)
    }
}
