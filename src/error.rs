use thiserror::Error;

/// Gateway error taxonomy.
///
/// The vendor-facing kinds form a closed set; every transport or API
/// failure an adapter observes is classified into one of them with the
/// underlying cause preserved in the message. The registry-local variants
/// (`ProviderNotFound`, `ProviderAlreadyRegistered`) never cross a wire.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Upstream rate limit (HTTP 429, ThrottlingException, …)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Malformed or rejected request (HTTP 400)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown model or endpoint (HTTP 404)
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Credential rejected (HTTP 401)
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Credential valid but lacks access (HTTP 403)
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Account or project quota exhausted
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Connection-level failure, or an unparseable 5xx body
    #[error("transport failed: {0}")]
    Transport(String),

    /// Request deadline elapsed
    #[error("timeout: {0}")]
    Timeout(String),

    /// The caller cancelled the request
    #[error("request cancelled")]
    Cancelled,

    /// Upstream reported a server-side failure (parseable 5xx)
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Gateway-internal failure
    #[error("internal error: {0}")]
    Internal(String),

    /// No adapter registered for the requested provider type
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// Registration attempted for an already-present provider type
    #[error("provider already registered: {0}")]
    ProviderAlreadyRegistered(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Short kind tag used in logs and response metadata
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ModelNotFound(_) => "model_not_found",
            Self::AuthFailed(_) => "auth_failed",
            Self::PermissionDenied(_) => "permission_denied",
            Self::QuotaExhausted(_) => "quota_exhausted",
            Self::Transport(_) => "transport_failed",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal",
            Self::ProviderNotFound(_) => "provider_not_found",
            Self::ProviderAlreadyRegistered(_) => "provider_already_registered",
        }
    }

    /// Whether a caller may reasonably retry the request.
    ///
    /// The gateway itself never retries; this is advisory for callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Transport(_) | Self::Timeout(_) | Self::ServiceUnavailable(_)
        )
    }
}

/// Classify an upstream HTTP failure status.
///
/// 5xx bodies that parse as JSON are reported as `ServiceUnavailable`
/// (the vendor produced a diagnostic); unparseable 5xx bodies are treated
/// as transport-level corruption.
pub fn classify_http(status: u16, body: &str) -> GatewayError {
    let message = extract_error_message(body);
    match status {
        400 => GatewayError::InvalidRequest(message),
        401 => GatewayError::AuthFailed(message),
        403 => GatewayError::PermissionDenied(message),
        404 => GatewayError::ModelNotFound(message),
        408 => GatewayError::Timeout(message),
        429 => {
            if message.to_lowercase().contains("quota") {
                GatewayError::QuotaExhausted(message)
            } else {
                GatewayError::RateLimited(message)
            }
        }
        500..=599 => {
            if serde_json::from_str::<serde_json::Value>(body).is_ok() {
                GatewayError::ServiceUnavailable(format!("HTTP {}: {}", status, message))
            } else {
                GatewayError::Transport(format!("HTTP {}: {}", status, message))
            }
        }
        _ => GatewayError::Internal(format!("unexpected HTTP {}: {}", status, message)),
    }
}

/// Classify a Bedrock exception by its `__type` / `x-amzn-errortype` name.
pub fn classify_bedrock(exception_type: &str, message: &str) -> GatewayError {
    let name = exception_type
        .rsplit('#')
        .next()
        .unwrap_or(exception_type)
        .split(':')
        .next()
        .unwrap_or(exception_type);
    let message = message.to_string();
    match name {
        "ThrottlingException" => GatewayError::RateLimited(message),
        "ValidationException" => GatewayError::InvalidRequest(message),
        "ResourceNotFoundException" => GatewayError::ModelNotFound(message),
        "AccessDeniedException" => GatewayError::PermissionDenied(message),
        "UnrecognizedClientException" | "InvalidSignatureException" => {
            GatewayError::AuthFailed(message)
        }
        "ServiceQuotaExceededException" => GatewayError::QuotaExhausted(message),
        "ModelTimeoutException" => GatewayError::Timeout(message),
        "ServiceUnavailableException" | "ModelNotReadyException" => {
            GatewayError::ServiceUnavailable(message)
        }
        "ModelErrorException" | "InternalServerException" => {
            GatewayError::ServiceUnavailable(message)
        }
        _ => GatewayError::Internal(format!("{}: {}", name, message)),
    }
}

/// Pull a human-readable message out of the common vendor error envelopes.
///
/// Handles `{"error":{"message":…}}` (OpenAI family, Vertex),
/// `{"error":{"type":…,"message":…}}` (Anthropic) and `{"message":…}`
/// (Bedrock). Falls back to the raw body.
fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no error body".to_string()
    } else {
        trimmed.chars().take(500).collect()
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
            Self::Transport(err.to_string())
        } else if let Some(status) = err.status() {
            classify_http(status.as_u16(), &err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_http_status_table() {
        assert!(matches!(classify_http(400, "{}"), GatewayError::InvalidRequest(_)));
        assert!(matches!(classify_http(401, "{}"), GatewayError::AuthFailed(_)));
        assert!(matches!(classify_http(403, "{}"), GatewayError::PermissionDenied(_)));
        assert!(matches!(classify_http(404, "{}"), GatewayError::ModelNotFound(_)));
        assert!(matches!(classify_http(429, "{}"), GatewayError::RateLimited(_)));
    }

    #[test]
    fn test_classify_http_5xx_depends_on_body() {
        // Parseable JSON body → the vendor produced a diagnostic
        let err = classify_http(503, r#"{"error":{"message":"overloaded"}}"#);
        assert!(matches!(err, GatewayError::ServiceUnavailable(_)));

        // HTML error page → transport-level corruption
        let err = classify_http(502, "<html>Bad Gateway</html>");
        assert!(matches!(err, GatewayError::Transport(_)));
    }

    #[test]
    fn test_classify_http_quota_vs_rate_limit() {
        let err = classify_http(429, r#"{"error":{"message":"Quota exceeded for project"}}"#);
        assert!(matches!(err, GatewayError::QuotaExhausted(_)));

        let err = classify_http(429, r#"{"error":{"message":"Too many requests"}}"#);
        assert!(matches!(err, GatewayError::RateLimited(_)));
    }

    #[test]
    fn test_classify_bedrock_exceptions() {
        assert!(matches!(
            classify_bedrock("ThrottlingException", "slow down"),
            GatewayError::RateLimited(_)
        ));
        assert!(matches!(
            classify_bedrock("ValidationException", "bad body"),
            GatewayError::InvalidRequest(_)
        ));
        // Fully-qualified type names resolve to the bare exception name
        assert!(matches!(
            classify_bedrock("com.amazon.coral.service#ThrottlingException", "x"),
            GatewayError::RateLimited(_)
        ));
    }

    #[test]
    fn test_retryable_partition() {
        assert!(GatewayError::RateLimited("x".into()).is_retryable());
        assert!(GatewayError::Transport("x".into()).is_retryable());
        assert!(GatewayError::Timeout("x".into()).is_retryable());
        assert!(GatewayError::ServiceUnavailable("x".into()).is_retryable());

        assert!(!GatewayError::InvalidRequest("x".into()).is_retryable());
        assert!(!GatewayError::AuthFailed("x".into()).is_retryable());
        assert!(!GatewayError::PermissionDenied("x".into()).is_retryable());
        assert!(!GatewayError::ModelNotFound("x".into()).is_retryable());
        assert!(!GatewayError::Cancelled.is_retryable());
    }

    #[test]
    fn test_extract_error_message_envelopes() {
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"boom"}}"#),
            "boom"
        );
        assert_eq!(extract_error_message(r#"{"message":"flat"}"#), "flat");
        assert_eq!(extract_error_message(""), "no error body");
    }

    #[test]
    fn test_error_kind_names() {
        assert_eq!(GatewayError::Cancelled.kind(), "cancelled");
        assert_eq!(GatewayError::Transport("x".into()).kind(), "transport_failed");
    }
}
