//! Provider-agnostic adapter contract and failure classification

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::types::EnhancementRequest;

/// How a provider failure should influence the fallback loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network failure, timeout, server error. Another provider may succeed.
    Transient,
    /// The vendor refused the content itself. Other providers won't help.
    Rejected,
    /// Vendor-side rate limit. Falls back like `Transient`.
    Quota,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Rejected => write!(f, "rejected"),
            Self::Quota => write!(f, "quota"),
        }
    }
}

/// A classified adapter failure
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind} error: {message}")]
pub struct ProviderError {
    pub kind: FailureKind,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Rejected,
            message: message.into(),
        }
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Quota,
            message: message.into(),
        }
    }

    /// Whether the dispatcher may move on to the next candidate
    pub fn allows_fallback(&self) -> bool {
        !matches!(self.kind, FailureKind::Rejected)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return classify_status(status.as_u16(), &err.to_string());
        }
        Self::transient(err.to_string())
    }
}

/// Raw result of one vendor call, before the dispatcher normalizes it
#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    pub model: String,
    pub tokens_used: u64,
    /// Cost reported by the vendor, when it reports one
    pub cost_usd: Option<f64>,
}

/// Trait that all text-generation providers implement
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Configured provider identifier (e.g. "openai", "anthropic")
    fn id(&self) -> &str;

    /// Models this provider can serve; the first one is its default
    fn supported_models(&self) -> &[String];

    /// Generate text for the request, giving up after `timeout`
    async fn generate(
        &self,
        request: &EnhancementRequest,
        timeout: Duration,
    ) -> Result<Generation, ProviderError>;

    /// Cheap liveness probe
    async fn health_check(&self) -> bool;

    /// Estimated cost in USD for the given token count
    fn estimate_cost(&self, tokens: u64) -> f64;

    /// Pick the model to use for a request, honouring an explicit choice if supported
    fn resolve_model(&self, requested: Option<&str>) -> String {
        let models = self.supported_models();
        match requested {
            Some(m) if models.iter().any(|s| s == m) => m.to_string(),
            _ => models.first().cloned().unwrap_or_default(),
        }
    }
}

/// Body fragments that mean the vendor refused the content itself.
/// Generic `invalid_request_error` bodies are not listed: vendors also use
/// them for account and model-limit problems that another provider can serve.
const REJECTION_PATTERNS: &[&str] = &[
    "content policy",
    "content_policy",
    "content_filter",
    "content management policy",
    "safety system",
];

/// Classify a non-success HTTP status (plus body) into a failure kind
pub fn classify_status(status: u16, body: &str) -> ProviderError {
    let message = format!("status {}: {}", status, body);
    match status {
        429 => ProviderError::quota(message),
        400 | 422 => {
            let lower = body.to_lowercase();
            if REJECTION_PATTERNS.iter().any(|p| lower.contains(p)) {
                ProviderError::rejected(message)
            } else {
                ProviderError::transient(message)
            }
        }
        _ => ProviderError::transient(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_as_quota() {
        let err = classify_status(429, "rate limit exceeded");
        assert_eq!(err.kind, FailureKind::Quota);
        assert!(err.allows_fallback());
    }

    #[test]
    fn test_classify_server_errors_as_transient() {
        for status in [500, 502, 503, 504, 401, 404] {
            assert_eq!(classify_status(status, "boom").kind, FailureKind::Transient);
        }
    }

    #[test]
    fn test_classify_content_policy_as_rejected() {
        let err = classify_status(400, r#"{"error":{"code":"content_policy_violation"}}"#);
        assert_eq!(err.kind, FailureKind::Rejected);
        assert!(!err.allows_fallback());
        let err = classify_status(
            400,
            "Your request was rejected as a result of our safety system.",
        );
        assert_eq!(err.kind, FailureKind::Rejected);
    }

    #[test]
    fn test_classify_account_and_limit_errors_as_transient() {
        let credit = r#"{"type":"error","error":{"type":"invalid_request_error","message":"Your credit balance is too low to access the Anthropic API."}}"#;
        let err = classify_status(400, credit);
        assert_eq!(err.kind, FailureKind::Transient);
        assert!(err.allows_fallback());

        let max_tokens = r#"{"error":{"type":"invalid_request_error","message":"max_tokens: 64000 > 8192, which is the maximum allowed number of output tokens for this model"}}"#;
        assert_eq!(classify_status(400, max_tokens).kind, FailureKind::Transient);

        let too_long = r#"{"error":{"type":"invalid_request_error","message":"prompt is too long: 210000 tokens > 200000 maximum"}}"#;
        assert_eq!(classify_status(400, too_long).kind, FailureKind::Transient);
    }

    #[test]
    fn test_classify_plain_bad_request_as_transient() {
        assert_eq!(classify_status(400, "bad gateway header").kind, FailureKind::Transient);
    }

    #[test]
    fn test_provider_error_display() {
        assert_eq!(
            ProviderError::quota("slow down").to_string(),
            "quota error: slow down"
        );
    }
}
