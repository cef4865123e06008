//! Dispatch error taxonomy

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::providers::ProviderError;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Why a single candidate provider did not produce a response
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Skipped: the health window says the provider is failing
    Unhealthy,
    /// Skipped: the provider's token bucket was empty
    RateLimited,
    /// The call exceeded the per-call timeout
    TimedOut { after_ms: u64 },
    /// The adapter returned a classified failure
    Provider { error: ProviderError },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unhealthy => write!(f, "skipped (unhealthy)"),
            Self::RateLimited => write!(f, "skipped (rate limited)"),
            Self::TimedOut { after_ms } => write!(f, "timed out after {}ms", after_ms),
            Self::Provider { error } => write!(f, "{}", error),
        }
    }
}

/// Last failure recorded for one candidate in the fallback chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateFailure {
    pub provider: String,
    #[serde(flatten)]
    pub reason: FailureReason,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.provider, self.reason)
    }
}

/// Terminal errors returned by [`crate::Dispatcher::enhance`]
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("quota exceeded for user {user_id}: {reason}")]
    QuotaExceeded {
        user_id: String,
        used_tokens: u64,
        used_cost_usd: f64,
        reason: String,
    },

    #[error("provider {provider} rejected the request: {message}")]
    Rejected { provider: String, message: String },

    #[error("all providers unavailable: {}", format_failures(.failures))]
    AllProvidersUnavailable { failures: Vec<CandidateFailure> },

    #[error("request cancelled by caller")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("usage store error: {0}")]
    Storage(String),
}

impl DispatchError {
    /// Stable error code for callers that map errors onto their own transport
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Rejected { .. } => "rejected",
            Self::AllProvidersUnavailable { .. } => "all_providers_unavailable",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "invalid_config",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Per-candidate failures, empty for every variant but `AllProvidersUnavailable`
    pub fn failures(&self) -> &[CandidateFailure] {
        match self {
            Self::AllProvidersUnavailable { failures } => failures,
            _ => &[],
        }
    }
}

fn format_failures(failures: &[CandidateFailure]) -> String {
    if failures.is_empty() {
        return "no eligible candidates".to_string();
    }
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DispatchError::InvalidRequest("x".into()).code(), "invalid_request");
        assert_eq!(DispatchError::Cancelled.code(), "cancelled");
        assert_eq!(
            DispatchError::AllProvidersUnavailable { failures: vec![] }.code(),
            "all_providers_unavailable"
        );
    }

    #[test]
    fn test_all_unavailable_message_lists_each_provider() {
        let err = DispatchError::AllProvidersUnavailable {
            failures: vec![
                CandidateFailure {
                    provider: "openai".to_string(),
                    reason: FailureReason::TimedOut { after_ms: 10_000 },
                },
                CandidateFailure {
                    provider: "anthropic".to_string(),
                    reason: FailureReason::Provider {
                        error: ProviderError::transient("status 503"),
                    },
                },
                CandidateFailure {
                    provider: "groq".to_string(),
                    reason: FailureReason::RateLimited,
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("openai: timed out after 10000ms"));
        assert!(msg.contains("anthropic: transient error: status 503"));
        assert!(msg.contains("groq: skipped (rate limited)"));
        assert_eq!(err.failures().len(), 3);
    }

    #[test]
    fn test_empty_failures_message() {
        let err = DispatchError::AllProvidersUnavailable { failures: vec![] };
        assert_eq!(err.to_string(), "all providers unavailable: no eligible candidates");
        assert!(DispatchError::Cancelled.failures().is_empty());
    }

    #[test]
    fn test_candidate_failure_serializes_flat() {
        let failure = CandidateFailure {
            provider: "openai".to_string(),
            reason: FailureReason::Unhealthy,
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["provider"], "openai");
        assert_eq!(json["reason"], "unhealthy");
    }
}
