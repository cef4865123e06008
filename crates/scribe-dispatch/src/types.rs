//! Request and response types for text enhancement

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const MAX_TEMPERATURE: f32 = 2.0;

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

/// A caller's request to enhance a piece of text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancementRequest {
    pub prompt: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Provider the caller wants tried first
    #[serde(default)]
    pub preferred_provider: Option<String>,
    /// Feature tag (e.g. "grammar_check"); selects a feature-specific fallback order
    #[serde(default)]
    pub feature: Option<String>,
    /// Explicit model; only honoured by providers that list it
    #[serde(default)]
    pub model: Option<String>,
}

impl EnhancementRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            preferred_provider: None,
            feature: None,
            model: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    pub fn with_preferred_provider(mut self, provider: impl Into<String>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Reject malformed input before any provider is contacted
    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            return Err(DispatchError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        if self.max_tokens == 0 {
            return Err(DispatchError::InvalidRequest(
                "max_tokens must be greater than 0".to_string(),
            ));
        }
        if !self.temperature.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(&self.temperature) {
            return Err(DispatchError::InvalidRequest(format!(
                "temperature must be within [0, {}], got {}",
                MAX_TEMPERATURE, self.temperature
            )));
        }
        if matches!(&self.preferred_provider, Some(p) if p.trim().is_empty()) {
            return Err(DispatchError::InvalidRequest(
                "preferred_provider must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// Normalized response, independent of which vendor produced it
#[derive(Debug, Clone, Serialize)]
pub struct EnhancementResponse {
    pub content: String,
    pub provider_used: String,
    pub model_used: String,
    pub tokens_used: u64,
    pub cost_estimate: f64,
    #[serde(with = "duration_ms")]
    pub processing_time: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f32>,
    /// Number of providers actually invoked for this response
    pub attempts: u32,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
