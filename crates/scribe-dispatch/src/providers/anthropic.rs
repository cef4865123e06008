//! Anthropic Claude provider

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::features::build_prompt;
use crate::types::EnhancementRequest;

use super::types::{Generation, ProviderAdapter, ProviderError, classify_status};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Anthropic Claude provider
pub struct AnthropicProvider {
    client: Client,
    id: String,
    api_key: String,
    base_url: String,
    models: Vec<String>,
    cost_per_1k_tokens: f64,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(
        id: impl Into<String>,
        api_key: String,
        base_url: Option<String>,
        models: Vec<String>,
        cost_per_1k_tokens: f64,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().connect_timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            id: id.into(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            models,
            cost_per_1k_tokens,
        })
    }

    fn build_request(request: &EnhancementRequest, model: String) -> AnthropicRequest {
        let (system, user) = build_prompt(request);
        AnthropicRequest {
            model,
            max_tokens: request.max_tokens,
            temperature: request.temperature.min(1.0),
            system,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: user,
            }],
        }
    }

    /// Convert Anthropic response to a provider-agnostic generation
    fn from_anthropic_response(
        resp: AnthropicApiResponse,
        requested_model: String,
    ) -> Result<Generation, ProviderError> {
        if resp.stop_reason.as_deref() == Some("refusal") {
            return Err(ProviderError::rejected("Anthropic declined to respond to this content"));
        }

        let content = resp
            .content
            .into_iter()
            .filter_map(|b| match b {
                AnthropicBlock::Text { text } => Some(text),
                AnthropicBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.trim().is_empty() {
            return Err(ProviderError::transient("Anthropic returned empty content"));
        }

        Ok(Generation {
            content,
            model: resp.model.unwrap_or(requested_model),
            tokens_used: resp.usage.input_tokens + resp.usage.output_tokens,
            cost_usd: None,
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn supported_models(&self) -> &[String] {
        &self.models
    }

    async fn generate(
        &self,
        request: &EnhancementRequest,
        timeout: Duration,
    ) -> Result<Generation, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let model = self.resolve_model(request.model.as_deref());
        let body = Self::build_request(request, model.clone());

        debug!(
            "Anthropic request: provider={}, model={}, max_tokens={}",
            self.id, model, body.max_tokens
        );

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(status.as_u16(), &error_text));
        }

        let api_response: AnthropicApiResponse = response.json().await.map_err(|e| {
            ProviderError::transient(format!("Failed to parse Anthropic API response: {}", e))
        })?;

        debug!(
            "Anthropic response: blocks={}, stop_reason={:?}",
            api_response.content.len(),
            api_response.stop_reason
        );

        Self::from_anthropic_response(api_response, model)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Health check for {} failed: {}", self.id, e);
                false
            }
        }
    }

    fn estimate_cost(&self, tokens: u64) -> f64 {
        (tokens as f64 / 1000.0) * self.cost_per_1k_tokens
    }
}

// ── Anthropic wire types ──

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    system: String,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicApiResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FailureKind;

    #[test]
    fn test_build_request_uses_system_field() {
        let req = EnhancementRequest::new("make this clearer")
            .with_feature("clarity")
            .with_context("Quarterly report intro");
        let body = AnthropicProvider::build_request(&req, "claude-sonnet-4-5".to_string());
        assert!(body.system.contains("clarity"));
        assert_eq!(body.messages.len(), 1);
        assert_eq!(body.messages[0].role, "user");
        assert!(body.messages[0].content.contains("Quarterly report intro"));
    }

    #[test]
    fn test_temperature_clamped_to_vendor_range() {
        let req = EnhancementRequest::new("hi").with_temperature(1.8);
        let body = AnthropicProvider::build_request(&req, "claude".to_string());
        assert!((body.temperature - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_from_anthropic_response_end_turn() {
        let resp: AnthropicApiResponse = serde_json::from_value(serde_json::json!({
            "id": "msg_1",
            "model": "claude-sonnet-4-5",
            "content": [{"type": "text", "text": "Hello!"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }))
        .unwrap();
        let generation =
            AnthropicProvider::from_anthropic_response(resp, "claude".to_string()).unwrap();
        assert_eq!(generation.content, "Hello!");
        assert_eq!(generation.tokens_used, 15);
        assert_eq!(generation.model, "claude-sonnet-4-5");
    }

    #[test]
    fn test_unknown_blocks_ignored() {
        let resp: AnthropicApiResponse = serde_json::from_value(serde_json::json!({
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Done."}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        }))
        .unwrap();
        let generation =
            AnthropicProvider::from_anthropic_response(resp, "claude".to_string()).unwrap();
        assert_eq!(generation.content, "Done.");
    }

    #[test]
    fn test_refusal_is_rejected() {
        let resp: AnthropicApiResponse = serde_json::from_value(serde_json::json!({
            "content": [],
            "stop_reason": "refusal",
            "usage": {"input_tokens": 10, "output_tokens": 0}
        }))
        .unwrap();
        let err =
            AnthropicProvider::from_anthropic_response(resp, "claude".to_string()).unwrap_err();
        assert_eq!(err.kind, FailureKind::Rejected);
    }

    #[test]
    fn test_anthropic_provider_debug_hides_key() {
        let provider = AnthropicProvider::new(
            "anthropic",
            "sk-secret".to_string(),
            None,
            vec!["claude-sonnet-4-5".to_string()],
            0.015,
        )
        .unwrap();
        let debug = format!("{:?}", provider);
        assert!(!debug.contains("sk-secret"));
    }
}
