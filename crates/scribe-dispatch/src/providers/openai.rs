//! OpenAI chat-completions provider (also serves OpenAI-compatible endpoints)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::features::build_prompt;
use crate::types::EnhancementRequest;

use super::types::{Generation, ProviderAdapter, ProviderError, classify_status};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// OpenAI provider
pub struct OpenAiProvider {
    client: Client,
    id: String,
    api_key: String,
    base_url: String,
    models: Vec<String>,
    cost_per_1k_tokens: f64,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .finish()
    }
}

impl OpenAiProvider {
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

    fn build_request(request: &EnhancementRequest, model: String) -> OpenAiChatRequest {
        let (system, user) = build_prompt(request);
        OpenAiChatRequest {
            model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![
                OpenAiMessage {
                    role: "system".to_string(),
                    content: system,
                },
                OpenAiMessage {
                    role: "user".to_string(),
                    content: user,
                },
            ],
        }
    }

    /// Convert OpenAI response to a provider-agnostic generation
    fn from_openai_response(
        resp: OpenAiApiResponse,
        requested_model: String,
    ) -> Result<Generation, ProviderError> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::transient("OpenAI response had no choices"))?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(ProviderError::rejected(
                "OpenAI stopped generation due to its content filter",
            ));
        }

        let content = choice.message.content.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(ProviderError::transient("OpenAI returned empty content"));
        }

        let tokens_used = resp
            .usage
            .map_or(0, |u| u.total_tokens.unwrap_or(u.prompt_tokens + u.completion_tokens));

        Ok(Generation {
            content,
            model: resp.model.unwrap_or(requested_model),
            tokens_used,
            cost_usd: None,
        })
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiProvider {
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
        let url = format!("{}/v1/chat/completions", self.base_url);
        let model = self.resolve_model(request.model.as_deref());
        let body = Self::build_request(request, model.clone());

        debug!(
            "OpenAI request: provider={}, model={}, max_tokens={}",
            self.id, model, body.max_tokens
        );

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .bearer_auth(&self.api_key)
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

        let api_response: OpenAiApiResponse = response.json().await.map_err(|e| {
            ProviderError::transient(format!("Failed to parse OpenAI API response: {}", e))
        })?;

        debug!(
            "OpenAI response: choices={}, finish_reason={:?}",
            api_response.choices.len(),
            api_response.choices.first().map(|c| &c.finish_reason)
        );

        Self::from_openai_response(api_response, model)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .bearer_auth(&self.api_key)
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

// ── OpenAI wire types ──

#[derive(Debug, Clone, Serialize)]
struct OpenAiChatRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<OpenAiMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FailureKind;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(
            "openai",
            "sk-secret-key".to_string(),
            None,
            vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
            0.01,
        )
        .unwrap()
    }

    #[test]
    fn test_build_request_messages() {
        let req = EnhancementRequest::new("their going home")
            .with_feature("grammar_check")
            .with_temperature(0.2);
        let body = OpenAiProvider::build_request(&req, "gpt-4o".to_string());
        assert_eq!(body.messages.len(), 2);
        assert_eq!(body.messages[0].role, "system");
        assert!(body.messages[0].content.contains("grammatical"));
        assert_eq!(body.messages[1].content, "their going home");
        assert_eq!(body.max_tokens, 1000);

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4o");
    }

    #[test]
    fn test_from_openai_response_text() {
        let resp: OpenAiApiResponse = serde_json::from_value(serde_json::json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"content": "They're going home."}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 20, "completion_tokens": 5, "total_tokens": 25}
        }))
        .unwrap();
        let generation = OpenAiProvider::from_openai_response(resp, "gpt-4o".to_string()).unwrap();
        assert_eq!(generation.content, "They're going home.");
        assert_eq!(generation.model, "gpt-4o-2024-08-06");
        assert_eq!(generation.tokens_used, 25);
    }

    #[test]
    fn test_from_openai_response_sums_usage_without_total() {
        let resp: OpenAiApiResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
        }))
        .unwrap();
        let generation = OpenAiProvider::from_openai_response(resp, "gpt-4o".to_string()).unwrap();
        assert_eq!(generation.tokens_used, 10);
        assert_eq!(generation.model, "gpt-4o");
    }

    #[test]
    fn test_from_openai_response_no_choices() {
        let resp = OpenAiApiResponse {
            model: None,
            choices: vec![],
            usage: None,
        };
        let err = OpenAiProvider::from_openai_response(resp, "gpt-4o".to_string()).unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
    }

    #[test]
    fn test_content_filter_is_rejected() {
        let resp: OpenAiApiResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": null}, "finish_reason": "content_filter"}]
        }))
        .unwrap();
        let err = OpenAiProvider::from_openai_response(resp, "gpt-4o".to_string()).unwrap_err();
        assert_eq!(err.kind, FailureKind::Rejected);
    }

    #[test]
    fn test_resolve_model() {
        let p = provider();
        assert_eq!(p.resolve_model(None), "gpt-4o");
        assert_eq!(p.resolve_model(Some("gpt-4o-mini")), "gpt-4o-mini");
        assert_eq!(p.resolve_model(Some("claude-3")), "gpt-4o");
    }

    #[test]
    fn test_estimate_cost() {
        assert!((provider().estimate_cost(1500) - 0.015).abs() < 1e-12);
    }

    #[test]
    fn test_openai_provider_debug_hides_key() {
        let debug = format!("{:?}", provider());
        assert!(!debug.contains("sk-secret-key"));
        assert!(debug.contains("api.openai.com"));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let p = OpenAiProvider::new(
            "groq",
            String::new(),
            Some("https://api.groq.com/openai/".to_string()),
            vec!["llama3-70b".to_string()],
            0.0,
        )
        .unwrap();
        assert_eq!(p.base_url, "https://api.groq.com/openai");
        assert_eq!(p.id(), "groq");
    }
}
