//! Google Gemini provider

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::features::build_prompt;
use crate::types::EnhancementRequest;

use super::types::{Generation, ProviderAdapter, ProviderError, classify_status};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Finish reasons meaning Gemini withheld the output on content grounds
const BLOCKED_FINISH_REASONS: &[&str] = &["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII"];

/// Google Gemini provider
pub struct GoogleProvider {
    client: Client,
    id: String,
    api_key: String,
    base_url: String,
    models: Vec<String>,
    cost_per_1k_tokens: f64,
}

impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("models", &self.models)
            .finish()
    }
}

impl GoogleProvider {
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

    fn build_request(request: &EnhancementRequest) -> GeminiRequest {
        let (system, user) = build_prompt(request);
        GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart { text: Some(user) }],
            }],
            system_instruction: GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: Some(system) }],
            },
            generation_config: GeminiGenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        }
    }

    /// Convert Gemini response to a provider-agnostic generation
    fn from_gemini_response(
        resp: GeminiApiResponse,
        requested_model: String,
    ) -> Result<Generation, ProviderError> {
        if let Some(reason) = resp.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ProviderError::rejected(format!(
                "Gemini blocked the prompt ({})",
                reason
            )));
        }

        let candidate = resp
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::transient("Gemini response had no candidates"))?;

        if let Some(reason) = candidate.finish_reason.as_deref()
            && BLOCKED_FINISH_REASONS.contains(&reason)
        {
            return Err(ProviderError::rejected(format!(
                "Gemini withheld the response ({})",
                reason
            )));
        }

        let content = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect::<Vec<_>>().join(""))
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ProviderError::transient("Gemini returned empty content"));
        }

        let tokens_used = resp.usage_metadata.map_or(0, |u| {
            u.total_token_count.unwrap_or_else(|| {
                u.prompt_token_count.unwrap_or(0) + u.candidates_token_count.unwrap_or(0)
            })
        });

        Ok(Generation {
            content,
            model: resp.model_version.unwrap_or(requested_model),
            tokens_used,
            cost_usd: None,
        })
    }
}

#[async_trait]
impl ProviderAdapter for GoogleProvider {
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
        let model = self.resolve_model(request.model.as_deref());
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);
        let body = Self::build_request(request);

        debug!(
            "Gemini request: provider={}, model={}, max_tokens={}",
            self.id, model, body.generation_config.max_output_tokens
        );

        // Key goes in a header so it never shows up in URLs echoed by errors
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("x-goog-api-key", &self.api_key)
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

        let api_response: GeminiApiResponse = response.json().await.map_err(|e| {
            ProviderError::transient(format!("Failed to parse Gemini API response: {}", e))
        })?;

        debug!(
            "Gemini response: candidates={}",
            api_response.candidates.len()
        );

        Self::from_gemini_response(api_response, model)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/v1beta/models", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(HEALTH_CHECK_TIMEOUT)
            .header("x-goog-api-key", &self.api_key)
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

// ── Gemini wire types ──

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    system_instruction: GeminiContent,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiApiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    total_token_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FailureKind;

    fn parse(value: serde_json::Value) -> GeminiApiResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_build_request_wire_shape() {
        let req = EnhancementRequest::new("fix this sentance")
            .with_feature("grammar_check")
            .with_temperature(1.5);
        let body = serde_json::to_value(GoogleProvider::build_request(&req)).unwrap();

        assert_eq!(body["contents"][0]["role"], "user");
        assert!(body["contents"][0]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("fix this sentance"));
        assert!(body["systemInstruction"].get("role").is_none());
        assert!(body["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("grammatical"));
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1000);
        assert_eq!(body["generationConfig"]["temperature"], 1.5);
    }

    #[test]
    fn test_from_gemini_response_stop() {
        let resp = parse(serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Fixed "}, {"text": "sentence."}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 4, "totalTokenCount": 16},
            "modelVersion": "gemini-2.5-flash"
        }));
        let generation =
            GoogleProvider::from_gemini_response(resp, "gemini".to_string()).unwrap();
        assert_eq!(generation.content, "Fixed sentence.");
        assert_eq!(generation.tokens_used, 16);
        assert_eq!(generation.model, "gemini-2.5-flash");
    }

    #[test]
    fn test_usage_without_total_sums_parts() {
        let resp = parse(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "ok"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3}
        }));
        let generation =
            GoogleProvider::from_gemini_response(resp, "gemini-2.5-flash".to_string()).unwrap();
        assert_eq!(generation.tokens_used, 10);
        assert_eq!(generation.model, "gemini-2.5-flash");
    }

    #[test]
    fn test_blocked_prompt_is_rejected() {
        let resp = parse(serde_json::json!({
            "promptFeedback": {"blockReason": "SAFETY"}
        }));
        let err =
            GoogleProvider::from_gemini_response(resp, "gemini".to_string()).unwrap_err();
        assert_eq!(err.kind, FailureKind::Rejected);
        assert!(!err.allows_fallback());
    }

    #[test]
    fn test_safety_finish_is_rejected() {
        let resp = parse(serde_json::json!({
            "candidates": [{"finishReason": "SAFETY"}]
        }));
        let err =
            GoogleProvider::from_gemini_response(resp, "gemini".to_string()).unwrap_err();
        assert_eq!(err.kind, FailureKind::Rejected);
    }

    #[test]
    fn test_no_candidates_is_transient() {
        let err = GoogleProvider::from_gemini_response(parse(serde_json::json!({})), "g".into())
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);

        let resp = parse(serde_json::json!({
            "candidates": [{"content": {"parts": []}, "finishReason": "MAX_TOKENS"}]
        }));
        let err = GoogleProvider::from_gemini_response(resp, "g".into()).unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
    }

    #[test]
    fn test_google_provider_debug_hides_key() {
        let provider = GoogleProvider::new(
            "gemini",
            "AIza-secret".to_string(),
            None,
            vec!["gemini-2.5-flash".to_string()],
            0.0003,
        )
        .unwrap();
        let debug = format!("{:?}", provider);
        assert!(!debug.contains("AIza-secret"));
        assert!(debug.contains(DEFAULT_BASE_URL));
    }
}
