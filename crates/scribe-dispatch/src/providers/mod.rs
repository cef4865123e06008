//! Vendor adapters behind a single capability trait
//!
//! Adapters implement [`ProviderAdapter`] and are registered by provider id.
//! The dispatcher only ever sees the trait; adding a vendor means adding a
//! module here and a [`ProviderKind`] variant.

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{DispatchConfig, ProviderKind};
use crate::error::{DispatchError, Result};

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;
pub use types::{FailureKind, Generation, ProviderAdapter, ProviderError, classify_status};

/// Construct one adapter per configured provider, keyed by provider id
pub fn build_adapters(config: &DispatchConfig) -> Result<HashMap<String, Arc<dyn ProviderAdapter>>> {
    let mut adapters: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();

    for (id, p) in &config.providers {
        let adapter: Arc<dyn ProviderAdapter> = match p.kind {
            ProviderKind::OpenAi | ProviderKind::OpenAiCompat => Arc::new(
                OpenAiProvider::new(
                    id.clone(),
                    p.api_key.clone(),
                    p.base_url.clone(),
                    p.models.clone(),
                    p.cost_per_1k_tokens,
                )
                .map_err(|e| client_error(id, e))?,
            ),
            ProviderKind::Anthropic => Arc::new(
                AnthropicProvider::new(
                    id.clone(),
                    p.api_key.clone(),
                    p.base_url.clone(),
                    p.models.clone(),
                    p.cost_per_1k_tokens,
                )
                .map_err(|e| client_error(id, e))?,
            ),
            ProviderKind::Google => Arc::new(
                GoogleProvider::new(
                    id.clone(),
                    p.api_key.clone(),
                    p.base_url.clone(),
                    p.models.clone(),
                    p.cost_per_1k_tokens,
                )
                .map_err(|e| client_error(id, e))?,
            ),
        };
        debug!("Registered provider {} ({})", id, p.kind);
        adapters.insert(id.clone(), adapter);
    }

    Ok(adapters)
}

fn client_error(id: &str, err: reqwest::Error) -> DispatchError {
    DispatchError::Config(format!("provider '{}': failed to build HTTP client: {}", id, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_adapters_by_kind() {
        let config: DispatchConfig = toml::from_str(
            r#"
            [providers.openai]
            kind = "openai"
            rate_limit = 60
            models = ["gpt-4o"]

            [providers.groq]
            kind = "openai_compat"
            rate_limit = 30
            models = ["llama-3.3-70b"]
            base_url = "https://api.groq.com/openai"

            [providers.anthropic]
            kind = "anthropic"
            rate_limit = 50
            models = ["claude-sonnet-4-5", "claude-haiku-4-5"]

            [providers.gemini]
            kind = "google"
            rate_limit = 60
            models = ["gemini-2.5-flash"]
            "#,
        )
        .unwrap();

        let adapters = build_adapters(&config).unwrap();
        assert_eq!(adapters.len(), 4);
        assert_eq!(adapters["gemini"].id(), "gemini");
        assert_eq!(adapters["gemini"].resolve_model(None), "gemini-2.5-flash");
        assert_eq!(adapters["groq"].id(), "groq");
        assert_eq!(adapters["anthropic"].supported_models().len(), 2);
        assert_eq!(
            adapters["anthropic"].resolve_model(Some("claude-haiku-4-5")),
            "claude-haiku-4-5"
        );
    }
}
