//! Immutable dispatch configuration snapshot
//!
//! Loaded once (by the surrounding service) and handed to the
//! [`crate::Dispatcher`]. A reload builds a fresh snapshot and swaps it in
//! whole; nothing here is mutated while requests are in flight.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::usage::TierLimits;

/// Which adapter implementation serves a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    /// Any OpenAI wire-compatible endpoint (Groq, Together, Ollama, ...)
    #[serde(rename = "openai_compat")]
    OpenAiCompat,
    #[serde(rename = "anthropic")]
    Anthropic,
    /// Google Gemini
    #[serde(rename = "google")]
    Google,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::OpenAiCompat => write!(f, "openai_compat"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::Google => write!(f, "google"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub primary: bool,
    /// Requests allowed per rate-limit window
    pub rate_limit: u32,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    /// Supported models; the first is the default
    pub models: Vec<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
}

impl std::fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("kind", &self.kind)
            .field("enabled", &self.enabled)
            .field("primary", &self.primary)
            .field("rate_limit", &self.rate_limit)
            .field("cost_per_1k_tokens", &self.cost_per_1k_tokens)
            .field("models", &self.models)
            .field("base_url", &self.base_url)
            .field("api_key", &mask_secret(&self.api_key))
            .finish()
    }
}

impl ProviderDescriptor {
    pub fn estimate_cost(&self, tokens: u64) -> f64 {
        (tokens as f64 / 1000.0) * self.cost_per_1k_tokens
    }
}

/// Ordered provider preferences
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Global order used after the feature order and the primary provider
    #[serde(default)]
    pub default_order: Vec<String>,
    /// Feature tag -> ordered provider ids
    #[serde(default)]
    pub features: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_health_window")]
    pub health_window: usize,
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: f64,
    #[serde(default = "default_health_cooldown_secs")]
    pub health_cooldown_secs: u64,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(flatten)]
    pub policy: FallbackPolicy,
}

fn default_true() -> bool {
    true
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_health_window() -> usize {
    20
}
fn default_health_failure_threshold() -> f64 {
    0.5
}
fn default_health_cooldown_secs() -> u64 {
    30
}
fn default_rate_limit_window_secs() -> u64 {
    60
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            health_window: default_health_window(),
            health_failure_threshold: default_health_failure_threshold(),
            health_cooldown_secs: default_health_cooldown_secs(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            policy: FallbackPolicy::default(),
        }
    }
}

impl DispatchSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_cooldown(&self) -> Duration {
        Duration::from_secs(self.health_cooldown_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

/// Which tier each user belongs to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserTiers {
    #[serde(default)]
    pub default_tier: Option<String>,
    #[serde(default)]
    pub assignments: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub dispatch: DispatchSettings,
    pub providers: BTreeMap<String, ProviderDescriptor>,
    #[serde(default)]
    pub tiers: HashMap<String, TierLimits>,
    #[serde(default)]
    pub users: UserTiers,
}

impl DispatchConfig {
    pub fn provider(&self, id: &str) -> Option<&ProviderDescriptor> {
        self.providers.get(id)
    }

    /// The provider flagged `primary`, if any
    pub fn primary(&self) -> Option<&str> {
        self.providers
            .iter()
            .find(|(_, p)| p.primary)
            .map(|(id, _)| id.as_str())
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.provider(id).is_some_and(|p| p.enabled)
    }

    /// Check every invariant the dispatcher relies on
    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(config_error("at least one provider must be configured"));
        }

        for (id, p) in &self.providers {
            if id.trim().is_empty() {
                return Err(config_error("provider id must not be empty"));
            }
            if p.rate_limit == 0 {
                return Err(config_error(format!("provider '{}': rate_limit must be > 0", id)));
            }
            if !p.cost_per_1k_tokens.is_finite() || p.cost_per_1k_tokens < 0.0 {
                return Err(config_error(format!(
                    "provider '{}': cost_per_1k_tokens must be a non-negative number",
                    id
                )));
            }
            if p.models.is_empty() {
                return Err(config_error(format!(
                    "provider '{}': at least one model must be listed",
                    id
                )));
            }
            if p.kind == ProviderKind::OpenAiCompat && p.base_url.is_none() {
                return Err(config_error(format!(
                    "provider '{}': openai_compat providers require base_url",
                    id
                )));
            }
        }

        let primaries: Vec<&str> = self
            .providers
            .iter()
            .filter(|(_, p)| p.primary)
            .map(|(id, _)| id.as_str())
            .collect();
        if primaries.len() > 1 {
            return Err(config_error(format!(
                "at most one provider may be primary, found: {}",
                primaries.join(", ")
            )));
        }

        let policy = &self.dispatch.policy;
        for id in &policy.default_order {
            self.check_reference("default_order", id)?;
        }
        for (feature, order) in &policy.features {
            for id in order {
                self.check_reference(&format!("features.{}", feature), id)?;
            }
        }

        let s = &self.dispatch;
        if s.request_timeout_secs == 0 {
            return Err(config_error("request_timeout_secs must be > 0"));
        }
        if s.health_window == 0 {
            return Err(config_error("health_window must be > 0"));
        }
        if !(s.health_failure_threshold > 0.0 && s.health_failure_threshold <= 1.0) {
            return Err(config_error("health_failure_threshold must be within (0, 1]"));
        }
        if s.rate_limit_window_secs == 0 {
            return Err(config_error("rate_limit_window_secs must be > 0"));
        }

        if let Some(tier) = &self.users.default_tier
            && !self.tiers.contains_key(tier)
        {
            return Err(config_error(format!("default_tier '{}' is not defined", tier)));
        }
        for (user, tier) in &self.users.assignments {
            if !self.tiers.contains_key(tier) {
                return Err(config_error(format!(
                    "user '{}' is assigned to undefined tier '{}'",
                    user, tier
                )));
            }
        }

        Ok(())
    }

    fn check_reference(&self, location: &str, id: &str) -> Result<()> {
        if self.providers.contains_key(id) {
            Ok(())
        } else {
            Err(config_error(format!(
                "{} references unknown provider '{}'",
                location, id
            )))
        }
    }
}

fn config_error(msg: impl Into<String>) -> DispatchError {
    DispatchError::Config(msg.into())
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [dispatch]
        request_timeout_secs = 5
        default_order = ["openai", "anthropic"]

        [dispatch.features]
        grammar_check = ["anthropic", "openai"]

        [providers.openai]
        kind = "openai"
        primary = true
        rate_limit = 60
        cost_per_1k_tokens = 0.01
        models = ["gpt-4o", "gpt-4o-mini"]
        api_key = "sk-test-1234567890"

        [providers.anthropic]
        kind = "anthropic"
        rate_limit = 50
        cost_per_1k_tokens = 0.015
        models = ["claude-sonnet-4-5"]

        [tiers.free]
        monthly_token_limit = 100000

        [users]
        default_tier = "free"
    "#;

    fn sample() -> DispatchConfig {
        toml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_and_validate_sample() {
        let config = sample();
        config.validate().unwrap();
        assert_eq!(config.dispatch.request_timeout_secs, 5);
        assert_eq!(config.dispatch.health_window, 20);
        assert_eq!(config.dispatch.health_cooldown_secs, 30);
        assert_eq!(config.primary(), Some("openai"));
        assert_eq!(
            config.dispatch.policy.features["grammar_check"],
            vec!["anthropic", "openai"]
        );
        assert!(config.is_enabled("anthropic"));
        assert!(!config.is_enabled("cohere"));
    }

    #[test]
    fn test_unknown_policy_reference_rejected() {
        let mut config = sample();
        config.dispatch.policy.default_order.push("cohere".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown provider 'cohere'"));
    }

    #[test]
    fn test_unknown_feature_reference_rejected() {
        let mut config = sample();
        config
            .dispatch
            .policy
            .features
            .insert("tone".to_string(), vec!["google".to_string()]);
        assert!(config.validate().unwrap_err().to_string().contains("features.tone"));
    }

    #[test]
    fn test_multiple_primaries_rejected() {
        let mut config = sample();
        config.providers.get_mut("anthropic").unwrap().primary = true;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "invalid_config");
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let mut config = sample();
        config.providers.get_mut("openai").unwrap().rate_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_models_rejected() {
        let mut config = sample();
        config.providers.get_mut("openai").unwrap().models.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_undefined_tier_rejected() {
        let mut config = sample();
        config
            .users
            .assignments
            .insert("user-1".to_string(), "enterprise".to_string());
        assert!(config.validate().unwrap_err().to_string().contains("enterprise"));
    }

    #[test]
    fn test_compat_requires_base_url() {
        let mut config = sample();
        config.providers.get_mut("anthropic").unwrap().kind = ProviderKind::OpenAiCompat;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_descriptor_debug_hides_key() {
        let config = sample();
        let debug = format!("{:?}", config.providers["openai"]);
        assert!(!debug.contains("sk-test-1234567890"));
        assert!(debug.contains("sk-...7890"));
    }

    #[test]
    fn test_estimate_cost() {
        let config = sample();
        let cost = config.providers["openai"].estimate_cost(2500);
        assert!((cost - 0.025).abs() < 1e-9);
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(empty)");
        assert_eq!(mask_secret("short"), "***");
        assert_eq!(mask_secret("sk-ant-abcdef1234"), "sk-...1234");
    }
}
