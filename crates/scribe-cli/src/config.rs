use anyhow::{Context, Result};
use scribe_dispatch::DispatchConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScribeConfig {
    #[serde(flatten)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub cli: CliConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// User id charged for `scribe enhance` when --user is not given
    #[serde(default = "default_user")]
    pub default_user: String,
    /// SQLite file holding the usage ledger (default ~/.scribe/usage.db)
    #[serde(default)]
    pub usage_db: Option<PathBuf>,
}

fn default_user() -> String {
    "local".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            default_user: default_user(),
            usage_db: None,
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".scribe")
}

impl CliConfig {
    pub fn usage_db_path(&self) -> PathBuf {
        self.usage_db
            .clone()
            .unwrap_or_else(|| config_dir().join("usage.db"))
    }
}

pub fn config_path(custom_path: &Option<PathBuf>) -> PathBuf {
    custom_path
        .clone()
        .unwrap_or_else(|| config_dir().join("config.toml"))
}

impl ScribeConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = config_path(custom_path);

        check_permissions(&path)?;

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `scribe init` first.",
                path.display()
            )
        })?;

        for line in hardcoded_key_lines(&content) {
            warn!(
                "API key is hardcoded in {} (line {}). For security, use environment variables: api_key = \"${{OPENAI_API_KEY}}\"",
                path.display(),
                line
            );
        }

        // Expand environment variables before parsing
        let expanded = expand_env_vars(&content);

        let config: Self = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        config
            .dispatch
            .validate()
            .with_context(|| format!("Invalid config at {}", path.display()))?;

        for (id, p) in &config.dispatch.providers {
            if p.enabled && p.api_key.is_empty() {
                warn!("Provider {} has no API key; its requests will fail", id);
            }
        }

        Ok(config)
    }
}

/// Refuse config files readable by group or other (Unix only)
fn check_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(anyhow::anyhow!(
                    "Config file {:?} has overly permissive permissions ({:o}). \
                     It may contain secrets. Fix with: chmod 600 {:?}",
                    path,
                    mode & 0o777,
                    path
                ));
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// 1-based line numbers of `api_key` entries holding a literal value
fn hardcoded_key_lines(content: &str) -> Vec<usize> {
    content
        .lines()
        .enumerate()
        .filter_map(|(n, line)| {
            let value = line.trim().strip_prefix("api_key")?.trim_start().strip_prefix('=')?;
            let value = value.trim().trim_matches('"');
            (!value.is_empty() && !value.contains("${")).then_some(n + 1)
        })
        .collect()
}

/// Allowlist of environment variable names that may be expanded in config files.
/// This prevents an attacker who can modify the config from reading arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GOOGLE_AI_API_KEY",
    "COHERE_API_KEY",
    "GROQ_API_KEY",
    "TOGETHER_API_KEY",
    "CUSTOM_LLM_API_KEY",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            // Leave the ${VAR} unexpanded so it's obvious
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[providers.openai]
kind = "openai"
primary = true
rate_limit = 60
models = ["gpt-4o"]
api_key = "${OPENAI_API_KEY}"
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();
        }
        file
    }

    #[test]
    fn test_default_config_parses() {
        let expanded = expand_env_vars(include_str!("../../../config/default.toml"));
        let config: ScribeConfig = toml::from_str(&expanded).unwrap();
        config.dispatch.validate().unwrap();
        assert_eq!(config.dispatch.primary(), Some("openai"));
        assert_eq!(config.cli.default_user, "local");
        assert_eq!(
            config.dispatch.providers["gemini"].kind,
            scribe_dispatch::ProviderKind::Google
        );
        assert!(!config.dispatch.is_enabled("cohere"));
    }

    #[test]
    fn test_load_minimal_config() {
        let file = write_config(MINIMAL);
        let config = ScribeConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert!(config.dispatch.providers.contains_key("openai"));
        assert_eq!(config.cli.default_user, "local");
        assert_eq!(config.dispatch.dispatch.request_timeout_secs, 10);
        assert_eq!(config.cli.usage_db_path(), config_dir().join("usage.db"));
    }

    #[test]
    fn test_usage_db_override() {
        let file = write_config(&format!("{}\n[cli]\nusage_db = \"/tmp/scribe-usage.db\"\n", MINIMAL));
        let config = ScribeConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.cli.usage_db_path(), PathBuf::from("/tmp/scribe-usage.db"));
        assert_eq!(config.cli.default_user, "local");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ScribeConfig::load(&Some(dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("scribe init"));
    }

    #[test]
    fn test_load_rejects_invalid_dispatch_config() {
        let file = write_config(&format!("{}\n[dispatch]\ndefault_order = [\"mistral\"]\n", MINIMAL));
        let err = ScribeConfig::load(&Some(file.path().to_path_buf())).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown provider 'mistral'"));
    }

    #[cfg(unix)]
    #[test]
    fn test_load_rejects_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let file = write_config(MINIMAL);
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();
        let err = ScribeConfig::load(&Some(file.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("chmod 600"));
    }

    #[test]
    fn test_expand_allowed_var() {
        // HOME is allowlisted and set in any sane test environment
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(expand_env_vars("dir = \"${HOME}/x\""), format!("dir = \"{}/x\"", home));
    }

    #[test]
    fn test_expand_skips_unlisted_var() {
        let input = "api_key = \"${AWS_SECRET_ACCESS_KEY}\" other = \"${HOME}\"";
        let expanded = expand_env_vars(input);
        assert!(expanded.contains("${AWS_SECRET_ACCESS_KEY}"));
        assert!(!expanded.contains("${HOME}"));
    }

    #[test]
    fn test_expand_unterminated() {
        assert_eq!(expand_env_vars("key = \"${OPENAI_API_KEY"), "key = \"${OPENAI_API_KEY");
    }

    #[test]
    fn test_hardcoded_key_lines() {
        let content = "[providers.a]\napi_key = \"sk-live-123\"\n[providers.b]\napi_key = \"${OPENAI_API_KEY}\"\napi_key = \"\"\n";
        assert_eq!(hardcoded_key_lines(content), vec![2]);
    }
}
