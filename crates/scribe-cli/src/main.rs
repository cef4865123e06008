use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scribe_dispatch::config::mask_secret;
use scribe_dispatch::features::known_features;
use scribe_dispatch::{
    Dispatcher, EnhancementRequest, SqliteLedgerStore, StaticTierResolver, TierResolver,
    UsageLedger,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::ScribeConfig;

#[derive(Parser)]
#[command(name = "scribe")]
#[command(version)]
#[command(about = "Scribe: AI writing assistance with provider fallback")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Load and validate the configuration
    Check,

    /// List enabled providers and their models
    Providers {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show month-to-date usage against the user's tier limits
    Usage {
        /// User id to report (defaults to [cli] default_user)
        #[arg(short, long)]
        user: Option<String>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Enhance a piece of text
    Enhance {
        /// The text to enhance
        prompt: String,

        /// User id charged for the request
        #[arg(short, long)]
        user: Option<String>,

        /// Feature tag (text_enhancement, grammar_check, style, clarity, tone, summarize)
        #[arg(short, long)]
        feature: Option<String>,

        /// Try this provider first
        #[arg(short, long)]
        provider: Option<String>,

        /// Model to request from the provider that serves the call
        #[arg(short, long)]
        model: Option<String>,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(short, long)]
        temperature: Option<f32>,

        /// Surrounding text that helps the provider
        #[arg(long)]
        context: Option<String>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Check => cmd_check(&cli.config),
        Commands::Providers { json } => cmd_providers(&cli.config, json),
        Commands::Usage { user, json } => cmd_usage(&cli.config, user, json),
        Commands::Enhance {
            prompt,
            user,
            feature,
            provider,
            model,
            max_tokens,
            temperature,
            context,
            json,
        } => {
            let mut request = EnhancementRequest::new(prompt);
            request.feature = feature;
            request.preferred_provider = provider;
            request.model = model;
            request.context = context;
            if let Some(max_tokens) = max_tokens {
                request.max_tokens = max_tokens;
            }
            if let Some(temperature) = temperature {
                request.temperature = temperature;
            }
            cmd_enhance(&cli.config, user, request, json).await
        }
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Scribe initialized at {}", config_dir.display());
    println!(
        "Edit {} to configure providers, then export OPENAI_API_KEY / ANTHROPIC_API_KEY.",
        config_path.display()
    );
    Ok(())
}

fn cmd_check(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = ScribeConfig::load(config_path)?;
    let dispatch = &cfg.dispatch;

    println!("Config OK: {}", config::config_path(config_path).display());
    println!(
        "  timeout {}s, health window {} (threshold {}, cooldown {}s), rate window {}s",
        dispatch.dispatch.request_timeout_secs,
        dispatch.dispatch.health_window,
        dispatch.dispatch.health_failure_threshold,
        dispatch.dispatch.health_cooldown_secs,
        dispatch.dispatch.rate_limit_window_secs
    );
    for (id, p) in &dispatch.providers {
        println!(
            "  {:<12} {:<14} {}{} rate={}/window cost=${}/1k key={} models=[{}]",
            id,
            p.kind.to_string(),
            if p.enabled { "enabled" } else { "disabled" },
            if p.primary { " (primary)" } else { "" },
            p.rate_limit,
            p.cost_per_1k_tokens,
            mask_secret(&p.api_key),
            p.models.join(", ")
        );
    }
    if !dispatch.dispatch.policy.default_order.is_empty() {
        println!("  default order: {}", dispatch.dispatch.policy.default_order.join(" -> "));
    }
    let mut features: Vec<_> = dispatch.dispatch.policy.features.iter().collect();
    features.sort();
    for (feature, order) in features {
        let custom = if known_features().any(|f| f == feature.as_str()) {
            ""
        } else {
            " (generic instruction)"
        };
        println!("  feature {}{}: {}", feature, custom, order.join(" -> "));
    }
    Ok(())
}

fn cmd_providers(config_path: &Option<PathBuf>, json: bool) -> Result<()> {
    let cfg = ScribeConfig::load(config_path)?;
    let dispatcher = Dispatcher::new(cfg.dispatch)?;
    let providers = dispatcher.available_providers();

    if json {
        println!("{}", serde_json::to_string_pretty(&providers)?);
        return Ok(());
    }

    for p in providers {
        println!(
            "{}{} ({}): {}",
            p.id,
            if p.primary { " [primary]" } else { "" },
            p.kind,
            p.models.join(", ")
        );
    }
    Ok(())
}

fn open_ledger(cfg: &ScribeConfig) -> Result<UsageLedger> {
    let path = cfg.cli.usage_db_path();
    let store = SqliteLedgerStore::open(&path)
        .with_context(|| format!("Failed to open usage database at {}", path.display()))?;
    Ok(UsageLedger::with_store(Arc::new(store))?)
}

fn cmd_usage(config_path: &Option<PathBuf>, user: Option<String>, json: bool) -> Result<()> {
    let cfg = ScribeConfig::load(config_path)?;
    let user = user.unwrap_or_else(|| cfg.cli.default_user.clone());
    let ledger = open_ledger(&cfg)?;
    let limits = StaticTierResolver::from_config(&cfg.dispatch).limits_for(&user);
    let month = ledger.monthly_usage(&user);

    if json {
        let report = serde_json::json!({
            "user": user,
            "usage": month,
            "limits": limits,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let token_limit = limits
        .monthly_token_limit
        .map_or("unlimited".to_string(), |l| l.to_string());
    let cost_limit = limits
        .monthly_cost_limit_usd
        .map_or("unlimited".to_string(), |l| format!("${:.4}", l));
    println!("Usage for {} this month:", user);
    println!("  tokens   {} of {}", month.tokens, token_limit);
    println!("  cost     ${:.4} of {}", month.cost_usd, cost_limit);
    println!("  requests {}", month.requests);
    let mut providers: Vec<_> = month.requests_by_provider.iter().collect();
    providers.sort();
    for (provider, count) in providers {
        println!("    {:<12} {}", provider, count);
    }
    Ok(())
}

async fn cmd_enhance(
    config_path: &Option<PathBuf>,
    user: Option<String>,
    request: EnhancementRequest,
    json: bool,
) -> Result<()> {
    let cfg = ScribeConfig::load(config_path)?;
    let ledger = open_ledger(&cfg)?;
    let user = user.unwrap_or(cfg.cli.default_user);
    let dispatcher = Dispatcher::new(cfg.dispatch)?.with_ledger(Arc::new(ledger));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, cancelling request");
            ctrl_c.cancel();
        }
    });

    let response = dispatcher.enhance(&cancel, &user, request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", response.content);
        eprintln!(
            "\n[{} / {} | {} tokens | ${:.6} | {}ms | {} attempt(s)]",
            response.provider_used,
            response.model_used,
            response.tokens_used,
            response.cost_estimate,
            response.processing_time.as_millis(),
            response.attempts
        );
    }
    Ok(())
}
