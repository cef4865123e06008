//! Ordered-candidate dispatch with fallback
//!
//! Each call resolves a candidate list (caller preference, feature policy,
//! primary, global order), checks the caller's quota, then walks the list
//! one provider at a time. Unhealthy and rate-limited providers are skipped,
//! transient failures fall through to the next candidate, and a content
//! rejection ends the call immediately.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DispatchConfig, ProviderKind};
use crate::error::{CandidateFailure, DispatchError, FailureReason, Result};
use crate::health::{HealthSnapshot, HealthTracker};
use crate::providers::{ProviderAdapter, build_adapters};
use crate::rate_limit::RateLimiter;
use crate::types::{EnhancementRequest, EnhancementResponse};
use crate::usage::{StaticTierResolver, TierResolver, UsageLedger};

/// Everything that is replaced together on reload
struct Snapshot {
    config: DispatchConfig,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    limiter: RateLimiter,
    tiers: StaticTierResolver,
}

impl Snapshot {
    fn build(config: DispatchConfig, adapters: HashMap<String, Arc<dyn ProviderAdapter>>) -> Result<Self> {
        config.validate()?;
        for id in config.providers.keys() {
            if !adapters.contains_key(id) {
                warn!("Provider {} is configured but has no adapter, it will never be selected", id);
            }
        }
        Ok(Self {
            limiter: RateLimiter::from_config(&config),
            tiers: StaticTierResolver::from_config(&config),
            adapters,
            config,
        })
    }

    /// Resolve the ordered, de-duplicated list of providers to try
    fn candidates(&self, request: &EnhancementRequest) -> Vec<String> {
        let policy = &self.config.dispatch.policy;
        let mut ordered: Vec<&str> = Vec::new();

        if let Some(preferred) = request.preferred_provider.as_deref() {
            ordered.push(preferred.trim());
        }
        if let Some(order) = request.feature.as_deref().and_then(|f| policy.features.get(f)) {
            ordered.extend(order.iter().map(String::as_str));
        }
        if let Some(primary) = self.config.primary() {
            ordered.push(primary);
        }
        ordered.extend(policy.default_order.iter().map(String::as_str));

        let mut seen = HashSet::new();
        ordered
            .into_iter()
            .filter(|id| self.config.is_enabled(id) && self.adapters.contains_key(*id))
            .filter(|id| seen.insert(*id))
            .map(str::to_string)
            .collect()
    }
}

/// A provider as seen by callers choosing where to send requests
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub kind: ProviderKind,
    pub primary: bool,
    pub models: Vec<String>,
    pub health: HealthSnapshot,
}

/// Routes enhancement requests across providers with health, rate-limit and quota checks
pub struct Dispatcher {
    snapshot: RwLock<Arc<Snapshot>>,
    health: Arc<HealthTracker>,
    ledger: Arc<UsageLedger>,
    /// Replaces the config-backed tier lookup when set
    tier_override: Option<Arc<dyn TierResolver>>,
}

impl Dispatcher {
    /// Build a dispatcher with HTTP adapters for every configured provider
    pub fn new(config: DispatchConfig) -> Result<Self> {
        let adapters = build_adapters(&config)?;
        Self::with_adapters(config, adapters)
    }

    /// Build a dispatcher around caller-supplied adapters
    pub fn with_adapters(
        config: DispatchConfig,
        adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    ) -> Result<Self> {
        let health = HealthTracker::from_settings(&config.dispatch);
        let snapshot = Snapshot::build(config, adapters)?;
        info!(
            "Dispatcher ready with {} provider(s): {}",
            snapshot.adapters.len(),
            snapshot.config.providers.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            health: Arc::new(health),
            ledger: Arc::new(UsageLedger::new()),
            tier_override: None,
        })
    }

    /// Resolve tier limits through an external source (e.g. user storage)
    pub fn with_tier_resolver(mut self, resolver: Arc<dyn TierResolver>) -> Self {
        self.tier_override = Some(resolver);
        self
    }

    /// Share a ledger with other components (e.g. a usage report endpoint)
    pub fn with_ledger(mut self, ledger: Arc<UsageLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    fn current(&self) -> Arc<Snapshot> {
        let guard = self.snapshot.read().unwrap_or_else(|poisoned| {
            warn!("Dispatcher snapshot lock was poisoned, recovering");
            poisoned.into_inner()
        });
        Arc::clone(&guard)
    }

    /// Enhance text using the first candidate provider that succeeds
    pub async fn enhance(
        &self,
        cancel: &CancellationToken,
        user_id: &str,
        request: EnhancementRequest,
    ) -> Result<EnhancementResponse> {
        request.validate()?;
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let snapshot = self.current();
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let candidates = snapshot.candidates(&request);

        debug!(
            request_id = %request_id,
            user_id,
            feature = request.feature.as_deref().unwrap_or("-"),
            "Resolved candidate order: [{}]",
            candidates.join(", ")
        );

        let limits = match &self.tier_override {
            Some(resolver) => resolver.limits_for(user_id),
            None => snapshot.tiers.limits_for(user_id),
        };
        if let Err(e) = self.ledger.check_quota(user_id, &limits) {
            warn!(request_id = %request_id, "Rejecting request: {}", e);
            return Err(e);
        }

        let timeout = snapshot.config.dispatch.request_timeout();
        let mut failures = Vec::with_capacity(candidates.len());
        let mut attempts = 0u32;
        let mut last_failed: Option<&str> = None;

        for (idx, id) in candidates.iter().enumerate() {
            let Some(adapter) = snapshot.adapters.get(id) else {
                continue;
            };

            if !self.health.is_eligible(id) {
                debug!(request_id = %request_id, "Skipping {}: unhealthy", id);
                failures.push(CandidateFailure {
                    provider: id.clone(),
                    reason: FailureReason::Unhealthy,
                });
                continue;
            }

            if !snapshot.limiter.try_acquire(id) {
                debug!(request_id = %request_id, "Skipping {}: rate limited", id);
                failures.push(CandidateFailure {
                    provider: id.clone(),
                    reason: FailureReason::RateLimited,
                });
                continue;
            }

            attempts += 1;
            if let Some(prev) = last_failed.take() {
                info!(request_id = %request_id, "Failing over from {} to {}", prev, id);
            }
            debug!(
                request_id = %request_id,
                "Trying provider {} ({}/{})",
                id,
                idx + 1,
                candidates.len()
            );

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(request_id = %request_id, "Request cancelled while waiting on {}", id);
                    return Err(DispatchError::Cancelled);
                }
                result = tokio::time::timeout(timeout, adapter.generate(&request, timeout)) => result,
            };

            let reason = match outcome {
                Ok(Ok(generation)) => {
                    self.health.record_outcome(id, true);

                    let tokens_used = generation.tokens_used;
                    let cost_estimate = generation
                        .cost_usd
                        .filter(|c| c.is_finite() && *c >= 0.0)
                        .unwrap_or_else(|| adapter.estimate_cost(tokens_used));
                    self.ledger.record(user_id, id, tokens_used, cost_estimate);

                    let processing_time = started.elapsed();
                    if idx > 0 {
                        info!(request_id = %request_id, "Request succeeded on failover provider {}", id);
                    }
                    info!(
                        request_id = %request_id,
                        provider = %id,
                        model = %generation.model,
                        tokens = tokens_used,
                        cost_usd = cost_estimate,
                        elapsed_ms = processing_time.as_millis() as u64,
                        "Enhancement complete"
                    );

                    return Ok(EnhancementResponse {
                        content: generation.content,
                        provider_used: id.clone(),
                        model_used: generation.model,
                        tokens_used,
                        cost_estimate,
                        processing_time,
                        confidence_score: None,
                        attempts,
                    });
                }
                Ok(Err(error)) if !error.allows_fallback() => {
                    warn!(request_id = %request_id, "Provider {} rejected the request: {}", id, error);
                    return Err(DispatchError::Rejected {
                        provider: id.clone(),
                        message: error.message,
                    });
                }
                Ok(Err(error)) => {
                    warn!(request_id = %request_id, "Provider {} failed: {}", id, error);
                    FailureReason::Provider { error }
                }
                Err(_) => {
                    warn!(request_id = %request_id, "Provider {} timed out after {:?}", id, timeout);
                    FailureReason::TimedOut {
                        after_ms: timeout.as_millis() as u64,
                    }
                }
            };

            self.health.record_outcome(id, false);
            failures.push(CandidateFailure {
                provider: id.clone(),
                reason,
            });
            last_failed = Some(id);
        }

        let err = DispatchError::AllProvidersUnavailable { failures };
        warn!(
            request_id = %request_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "{}",
            err
        );
        Err(err)
    }

    /// Enabled providers with their models, primary first
    pub fn available_providers(&self) -> Vec<ProviderInfo> {
        let snapshot = self.current();
        let mut providers: Vec<ProviderInfo> = snapshot
            .config
            .providers
            .iter()
            .filter(|(id, p)| p.enabled && snapshot.adapters.contains_key(*id))
            .map(|(id, p)| ProviderInfo {
                id: id.clone(),
                kind: p.kind,
                primary: p.primary,
                models: p.models.clone(),
                health: self.health.snapshot(id),
            })
            .collect();
        providers.sort_by_key(|p| !p.primary);
        providers
    }

    /// Models a provider can serve, or `None` if it is not configured
    pub fn supported_models(&self, provider: &str) -> Option<Vec<String>> {
        let snapshot = self.current();
        snapshot
            .adapters
            .get(provider)
            .map(|a| a.supported_models().to_vec())
    }

    /// Swap in a new configuration, rebuilding adapters and rate-limit buckets
    pub fn reload(&self, config: DispatchConfig) -> Result<()> {
        let adapters = build_adapters(&config)?;
        self.reload_with_adapters(config, adapters)
    }

    /// Swap in a new configuration with caller-supplied adapters
    ///
    /// Health history and usage survive the swap; requests already in flight
    /// finish against the snapshot they started with.
    pub fn reload_with_adapters(
        &self,
        config: DispatchConfig,
        adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    ) -> Result<()> {
        let snapshot = Arc::new(Snapshot::build(config, adapters)?);
        let mut guard = self.snapshot.write().unwrap_or_else(|poisoned| {
            warn!("Dispatcher snapshot lock was poisoned, recovering");
            poisoned.into_inner()
        });
        *guard = snapshot;
        info!("Dispatcher configuration reloaded");
        Ok(())
    }

    /// Run `health_check` against every enabled provider that is currently tripped
    ///
    /// Returns the probed providers and whether each answered healthy.
    pub async fn probe_health(&self) -> Vec<(String, bool)> {
        let snapshot = self.current();
        let mut ids: Vec<&String> = snapshot
            .adapters
            .keys()
            .filter(|id| snapshot.config.is_enabled(id) && self.health.is_tripped(id))
            .collect();
        ids.sort();

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(adapter) = snapshot.adapters.get(id) else {
                continue;
            };
            let healthy = adapter.health_check().await;
            debug!("Health probe for {}: {}", id, if healthy { "ok" } else { "failed" });
            self.health.record_outcome(id, healthy);
            results.push((id.clone(), healthy));
        }
        results
    }

    /// Probe tripped providers every `interval` until `shutdown` fires
    pub fn spawn_health_probe(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Health probe started (every {:?})", interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Health probe shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let probed = dispatcher.probe_health().await;
                        if !probed.is_empty() {
                            debug!("Probed {} tripped provider(s)", probed.len());
                        }
                    }
                }
            }
        })
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }
}
