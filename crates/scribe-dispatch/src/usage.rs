//! Usage ledger and tier quotas
//!
//! Records tokens, cost, and per-provider request counts per user per UTC
//! day, and enforces monthly tier limits before any provider is contacted.
//! The check-then-record sequence is best-effort: concurrent requests from
//! the same user may overshoot a limit slightly.
//!
//! A ledger built with [`UsageLedger::with_store`] replays the retained days
//! from a [`LedgerStore`] at startup and writes every recorded call through
//! to it, so monthly quotas survive restarts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::lock_or_recover;

/// Day buckets older than this are dropped on write
const RETENTION_DAYS: u64 = 62;

/// Monthly limits for a subscription tier; `None` means unlimited
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    #[serde(default)]
    pub monthly_token_limit: Option<u64>,
    #[serde(default)]
    pub monthly_cost_limit_usd: Option<f64>,
}

impl TierLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// Maps a user to their tier limits (backed by user storage in a full deployment)
pub trait TierResolver: Send + Sync {
    fn limits_for(&self, user_id: &str) -> TierLimits;
}

/// Tier resolution from the static `[tiers]` / `[users]` config tables
#[derive(Debug, Clone, Default)]
pub struct StaticTierResolver {
    tiers: HashMap<String, TierLimits>,
    default_tier: Option<String>,
    assignments: HashMap<String, String>,
}

impl StaticTierResolver {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            tiers: config.tiers.clone(),
            default_tier: config.users.default_tier.clone(),
            assignments: config.users.assignments.clone(),
        }
    }
}

impl TierResolver for StaticTierResolver {
    fn limits_for(&self, user_id: &str) -> TierLimits {
        self.assignments
            .get(user_id)
            .or(self.default_tier.as_ref())
            .and_then(|tier| self.tiers.get(tier))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
struct DayUsage {
    tokens: u64,
    cost_usd: f64,
    requests_by_provider: HashMap<String, u64>,
}

/// One user's day buckets, guarded by its own lock
#[derive(Debug, Default)]
struct UserLedger {
    days: Mutex<BTreeMap<NaiveDate, DayUsage>>,
}

/// Aggregated usage over a period
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    pub tokens: u64,
    pub cost_usd: f64,
    pub requests: u64,
    pub requests_by_provider: HashMap<String, u64>,
}

impl UsageSummary {
    fn add(&mut self, day: &DayUsage) {
        self.tokens = self.tokens.saturating_add(day.tokens);
        self.cost_usd += day.cost_usd;
        for (provider, count) in &day.requests_by_provider {
            self.requests += count;
            *self.requests_by_provider.entry(provider.clone()).or_insert(0) += count;
        }
    }
}

/// One stored row: a user's usage with one provider on one UTC day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub provider: String,
    pub day: NaiveDate,
    pub tokens: u64,
    pub cost_usd: f64,
    pub requests: u64,
}

/// Durable backing for a [`UsageLedger`]
pub trait LedgerStore: Send + Sync {
    /// Add a record to the stored totals for its (user, day, provider) row
    fn append(&self, record: &UsageRecord) -> Result<()>;

    /// Every row dated on or after `since`
    fn load_since(&self, since: NaiveDate) -> Result<Vec<UsageRecord>>;

    /// Drop rows dated before `before`
    fn prune_before(&self, before: NaiveDate) -> Result<()>;
}

/// Per-user, per-day usage counters
#[derive(Default)]
pub struct UsageLedger {
    users: RwLock<HashMap<String, Arc<UserLedger>>>,
    store: Option<Arc<dyn LedgerStore>>,
}

impl std::fmt::Debug for UsageLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let users = self.users.read().map(|u| u.len()).unwrap_or_default();
        f.debug_struct("UsageLedger")
            .field("users", &users)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger backed by `store`, pre-filled with its retained rows
    pub fn with_store(store: Arc<dyn LedgerStore>) -> Result<Self> {
        Self::with_store_at(store, Utc::now())
    }

    pub fn with_store_at(store: Arc<dyn LedgerStore>, now: DateTime<Utc>) -> Result<Self> {
        let today = now.date_naive();
        let horizon = today
            .checked_sub_days(Days::new(RETENTION_DAYS))
            .unwrap_or(NaiveDate::MIN);
        store.prune_before(horizon)?;
        let rows = store.load_since(horizon)?;

        let ledger = Self::new();
        for row in &rows {
            let user = ledger.user(&row.user_id);
            let mut days = lock_or_recover(&user.days);
            let day = days.entry(row.day).or_default();
            day.tokens = day.tokens.saturating_add(row.tokens);
            day.cost_usd += row.cost_usd;
            *day.requests_by_provider.entry(row.provider.clone()).or_insert(0) += row.requests;
        }
        info!("Loaded {} usage rows since {}", rows.len(), horizon);

        Ok(Self {
            store: Some(store),
            ..ledger
        })
    }

    fn user(&self, user_id: &str) -> Arc<UserLedger> {
        {
            let users = self.users.read().unwrap_or_else(|poisoned| {
                warn!("Usage ledger lock was poisoned, recovering");
                poisoned.into_inner()
            });
            if let Some(ledger) = users.get(user_id) {
                return ledger.clone();
            }
        }
        let mut users = self.users.write().unwrap_or_else(|poisoned| {
            warn!("Usage ledger lock was poisoned, recovering");
            poisoned.into_inner()
        });
        users.entry(user_id.to_string()).or_default().clone()
    }

    fn existing_user(&self, user_id: &str) -> Option<Arc<UserLedger>> {
        let users = self.users.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        users.get(user_id).cloned()
    }

    /// Record a successful call's usage in today's bucket
    pub fn record(&self, user_id: &str, provider: &str, tokens: u64, cost_usd: f64) {
        self.record_at(user_id, provider, tokens, cost_usd, Utc::now());
    }

    pub fn record_at(
        &self,
        user_id: &str,
        provider: &str,
        tokens: u64,
        cost_usd: f64,
        now: DateTime<Utc>,
    ) {
        let ledger = self.user(user_id);
        let today = now.date_naive();
        let cost_usd = if cost_usd.is_finite() && cost_usd > 0.0 {
            cost_usd
        } else {
            0.0
        };

        {
            let mut days = lock_or_recover(&ledger.days);
            let day = days.entry(today).or_default();
            day.tokens = day.tokens.saturating_add(tokens);
            day.cost_usd += cost_usd;
            *day.requests_by_provider.entry(provider.to_string()).or_insert(0) += 1;

            if let Some(horizon) = today.checked_sub_days(Days::new(RETENTION_DAYS)) {
                days.retain(|date, _| *date >= horizon);
            }
        }

        if let Some(store) = &self.store {
            let record = UsageRecord {
                user_id: user_id.to_string(),
                provider: provider.to_string(),
                day: today,
                tokens,
                cost_usd,
                requests: 1,
            };
            // The call was already served; a storage failure only loses durability
            if let Err(e) = store.append(&record) {
                warn!("Failed to persist usage for user {}: {}", user_id, e);
            }
        }

        debug!(
            "Recorded usage: user={} provider={} tokens={} cost=${:.6}",
            user_id, provider, tokens, cost_usd
        );
    }

    /// Fail with `QuotaExceeded` once the user's month-to-date usage exceeds a tier limit
    pub fn check_quota(&self, user_id: &str, limits: &TierLimits) -> Result<()> {
        self.check_quota_at(user_id, limits, Utc::now())
    }

    pub fn check_quota_at(
        &self,
        user_id: &str,
        limits: &TierLimits,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if limits.monthly_token_limit.is_none() && limits.monthly_cost_limit_usd.is_none() {
            return Ok(());
        }

        let month = self.monthly_usage_at(user_id, now);

        if let Some(limit) = limits.monthly_token_limit
            && month.tokens > limit
        {
            return Err(DispatchError::QuotaExceeded {
                user_id: user_id.to_string(),
                used_tokens: month.tokens,
                used_cost_usd: month.cost_usd,
                reason: format!("monthly token limit exceeded ({} of {})", month.tokens, limit),
            });
        }

        if let Some(limit) = limits.monthly_cost_limit_usd
            && month.cost_usd > limit
        {
            return Err(DispatchError::QuotaExceeded {
                user_id: user_id.to_string(),
                used_tokens: month.tokens,
                used_cost_usd: month.cost_usd,
                reason: format!(
                    "monthly cost limit exceeded (${:.4} of ${:.4})",
                    month.cost_usd, limit
                ),
            });
        }

        Ok(())
    }

    /// Usage for a single UTC day
    pub fn daily_usage(&self, user_id: &str, date: NaiveDate) -> UsageSummary {
        let mut summary = UsageSummary::default();
        if let Some(ledger) = self.existing_user(user_id) {
            let days = lock_or_recover(&ledger.days);
            if let Some(day) = days.get(&date) {
                summary.add(day);
            }
        }
        summary
    }

    /// Month-to-date usage for the UTC month containing `now`
    pub fn monthly_usage_at(&self, user_id: &str, now: DateTime<Utc>) -> UsageSummary {
        let mut summary = UsageSummary::default();
        let Some(ledger) = self.existing_user(user_id) else {
            return summary;
        };
        let today = now.date_naive();
        let month_start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);

        let days = lock_or_recover(&ledger.days);
        for (_, day) in days.range(month_start..=today) {
            summary.add(day);
        }
        summary
    }

    pub fn monthly_usage(&self, user_id: &str) -> UsageSummary {
        self.monthly_usage_at(user_id, Utc::now())
    }
}
