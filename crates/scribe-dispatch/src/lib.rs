//! scribe-dispatch - Provider dispatch and fallback for writing assistance
//!
//! This crate provides:
//! - A provider adapter trait with OpenAI, Anthropic, and Google Gemini implementations
//! - Per-provider token-bucket rate limiting
//! - Rolling-window health tracking with cooldown and probing
//! - A per-user, per-day usage ledger with monthly tier quotas, persisted to SQLite
//! - A dispatcher that walks an ordered candidate list until one provider succeeds

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod features;
pub mod health;
pub mod providers;
pub mod rate_limit;
pub mod store;
pub mod types;
pub mod usage;

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

// Re-export main types for convenience
pub use config::{DispatchConfig, DispatchSettings, FallbackPolicy, ProviderDescriptor, ProviderKind};
pub use dispatcher::{Dispatcher, ProviderInfo};
pub use error::{CandidateFailure, DispatchError, FailureReason};
pub use health::{HealthSnapshot, HealthTracker};
pub use providers::{FailureKind, Generation, ProviderAdapter, ProviderError};
pub use rate_limit::RateLimiter;
pub use store::SqliteLedgerStore;
pub use types::{EnhancementRequest, EnhancementResponse};
pub use usage::{
    LedgerStore, StaticTierResolver, TierLimits, TierResolver, UsageLedger, UsageRecord,
    UsageSummary,
};

/// Lock a mutex, recovering the inner value if a previous holder panicked
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}
