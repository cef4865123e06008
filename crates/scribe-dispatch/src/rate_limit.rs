//! Per-provider token-bucket rate limiting
//!
//! `try_acquire` never waits: an empty bucket means "skip to the next
//! candidate", since another provider may be free right now.
//!
//! The bucket refills continuously, which on its own would let a full bucket
//! plus a window's worth of refill through in one window. Each bucket also
//! keeps the instants of its recent grants, so no rolling window ever holds
//! more than `rate_limit` acquisitions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::DispatchConfig;
use crate::lock_or_recover;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    window: Duration,
    grants: VecDeque<Instant>,
}

impl TokenBucket {
    fn new(capacity: u32, window: Duration) -> Self {
        let limit = capacity as usize;
        let capacity = capacity as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(f64::EPSILON),
            last_refill: Instant::now(),
            window,
            grants: VecDeque::with_capacity(limit),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        while let Some(oldest) = self.grants.front() {
            if now.duration_since(*oldest) >= self.window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    /// Grants still allowed in the current rolling window
    fn window_headroom(&self) -> f64 {
        (self.capacity - self.grants.len() as f64).max(0.0)
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 && self.window_headroom() >= 1.0 {
            self.tokens -= 1.0;
            self.grants.push_back(self.last_refill);
            true
        } else {
            false
        }
    }
}

/// One bucket per provider, each behind its own lock
#[derive(Debug)]
pub struct RateLimiter {
    buckets: HashMap<String, Mutex<TokenBucket>>,
}

impl RateLimiter {
    /// Build buckets from `(provider, requests per window)` pairs
    pub fn new<I, S>(limits: I, window: Duration) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let buckets = limits
            .into_iter()
            .map(|(id, limit)| (id.into(), Mutex::new(TokenBucket::new(limit, window))))
            .collect();
        Self { buckets }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            config
                .providers
                .iter()
                .map(|(id, p)| (id.clone(), p.rate_limit)),
            config.dispatch.rate_limit_window(),
        )
    }

    /// Take one token for `provider`; false if the bucket is empty or unknown
    pub fn try_acquire(&self, provider: &str) -> bool {
        match self.buckets.get(provider) {
            Some(bucket) => lock_or_recover(bucket).try_consume(),
            None => false,
        }
    }

    /// Acquisitions currently possible, after refill and window expiry
    pub fn available(&self, provider: &str) -> Option<f64> {
        self.buckets.get(provider).map(|bucket| {
            let mut bucket = lock_or_recover(bucket);
            bucket.refill();
            bucket.tokens.min(bucket.window_headroom())
        })
    }
}
