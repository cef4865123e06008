//! Rolling-window provider health
//!
//! A provider whose failure ratio over the last `window` outcomes exceeds
//! the threshold is tripped and skipped for new traffic. Once the cooldown
//! has elapsed it becomes eligible again for a probe; a successful call
//! clears the window and rejoins the provider, a failed one restarts the
//! cooldown.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::DispatchSettings;
use crate::lock_or_recover;

#[derive(Debug, Clone, Copy)]
struct Outcome {
    success: bool,
    at: Instant,
}

#[derive(Debug, Default)]
struct HealthState {
    outcomes: VecDeque<Outcome>,
    tripped_at: Option<Instant>,
}

impl HealthState {
    fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }

    fn failure_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.failures() as f64 / self.outcomes.len() as f64
        }
    }
}

/// Point-in-time view of one provider's health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub samples: usize,
    pub failures: usize,
    pub failure_ratio: f64,
    pub tripped: bool,
    pub eligible: bool,
    /// Milliseconds since the most recent recorded outcome
    pub last_outcome_ms_ago: Option<u64>,
}

/// Tracks recent outcomes for every provider
#[derive(Debug)]
pub struct HealthTracker {
    window: usize,
    failure_threshold: f64,
    cooldown: Duration,
    states: RwLock<HashMap<String, Arc<Mutex<HealthState>>>>,
}

impl HealthTracker {
    pub fn new(window: usize, failure_threshold: f64, cooldown: Duration) -> Self {
        Self {
            window: window.max(1),
            failure_threshold,
            cooldown,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &DispatchSettings) -> Self {
        Self::new(
            settings.health_window,
            settings.health_failure_threshold,
            settings.health_cooldown(),
        )
    }

    fn state(&self, provider: &str) -> Arc<Mutex<HealthState>> {
        {
            let states = self.states.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(state) = states.get(provider) {
                return state.clone();
            }
        }
        let mut states = self.states.write().unwrap_or_else(|poisoned| {
            warn!("Health tracker lock was poisoned, recovering");
            poisoned.into_inner()
        });
        states.entry(provider.to_string()).or_default().clone()
    }

    fn existing(&self, provider: &str) -> Option<Arc<Mutex<HealthState>>> {
        let states = self.states.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        states.get(provider).cloned()
    }

    /// Record the outcome of a call to `provider`
    pub fn record_outcome(&self, provider: &str, success: bool) {
        let state = self.state(provider);
        let mut state = lock_or_recover(&state);
        let now = Instant::now();

        if success && state.tripped_at.is_some() {
            info!("Provider {} recovered, rejoining rotation", provider);
            state.outcomes.clear();
            state.tripped_at = None;
        }

        state.outcomes.push_back(Outcome { success, at: now });
        while state.outcomes.len() > self.window {
            state.outcomes.pop_front();
        }

        if !success && state.failure_ratio() > self.failure_threshold {
            if state.tripped_at.is_none() {
                warn!(
                    "Provider {} marked unhealthy ({}/{} recent calls failed), cooling down for {:?}",
                    provider,
                    state.failures(),
                    state.outcomes.len(),
                    self.cooldown
                );
            }
            state.tripped_at = Some(now);
        }
    }

    fn eligible(&self, state: &HealthState) -> bool {
        match state.tripped_at {
            None => true,
            Some(at) => at.elapsed() >= self.cooldown,
        }
    }

    /// Whether new traffic may be sent to `provider`
    pub fn is_eligible(&self, provider: &str) -> bool {
        let Some(state) = self.existing(provider) else {
            return true;
        };
        let state = lock_or_recover(&state);
        self.eligible(&state)
    }

    /// Whether `provider` has been tripped and not yet recovered
    pub fn is_tripped(&self, provider: &str) -> bool {
        let Some(state) = self.existing(provider) else {
            return false;
        };
        let tripped = lock_or_recover(&state).tripped_at.is_some();
        tripped
    }

    pub fn snapshot(&self, provider: &str) -> HealthSnapshot {
        match self.existing(provider) {
            Some(state) => {
                let state = lock_or_recover(&state);
                HealthSnapshot {
                    samples: state.outcomes.len(),
                    failures: state.failures(),
                    failure_ratio: state.failure_ratio(),
                    tripped: state.tripped_at.is_some(),
                    eligible: self.eligible(&state),
                    last_outcome_ms_ago: state
                        .outcomes
                        .back()
                        .map(|o| o.at.elapsed().as_millis() as u64),
                }
            }
            None => HealthSnapshot {
                samples: 0,
                failures: 0,
                failure_ratio: 0.0,
                tripped: false,
                eligible: true,
                last_outcome_ms_ago: None,
            },
        }
    }
}
