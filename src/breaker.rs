//! Per-plugin circuit breakers
//!
//! Each plugin name gets its own breaker, created lazily on the first recorded
//! failure. A plugin that never fails has no entry and is always closed.
//!
//! # State machine
//!
//! - **Closed**: calls pass. Failures accumulate; reaching the threshold opens
//!   the breaker.
//! - **Open**: calls are rejected until `open_timeout` has elapsed since the
//!   last failure. There is no timer: the transition is evaluated when
//!   [`CircuitBreakerRegistry::is_open`] is asked.
//! - **HalfOpen**: exactly one trial call is let through. Its success closes
//!   the breaker and zeroes the count; its failure reopens it for another
//!   `open_timeout`.
//!
//! A success observed more than `failure_reset_window` after the last failure
//! also closes the breaker.

use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub failure_reset_window: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            failure_reset_window: Duration::from_secs(60),
        }
    }
}

impl From<&crate::config::BreakerConfig> for BreakerSettings {
    fn from(config: &crate::config::BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            open_timeout: config.open_timeout(),
            failure_reset_window: config.failure_reset_window(),
        }
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub plugin: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerEntry {
    failure_count: u32,
    last_failure: Instant,
    last_failure_at: DateTime<Utc>,
    state: BreakerState,
    // Set while a half-open trial is in flight
    trial_started: Option<Instant>,
}

impl BreakerEntry {
    fn new(now: Instant) -> Self {
        Self {
            failure_count: 0,
            last_failure: now,
            last_failure_at: Utc::now(),
            state: BreakerState::Closed,
            trial_started: None,
        }
    }

    fn reset(&mut self) {
        self.failure_count = 0;
        self.state = BreakerState::Closed;
        self.trial_started = None;
    }
}

pub struct CircuitBreakerRegistry {
    settings: BreakerSettings,
    breakers: DashMap<String, BreakerEntry>,
    metrics: Option<Arc<Metrics>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Whether calls to `plugin` must be rejected right now.
    ///
    /// Once the open timeout has elapsed this returns `false` for exactly one
    /// caller, which becomes the half-open trial. Later callers see `true`
    /// until the trial's outcome is recorded, or until the trial has been
    /// outstanding for a full open timeout without a verdict.
    pub fn is_open(&self, plugin: &str) -> bool {
        let Some(mut entry) = self.breakers.get_mut(plugin) else {
            return false;
        };
        let now = Instant::now();
        let state = entry.state;
        let trial_started = entry.trial_started;

        match state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                if now.duration_since(entry.last_failure) > self.settings.open_timeout {
                    entry.state = BreakerState::HalfOpen;
                    entry.trial_started = Some(now);
                    drop(entry);
                    info!(plugin = %plugin, "Circuit breaker half-open, allowing trial call");
                    false
                } else {
                    true
                }
            }
            BreakerState::HalfOpen => match trial_started {
                Some(started) if now.duration_since(started) <= self.settings.open_timeout => true,
                _ => {
                    entry.trial_started = Some(now);
                    drop(entry);
                    debug!(plugin = %plugin, "Previous half-open trial expired, allowing another");
                    false
                }
            },
        }
    }

    pub fn record_failure(&self, plugin: &str) {
        let now = Instant::now();
        let mut entry = self
            .breakers
            .entry(plugin.to_string())
            .or_insert_with(|| BreakerEntry::new(now));

        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.last_failure = now;
        entry.last_failure_at = Utc::now();

        let previous = entry.state;
        match previous {
            BreakerState::Closed if entry.failure_count >= self.settings.failure_threshold => {
                entry.state = BreakerState::Open;
            }
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Open;
                entry.trial_started = None;
            }
            _ => {}
        }
        let failure_count = entry.failure_count;
        let state = entry.state;
        drop(entry);

        match (previous, state) {
            (BreakerState::Closed, BreakerState::Open) => {
                warn!(
                    plugin = %plugin,
                    failure_count,
                    "Circuit breaker opened"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_breaker_trip();
                }
            }
            (BreakerState::HalfOpen, BreakerState::Open) => {
                warn!(
                    plugin = %plugin,
                    failure_count,
                    "Half-open trial failed, circuit breaker reopened"
                );
            }
            _ => {
                debug!(plugin = %plugin, failure_count, "Recorded plugin failure");
            }
        }
    }

    pub fn record_success(&self, plugin: &str) {
        let Some(mut entry) = self.breakers.get_mut(plugin) else {
            return;
        };
        let now = Instant::now();

        if entry.state == BreakerState::HalfOpen {
            entry.reset();
            drop(entry);
            info!(plugin = %plugin, "Half-open trial succeeded, circuit breaker closed");
            return;
        }

        if entry.failure_count > 0
            && now.duration_since(entry.last_failure) > self.settings.failure_reset_window
        {
            let was = entry.state;
            entry.reset();
            drop(entry);
            debug!(plugin = %plugin, previous = ?was, "Failure count reset after quiet period");
        }
    }

    /// Current state without side effects. An open breaker whose timeout has
    /// elapsed reports `HalfOpen`.
    pub fn state(&self, plugin: &str) -> BreakerState {
        let Some(entry) = self.breakers.get(plugin) else {
            return BreakerState::Closed;
        };
        match entry.state {
            BreakerState::Open
                if entry.last_failure.elapsed() > self.settings.open_timeout =>
            {
                BreakerState::HalfOpen
            }
            state => state,
        }
    }

    pub fn failure_count(&self, plugin: &str) -> u32 {
        self.breakers
            .get(plugin)
            .map(|entry| entry.failure_count)
            .unwrap_or(0)
    }

    pub fn snapshot(&self, plugin: &str) -> Option<BreakerSnapshot> {
        let state = self.state(plugin);
        self.breakers.get(plugin).map(|entry| BreakerSnapshot {
            plugin: plugin.to_string(),
            state,
            failure_count: entry.failure_count,
            last_failure_at: entry.last_failure_at,
        })
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names
            .iter()
            .filter_map(|name| self.snapshot(name))
            .collect()
    }
}
