//! Token-bucket rate limiting with priority lanes.
//!
//! Each external dependency gets its own bucket. Under saturation, lower
//! priorities are shed first: every lane except `Critical` keeps a reserve
//! floor of tokens it will not draw below, leaving headroom for the lanes
//! above it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::ResilienceError;

/// Admission priority. Lower lanes are shed first under saturation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Fraction of the burst capacity this lane must leave untouched.
    fn reserve_floor(self) -> f64 {
        match self {
            Priority::Normal => 0.25,
            Priority::High => 0.10,
            Priority::Critical => 0.0,
        }
    }
}

/// Per-dependency limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained refill rate, tokens per second.
    pub rps: f64,
    /// Bucket capacity (burst allowance).
    pub burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { rps: 10.0, burst: 20.0 }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// One token bucket guarding one external dependency.
pub struct TokenBucket {
    dependency: String,
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(dependency: &str, config: RateLimitConfig) -> Self {
        let tokens = config.burst;
        Self {
            dependency: dependency.to_string(),
            config,
            state: Mutex::new(BucketState {
                tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Acquire `cost` tokens before `deadline` elapses.
    ///
    /// Returns `Shed` immediately when the lane's reserve floor makes the
    /// request unservable right now and the bucket is saturated enough
    /// that waiting would starve higher lanes; returns `RateLimitTimeout`
    /// when the refill needed does not fit the deadline.
    pub async fn acquire(
        &self,
        cost: f64,
        priority: Priority,
        deadline: Duration,
    ) -> Result<(), ResilienceError> {
        let started = Instant::now();
        let floor = self.config.burst * priority.reserve_floor();

        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);

                if state.tokens - cost >= floor {
                    state.tokens -= cost;
                    return Ok(());
                }

                // Tokens needed before this lane can draw without dipping
                // under its floor.
                let deficit = (cost + floor) - state.tokens;
                Duration::from_secs_f64(deficit / self.config.rps)
            };

            if priority == Priority::Normal && wait > deadline {
                debug!(dependency = %self.dependency, "shedding normal-priority request");
                return Err(ResilienceError::Shed {
                    dependency: self.dependency.clone(),
                });
            }
            if started.elapsed() + wait > deadline {
                return Err(ResilienceError::RateLimitTimeout {
                    dependency: self.dependency.clone(),
                });
            }

            tokio::time::sleep(wait.min(Duration::from_millis(50))).await;
        }
    }

    /// Tokens currently available, for health snapshots.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.rps).min(self.config.burst);
        state.last_refill = now;
    }
}

/// Registry of token buckets keyed by dependency name.
pub struct RateLimiterRegistry {
    default_config: RateLimitConfig,
    overrides: DashMap<String, RateLimitConfig>,
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl RateLimiterRegistry {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            overrides: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    /// Install a per-dependency configuration; takes effect for buckets
    /// created after this call.
    pub fn configure(&self, dependency: &str, config: RateLimitConfig) {
        self.overrides.insert(dependency.to_string(), config);
    }

    pub fn get(&self, dependency: &str) -> Arc<TokenBucket> {
        self.buckets
            .entry(dependency.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(dependency)
                    .map(|c| c.clone())
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(TokenBucket::new(dependency, config))
            })
            .clone()
    }
}
