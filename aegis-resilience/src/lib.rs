//! # AEGIS Resilience Layer
//!
//! Fault isolation and spend control around every external dependency the
//! platform touches: model providers, the vector memory, the event sink,
//! and executor backends.
//!
//! - [`CircuitBreaker`] / [`BreakerRegistry`]: three-state fault isolation
//!   (CLOSED → OPEN → HALF_OPEN) with consecutive-failure and windowed
//!   failure-rate tripping, cooldown, and bounded half-open probing.
//! - [`TokenBucket`] / [`RateLimiterRegistry`]: token-bucket admission with
//!   priority lanes; lower priorities are shed first under saturation.
//! - [`BudgetEnvelope`]: hourly and daily spend caps with atomic
//!   reservation and rollback-on-drop, so budget-exceeding invocations fail
//!   fast and never complete.
//! - [`CostRouter`]: cost-aware selection among model tiers under the
//!   budget envelope, with explicit downgrade instead of silent fallback.
//! - [`Backoff`]: bounded exponential backoff with jitter for transient
//!   dependency errors.
//!
//! These are the only process-wide singletons besides the event store; they
//! are constructed once in the composition root and injected by handle.

mod breaker;
mod budget;
mod ratelimit;
mod retry;
mod router;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker, BreakerPermit};
pub use budget::{BudgetConfig, BudgetEnvelope, BudgetSnapshot, Reservation};
pub use ratelimit::{Priority, RateLimitConfig, RateLimiterRegistry, TokenBucket};
pub use retry::{retry, Backoff};
pub use router::{CostRouter, ModelTier, RoutedCall, TierProfile};

use thiserror::Error;

/// Structured failures from the resilience layer. Transient kinds are
/// retried with backoff by callers; budget denials are never retried.
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// The breaker for this dependency is open; fail fast and degrade.
    #[error("circuit open for dependency {dependency}")]
    CircuitOpen { dependency: String },

    /// The rate limiter could not grant tokens before the deadline.
    #[error("rate limit deadline exceeded for dependency {dependency}")]
    RateLimitTimeout { dependency: String },

    /// Shed under saturation because higher-priority traffic has reserve
    /// claim on the remaining tokens.
    #[error("request shed under saturation for dependency {dependency}")]
    Shed { dependency: String },

    /// The budget envelope refused the reservation. Not retryable; the
    /// caller emits a budget-denied event and may route cheaper next time.
    #[error("budget denied for tier {tier} (estimated cost {estimated_cost})")]
    BudgetDenied { tier: String, estimated_cost: f64 },
}
