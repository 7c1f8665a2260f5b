//! # AEGIS Resolution Executor
//!
//! Turns committed decisions into real changes under zero-trust
//! constraints. Every plan runs the sandbox first, passes a safety gate,
//! then executes step by step in production with per-step verification and
//! audit events. A regression watch follows completion; on regression the
//! applied steps are reversed in reverse order, and a rollback that itself
//! fails hands the incident to a human.
//!
//! Execution is gated on a durable `DECISION_COMMITTED` event whose plan
//! matches — nothing runs on the executor's say-so alone. All backend
//! operations run under a just-in-time credential scope whose TTL ends at
//! the observation-window boundary.

mod backend;
mod executor;

pub use backend::{
    CredentialHandle, ExecutorBackend, MockExecutorBackend, StepMetrics, StepResult,
};
pub use executor::{ExecutionOutcome, ExecutorConfig, ResolutionExecutor};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// No durable committed decision matches the plan; execution refused.
    #[error("no committed decision matches plan {0}")]
    NoCommittedDecision(String),

    #[error("credential scope expired before the plan finished")]
    CredentialExpired,

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("event store error: {0}")]
    Store(#[from] aegis_events::EventStoreError),
}
