//! # AEGIS Agent Runtime
//!
//! Hosts the five specialist agent roles — Detection, Diagnosis,
//! Prediction, Resolution, Communication — as independent concurrent
//! workers over bounded, typed job queues. Each worker consumes analysis
//! jobs and produces signed, size-bounded [`Recommendation`]s for the
//! consensus engine.
//!
//! Every external call an agent makes goes through the resilience layer:
//! circuit breaker, then rate limiter, then the cost router's budget
//! reservation, with schema validation of model responses at the boundary.
//! When a dependency is open or the budget refuses, agents degrade to
//! explicit low-confidence placeholders; they never silently fall back.
//!
//! Agent reputation lives in the [`AgentRegistry`], adjusted by an injected
//! pure [`ReputationModel`] and feeding quarantine decisions made jointly
//! by the consensus engine and the meta-health monitor.

mod communication;
mod detection;
mod diagnosis;
mod interfaces;
mod invoke;
mod prediction;
mod registry;
mod resolution;
mod runtime;
mod types;

pub use communication::CommunicationAgent;
pub use detection::{DetectionAgent, DetectionConfig, StormSummary};
pub use diagnosis::{DependencyGraph, DiagnosisAgent, DiagnosisConfig};
pub use interfaces::{
    ChannelTelemetrySource, DeliveryStatus, InvocationResult, MemoryError, MemoryHit,
    ModelError, ModelInvoker, NotificationChannel, NotifyError, RecordingChannel,
    ScriptedModelInvoker, SignalDeduper, StaticModelInvoker, StaticVectorMemory,
    TelemetrySignal, TelemetrySource, VectorMemory,
};
pub use invoke::{DegradeReason, GuardedInvoker, GuardedOutcome};
pub use prediction::{PredictionAgent, PredictionConfig};
pub use registry::{
    AgentProfile, AgentRegistry, LinearReputation, ReputationModel, ReputationSignal,
};
pub use resolution::ResolutionAgent;
pub use runtime::{AgentJob, AgentRuntime, AnalysisContext, ChaosProfile, ChaosRegistry};
pub use types::{AgentId, AgentRole, AgentState, ProposedAction, Recommendation};

use thiserror::Error;

/// Maximum canonical size of a recommendation; oversize payloads are
/// rejected before signing.
pub const MAX_RECOMMENDATION_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("recommendation payload of {bytes} bytes exceeds the {limit}-byte bound")]
    Oversized { bytes: usize, limit: usize },

    #[error("identity error: {0}")]
    Identity(#[from] aegis_identity::IdentityError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("agent job queue closed")]
    ChannelClosed,
}
