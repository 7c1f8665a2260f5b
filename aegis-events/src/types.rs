//! Core event and remediation-plan types shared across the platform.
//!
//! Event payloads are tagged sums with fixed records per kind; free-form
//! dictionaries are deliberately absent so that canonical serialization and
//! hashing are stable across implementations.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique incident identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IncidentId(pub Uuid);

impl IncidentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IncidentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Incident severity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// Reference from a recommendation to the evidence backing it. Dangling
/// references are a Byzantine indicator at consensus ingress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvidenceRef {
    /// A committed event in some incident stream.
    Event { incident_id: IncidentId, version: u64 },
    /// An entry in the historical pattern memory.
    Memory { entry_id: String },
    /// A raw telemetry signal.
    Telemetry { signal_id: String },
}

/// Threshold gate over an observed metric, used for sandbox safety gates,
/// per-step verification, and regression watching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricGate {
    pub metric: String,
    /// Gate fails when the observed value exceeds this bound.
    pub max: Option<f64>,
    /// Gate fails when the observed value falls below this bound.
    pub min: Option<f64>,
}

impl MetricGate {
    pub fn admits(&self, value: f64) -> bool {
        if let Some(max) = self.max {
            if value > max {
                return false;
            }
        }
        if let Some(min) = self.min {
            if value < min {
                return false;
            }
        }
        true
    }
}

/// The declared inverse of an action step, applied during rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReversalStep {
    pub name: String,
    pub target: String,
    pub params: BTreeMap<String, String>,
}

/// One step of a remediation plan. A step without a reversal is
/// irreversible and is recorded as such if a rollback passes over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub name: String,
    pub target: String,
    pub params: BTreeMap<String, String>,
    pub reversal: Option<ReversalStep>,
    pub success_criteria: Vec<MetricGate>,
}

/// An ordered remediation plan proposed by the resolution agent and, once
/// committed by consensus, executed by the resolution executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub plan_id: Uuid,
    pub summary: String,
    pub steps: Vec<ActionStep>,
}

impl ActionPlan {
    /// Stable digest over the plan's canonical bytes; the key under which
    /// consensus votes aggregate.
    pub fn digest(&self) -> String {
        let bytes = crate::canonical::canonical_bytes(self)
            .expect("action plan serialization is infallible");
        blake3::hash(&bytes).to_hex().to_string()
    }
}

/// Compressed view of a recommendation retained inside a committed decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationDigest {
    pub agent_id: String,
    pub confidence: f64,
    pub action_key: String,
    pub summary: String,
}

/// One signed commit-phase message retained as part of a quorum proof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumVote {
    pub agent_id: String,
    pub view: u64,
    pub signed_at: DateTime<Utc>,
    pub signature: String,
}

/// The committed outcome of a consensus round, embedded in the
/// `DecisionCommitted` event together with its quorum proof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub round: u64,
    pub view: u64,
    pub plan: ActionPlan,
    pub aggregate_confidence: f64,
    pub contributing: Vec<RecommendationDigest>,
    pub dissenting: Vec<RecommendationDigest>,
    pub quorum: Vec<QuorumVote>,
}

/// Tagged event payloads. Every variant is a fixed record; the event kind
/// is derived from the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    Created {
        severity: Severity,
        tier: u8,
        source: String,
        title: String,
        /// 0 for ordinary incidents; >0 for meta-incidents about the
        /// platform itself.
        meta_depth: u32,
    },
    AgentJoined {
        agent_id: String,
        role: String,
    },
    RecommendationSubmitted {
        agent_id: String,
        round: u64,
        confidence: f64,
        action_key: String,
        summary: String,
    },
    ConsensusPhase {
        round: u64,
        view: u64,
        phase: String,
    },
    DecisionCommitted {
        decision: DecisionRecord,
    },
    InsufficientQuorum {
        round: u64,
        available: usize,
        required: usize,
    },
    ActionExecuted {
        round: u64,
        step_index: usize,
        step_name: String,
        target: String,
        verified: bool,
    },
    SandboxRejected {
        round: u64,
        violations: Vec<String>,
    },
    Rollback {
        step_index: usize,
        step_name: String,
        reversed: bool,
        irreversible: bool,
        error: Option<String>,
    },
    Resolved {
        round: u64,
        summary: String,
    },
    Failed {
        reason: String,
        human_takeover: bool,
    },
    MetaIncident {
        subject: String,
        reason: String,
        depth: u32,
    },
    BudgetDenied {
        dependency: String,
        tier: String,
        estimated_cost: f64,
    },
    Degraded {
        dependency: String,
        reason: String,
    },
    Timeout {
        stage: String,
    },
    Cancelled {
        stage: String,
    },
    Quarantine {
        agent_id: String,
        reason: String,
        durable: bool,
    },
    HumanTakeoverRequired {
        reason: String,
    },
}

/// Event kind discriminant, derived from the payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    AgentJoined,
    RecommendationSubmitted,
    ConsensusPhase,
    DecisionCommitted,
    InsufficientQuorum,
    ActionExecuted,
    SandboxRejected,
    Rollback,
    Resolved,
    Failed,
    MetaIncident,
    BudgetDenied,
    Degraded,
    Timeout,
    Cancelled,
    Quarantine,
    HumanTakeoverRequired,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Created { .. } => EventKind::Created,
            EventPayload::AgentJoined { .. } => EventKind::AgentJoined,
            EventPayload::RecommendationSubmitted { .. } => EventKind::RecommendationSubmitted,
            EventPayload::ConsensusPhase { .. } => EventKind::ConsensusPhase,
            EventPayload::DecisionCommitted { .. } => EventKind::DecisionCommitted,
            EventPayload::InsufficientQuorum { .. } => EventKind::InsufficientQuorum,
            EventPayload::ActionExecuted { .. } => EventKind::ActionExecuted,
            EventPayload::SandboxRejected { .. } => EventKind::SandboxRejected,
            EventPayload::Rollback { .. } => EventKind::Rollback,
            EventPayload::Resolved { .. } => EventKind::Resolved,
            EventPayload::Failed { .. } => EventKind::Failed,
            EventPayload::MetaIncident { .. } => EventKind::MetaIncident,
            EventPayload::BudgetDenied { .. } => EventKind::BudgetDenied,
            EventPayload::Degraded { .. } => EventKind::Degraded,
            EventPayload::Timeout { .. } => EventKind::Timeout,
            EventPayload::Cancelled { .. } => EventKind::Cancelled,
            EventPayload::Quarantine { .. } => EventKind::Quarantine,
            EventPayload::HumanTakeoverRequired { .. } => EventKind::HumanTakeoverRequired,
        }
    }
}

/// A single committed record in an incident stream. Immutable once
/// appended; hashes and the signature are computed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub incident_id: IncidentId,
    pub version: u64,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
    pub producer: String,
    pub content_hash: String,
    pub chain_hash: String,
    pub signature: String,
}

impl IncidentEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// The bytes bound by the producer signature. Signing the chain hash
    /// transitively signs the payload and the entire stream prefix.
    pub fn signable_bytes(&self) -> Vec<u8> {
        format!("{}:{}:{}", self.incident_id, self.version, self.chain_hash).into_bytes()
    }
}
