//! Agent identities, roles, and the recommendation type they all produce.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aegis_events::{canonical_bytes, ActionPlan, EvidenceRef, IncidentId, RecommendationDigest, Severity};

/// The five specialist roles of the agent fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AgentRole {
    Detection,
    Diagnosis,
    Prediction,
    Resolution,
    Communication,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Detection => "detection",
            AgentRole::Diagnosis => "diagnosis",
            AgentRole::Prediction => "prediction",
            AgentRole::Resolution => "resolution",
            AgentRole::Communication => "communication",
        }
    }

    pub fn all() -> [AgentRole; 5] {
        [
            AgentRole::Detection,
            AgentRole::Diagnosis,
            AgentRole::Prediction,
            AgentRole::Resolution,
            AgentRole::Communication,
        ]
    }
}

/// Agent identity: role plus instance number. The derived ordering is the
/// stable order used for primary rotation in consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId {
    pub role: AgentRole,
    pub instance: u32,
}

impl AgentId {
    pub fn new(role: AgentRole, instance: u32) -> Self {
        Self { role, instance }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.role.as_str(), self.instance)
    }
}

/// Lifecycle state of an agent. Quarantined agents' messages are rejected
/// at consensus ingress; quarantine is a state transition, never an
/// exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Healthy,
    Probation,
    Quarantined,
    Dead,
}

/// Role-dependent action proposed by a recommendation. The consensus vote
/// aggregates over [`key`] values.
///
/// [`key`]: ProposedAction::key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProposedAction {
    /// Detection: severity classification for the incident.
    ClassifySeverity { severity: Severity, rationale: String },
    /// Diagnosis: root-cause hypothesis.
    RootCause { component: String, hypothesis: String },
    /// Prediction: preventive measure against a forecast cascade.
    Prevent { measure: String, cascade_probability: f64 },
    /// Resolution (and endorsements from other roles): execute this plan.
    ExecutePlan { plan: ActionPlan },
    /// Communication: stakeholder notification intent.
    Notify { audience: String, stage: String },
}

impl ProposedAction {
    /// Stable aggregation key for the weighted consensus vote. Identical
    /// plans share a key regardless of which agent proposed them.
    pub fn key(&self) -> String {
        match self {
            ProposedAction::ClassifySeverity { severity, .. } => {
                format!("severity:{severity:?}")
            }
            ProposedAction::RootCause { component, .. } => format!("cause:{component}"),
            ProposedAction::Prevent { measure, .. } => format!("prevent:{measure}"),
            ProposedAction::ExecutePlan { plan } => format!("plan:{}", plan.digest()),
            ProposedAction::Notify { audience, stage } => format!("notify:{audience}:{stage}"),
        }
    }

    /// The remediation plan, for actions that carry one.
    pub fn plan(&self) -> Option<&ActionPlan> {
        match self {
            ProposedAction::ExecutePlan { plan } => Some(plan),
            _ => None,
        }
    }
}

/// A signed, immutable recommendation for one (incident, round).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub incident_id: IncidentId,
    pub round: u64,
    pub confidence: f64,
    pub action: ProposedAction,
    pub evidence: Vec<EvidenceRef>,
    pub reasoning: String,
    pub submitted_at: DateTime<Utc>,
    pub signature: String,
}

impl Recommendation {
    /// Canonical bytes bound by the agent signature (everything except the
    /// signature itself).
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        canonical_bytes(&unsigned).expect("recommendation serialization is infallible")
    }

    /// Canonical encoded size, checked against the size bound.
    pub fn encoded_len(&self) -> usize {
        canonical_bytes(self)
            .map(|b| b.len())
            .unwrap_or(usize::MAX)
    }

    pub fn action_key(&self) -> String {
        self.action.key()
    }

    /// Compressed form retained inside committed decisions.
    pub fn digest(&self) -> RecommendationDigest {
        RecommendationDigest {
            agent_id: self.agent_id.to_string(),
            confidence: self.confidence,
            action_key: self.action_key(),
            summary: self.reasoning.chars().take(240).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn agent_ordering_is_stable_by_role_then_instance() {
        let mut ids = vec![
            AgentId::new(AgentRole::Resolution, 0),
            AgentId::new(AgentRole::Detection, 1),
            AgentId::new(AgentRole::Detection, 0),
            AgentId::new(AgentRole::Diagnosis, 0),
        ];
        ids.sort();
        assert_eq!(
            ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
            vec!["detection-0", "detection-1", "diagnosis-0", "resolution-0"]
        );
    }

    #[test]
    fn identical_plans_share_an_action_key() {
        let plan = ActionPlan {
            plan_id: Uuid::nil(),
            summary: "restart the ingest service".into(),
            steps: vec![aegis_events::ActionStep {
                name: "restart_service".into(),
                target: "ingest".into(),
                params: BTreeMap::new(),
                reversal: None,
                success_criteria: vec![],
            }],
        };
        let a = ProposedAction::ExecutePlan { plan: plan.clone() };
        let b = ProposedAction::ExecutePlan { plan };
        assert_eq!(a.key(), b.key());
        assert_ne!(
            a.key(),
            ProposedAction::Notify { audience: "oncall".into(), stage: "decision".into() }.key()
        );
    }

    #[test]
    fn signable_bytes_exclude_the_signature() {
        let rec = Recommendation {
            id: Uuid::nil(),
            agent_id: AgentId::new(AgentRole::Detection, 0),
            incident_id: IncidentId::new(),
            round: 1,
            confidence: 0.8,
            action: ProposedAction::ClassifySeverity {
                severity: Severity::High,
                rationale: "error rate spike".into(),
            },
            evidence: vec![],
            reasoning: "correlated across 3 sources".into(),
            submitted_at: Utc::now(),
            signature: String::new(),
        };

        let unsigned = rec.signable_bytes();
        let mut signed = rec;
        signed.signature = "deadbeef".into();
        assert_eq!(unsigned, signed.signable_bytes());
    }
}
