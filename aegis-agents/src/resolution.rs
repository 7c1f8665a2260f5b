//! Resolution agent: remediation plan proposals.
//!
//! Plans come from a playbook keyed on the diagnosed root cause. Every
//! step either declares its reversal or is knowingly irreversible. This
//! agent only proposes; execution belongs to the resolution executor after
//! consensus commits.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use aegis_events::{ActionPlan, ActionStep, EvidenceRef, IncidentId, MetricGate, ReversalStep};
use aegis_identity::IdentityService;

use crate::types::{AgentId, ProposedAction, Recommendation};
use crate::AgentError;

pub struct ResolutionAgent {
    id: AgentId,
    identity: Arc<IdentityService>,
}

impl ResolutionAgent {
    pub fn new(id: AgentId, identity: Arc<IdentityService>) -> Self {
        Self { id, identity }
    }

    /// Endorse a plan already on the table for this round (normally this
    /// agent's own earlier proposal).
    pub fn endorse(
        &self,
        incident_id: IncidentId,
        round: u64,
        plan: &ActionPlan,
    ) -> Result<Recommendation, AgentError> {
        let mut recommendation = Recommendation {
            id: Uuid::new_v4(),
            agent_id: self.id,
            incident_id,
            round,
            confidence: 0.8,
            action: ProposedAction::ExecutePlan { plan: plan.clone() },
            evidence: vec![EvidenceRef::Event {
                incident_id,
                version: 0,
            }],
            reasoning: format!("standing by proposed plan '{}'", plan.summary),
            submitted_at: Utc::now(),
            signature: String::new(),
        };
        recommendation.signature = self
            .identity
            .sign(&self.id.to_string(), &recommendation.signable_bytes())?;
        Ok(recommendation)
    }

    /// Build a remediation plan for the diagnosed root cause and wrap it
    /// in a signed recommendation.
    pub fn propose(
        &self,
        incident_id: IncidentId,
        round: u64,
        root_cause_component: &str,
        hypothesis: &str,
    ) -> Result<Recommendation, AgentError> {
        let plan = playbook_plan(root_cause_component, hypothesis);
        let confidence = if plan.steps.len() > 1 { 0.8 } else { 0.65 };

        let mut recommendation = Recommendation {
            id: Uuid::new_v4(),
            agent_id: self.id,
            incident_id,
            round,
            confidence,
            action: ProposedAction::ExecutePlan { plan },
            evidence: vec![EvidenceRef::Event {
                incident_id,
                version: 0,
            }],
            reasoning: format!("playbook match for {root_cause_component}: {hypothesis}"),
            submitted_at: Utc::now(),
            signature: String::new(),
        };

        let bytes = recommendation.encoded_len();
        if bytes > crate::MAX_RECOMMENDATION_BYTES {
            return Err(AgentError::Oversized {
                bytes,
                limit: crate::MAX_RECOMMENDATION_BYTES,
            });
        }
        recommendation.signature = self
            .identity
            .sign(&self.id.to_string(), &recommendation.signable_bytes())?;
        Ok(recommendation)
    }
}

/// Playbook: remediation plan per root-cause family.
fn playbook_plan(component: &str, hypothesis: &str) -> ActionPlan {
    let lower = format!("{component} {hypothesis}").to_lowercase();

    let steps = if lower.contains("db") || lower.contains("database") || lower.contains("pool") {
        vec![
            // Killing a query cannot be undone, only observed.
            ActionStep {
                name: "kill_query".to_string(),
                target: component.to_string(),
                params: BTreeMap::from([("selector".to_string(), "longest_running".to_string())]),
                reversal: None,
                success_criteria: vec![MetricGate {
                    metric: "active_queries".to_string(),
                    max: Some(50.0),
                    min: None,
                }],
            },
            ActionStep {
                name: "scale_pool".to_string(),
                target: component.to_string(),
                params: BTreeMap::from([("delta".to_string(), "20".to_string())]),
                reversal: Some(ReversalStep {
                    name: "scale_pool".to_string(),
                    target: component.to_string(),
                    params: BTreeMap::from([("delta".to_string(), "-20".to_string())]),
                }),
                success_criteria: vec![MetricGate {
                    metric: "connection_pool_util".to_string(),
                    max: Some(0.85),
                    min: None,
                }],
            },
        ]
    } else if lower.contains("deploy") || lower.contains("release") {
        vec![ActionStep {
            name: "rollback_deploy".to_string(),
            target: component.to_string(),
            params: BTreeMap::from([("to".to_string(), "previous".to_string())]),
            reversal: Some(ReversalStep {
                name: "roll_forward".to_string(),
                target: component.to_string(),
                params: BTreeMap::from([("to".to_string(), "current".to_string())]),
            }),
            success_criteria: vec![MetricGate {
                metric: "error_rate".to_string(),
                max: Some(0.05),
                min: None,
            }],
        }]
    } else if lower.contains("storage") || lower.contains("disk") || lower.contains("volume") {
        vec![ActionStep {
            name: "expand_volume".to_string(),
            target: component.to_string(),
            params: BTreeMap::from([("delta_gb".to_string(), "100".to_string())]),
            reversal: None,
            success_criteria: vec![MetricGate {
                metric: "disk_util".to_string(),
                max: Some(0.8),
                min: None,
            }],
        }]
    } else {
        vec![ActionStep {
            name: "restart_service".to_string(),
            target: component.to_string(),
            params: BTreeMap::new(),
            reversal: Some(ReversalStep {
                name: "noop".to_string(),
                target: component.to_string(),
                params: BTreeMap::new(),
            }),
            success_criteria: vec![MetricGate {
                metric: "error_rate".to_string(),
                max: Some(0.05),
                min: None,
            }],
        }]
    };

    ActionPlan {
        plan_id: Uuid::new_v4(),
        summary: format!("remediate {component}"),
        steps,
    }
}
