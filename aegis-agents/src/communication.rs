//! Communication agent: stakeholder notifications for committed decisions
//! and resolutions, de-duplicated by (incident, stage).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use aegis_events::{EventPayload, EvidenceRef, IncidentEvent, IncidentId};
use aegis_identity::IdentityService;

use crate::interfaces::{DeliveryStatus, NotificationChannel};
use crate::types::{AgentId, ProposedAction, Recommendation};
use crate::AgentError;

pub struct CommunicationAgent {
    id: AgentId,
    identity: Arc<IdentityService>,
    channel: Arc<dyn NotificationChannel>,
    channel_id: String,
    sent: Mutex<HashSet<(IncidentId, String)>>,
}

impl CommunicationAgent {
    pub fn new(
        id: AgentId,
        identity: Arc<IdentityService>,
        channel: Arc<dyn NotificationChannel>,
        channel_id: &str,
    ) -> Self {
        Self {
            id,
            identity,
            channel,
            channel_id: channel_id.to_string(),
            sent: Mutex::new(HashSet::new()),
        }
    }

    /// React to a committed event: decision commits and resolutions become
    /// stakeholder notifications, once per (incident, stage).
    pub async fn on_event(&self, event: &IncidentEvent) -> Option<DeliveryStatus> {
        let (stage, payload) = match &event.payload {
            EventPayload::DecisionCommitted { decision } => (
                "decision",
                json!({
                    "incident": event.incident_id.to_string(),
                    "stage": "decision",
                    "plan": decision.plan.summary,
                    "confidence": decision.aggregate_confidence,
                    "round": decision.round,
                }),
            ),
            EventPayload::Resolved { round, summary } => (
                "resolved",
                json!({
                    "incident": event.incident_id.to_string(),
                    "stage": "resolved",
                    "round": round,
                    "summary": summary,
                }),
            ),
            EventPayload::Failed { reason, human_takeover } => (
                "failed",
                json!({
                    "incident": event.incident_id.to_string(),
                    "stage": "failed",
                    "reason": reason,
                    "human_takeover": human_takeover,
                }),
            ),
            _ => return None,
        };

        if !self
            .sent
            .lock()
            .insert((event.incident_id, stage.to_string()))
        {
            debug!(incident = %event.incident_id, stage, "duplicate notification suppressed");
            return None;
        }

        match self.channel.notify(&self.channel_id, payload).await {
            Ok(status) => Some(status),
            Err(err) => {
                debug!(error = %err, "notification delivery failed");
                Some(DeliveryStatus::Deferred)
            }
        }
    }

    /// Consensus participation: endorse the candidate plan from the
    /// communication perspective (is the blast radius explainable to
    /// stakeholders), or propose a notification-only action when no plan
    /// exists.
    pub fn assess(
        &self,
        incident_id: IncidentId,
        round: u64,
        candidate_plan: Option<&aegis_events::ActionPlan>,
    ) -> Result<Recommendation, AgentError> {
        let (action, confidence, reasoning) = match candidate_plan {
            Some(plan) => (
                ProposedAction::ExecutePlan { plan: plan.clone() },
                0.7,
                format!("plan '{}' is communicable to stakeholders", plan.summary),
            ),
            None => (
                ProposedAction::Notify {
                    audience: "oncall".to_string(),
                    stage: "analysis".to_string(),
                },
                0.5,
                "no candidate plan; notify on-call".to_string(),
            ),
        };

        let mut recommendation = Recommendation {
            id: Uuid::new_v4(),
            agent_id: self.id,
            incident_id,
            round,
            confidence,
            action,
            evidence: vec![EvidenceRef::Event {
                incident_id,
                version: 0,
            }],
            reasoning,
            submitted_at: Utc::now(),
            signature: String::new(),
        };
        recommendation.signature = self
            .identity
            .sign(&self.id.to_string(), &recommendation.signable_bytes())?;
        Ok(recommendation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::RecordingChannel;
    use crate::types::AgentRole;
    use aegis_events::{DecisionRecord, Severity};

    fn agent(channel: Arc<RecordingChannel>) -> CommunicationAgent {
        let identity = Arc::new(IdentityService::new());
        let id = AgentId::new(AgentRole::Communication, 0);
        identity.register(&id.to_string()).unwrap();
        CommunicationAgent::new(id, identity, channel, "incidents")
    }

    fn committed_event(incident_id: IncidentId) -> IncidentEvent {
        IncidentEvent {
            incident_id,
            version: 5,
            payload: EventPayload::DecisionCommitted {
                decision: DecisionRecord {
                    round: 1,
                    view: 0,
                    plan: aegis_events::ActionPlan {
                        plan_id: uuid::Uuid::nil(),
                        summary: "remediate db-primary".into(),
                        steps: vec![],
                    },
                    aggregate_confidence: 0.82,
                    contributing: vec![],
                    dissenting: vec![],
                    quorum: vec![],
                },
            },
            timestamp: Utc::now(),
            producer: "consensus".into(),
            content_hash: String::new(),
            chain_hash: String::new(),
            signature: String::new(),
        }
    }

    #[tokio::test]
    async fn decision_commit_notifies_once() {
        let channel = Arc::new(RecordingChannel::new());
        let agent = agent(channel.clone());
        let incident_id = IncidentId::new();
        let event = committed_event(incident_id);

        assert_eq!(agent.on_event(&event).await, Some(DeliveryStatus::Delivered));
        // Same (incident, stage) again: suppressed.
        assert_eq!(agent.on_event(&event).await, None);
        assert_eq!(channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn distinct_stages_notify_separately() {
        let channel = Arc::new(RecordingChannel::new());
        let agent = agent(channel.clone());
        let incident_id = IncidentId::new();

        agent.on_event(&committed_event(incident_id)).await;
        let resolved = IncidentEvent {
            payload: EventPayload::Resolved {
                round: 1,
                summary: "pool scaled".into(),
            },
            ..committed_event(incident_id)
        };
        agent.on_event(&resolved).await;
        assert_eq!(channel.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn unrelated_events_are_ignored() {
        let channel = Arc::new(RecordingChannel::new());
        let agent = agent(channel.clone());
        let event = IncidentEvent {
            payload: EventPayload::Created {
                severity: Severity::Low,
                tier: 3,
                source: "x".into(),
                title: "t".into(),
                meta_depth: 0,
            },
            ..committed_event(IncidentId::new())
        };
        assert_eq!(agent.on_event(&event).await, None);
        assert!(channel.sent.lock().is_empty());
    }

    #[test]
    fn assessment_endorses_candidate_plans() {
        let agent = agent(Arc::new(RecordingChannel::new()));
        let plan = aegis_events::ActionPlan {
            plan_id: uuid::Uuid::nil(),
            summary: "remediate".into(),
            steps: vec![],
        };
        let rec = agent.assess(IncidentId::new(), 1, Some(&plan)).unwrap();
        assert!(matches!(rec.action, ProposedAction::ExecutePlan { .. }));
        assert!(!rec.signature.is_empty());
    }
}
