//! The incident aggregate, derived purely by replaying committed events.
//!
//! The orchestrator holds these as a cache only; any divergence is
//! resolved by re-reading the stream and folding again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aegis_events::{EventPayload, IncidentEvent, IncidentId, Severity};

/// Top-level lifecycle of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentStatus {
    Open,
    Analyzing,
    Consensus,
    Executing,
    Resolved,
    Failed,
    Meta,
}

impl IncidentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Failed)
    }
}

/// Derived incident state. `version` is the version of the last event
/// folded in, which callers use for optimistic concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub severity: Severity,
    pub tier: u8,
    pub status: IncidentStatus,
    pub version: u64,
    pub title: String,
    pub source: String,
    pub meta_depth: u32,
    pub human_takeover: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Incident {
    /// Fold a full event stream into the aggregate. Returns `None` when
    /// the stream does not start with a `Created` event.
    pub fn replay(events: &[IncidentEvent]) -> Option<Incident> {
        let first = events.first()?;
        let EventPayload::Created { severity, tier, source, title, meta_depth } = &first.payload
        else {
            return None;
        };

        let mut incident = Incident {
            id: first.incident_id,
            severity: *severity,
            tier: *tier,
            status: if *meta_depth > 0 {
                IncidentStatus::Meta
            } else {
                IncidentStatus::Open
            },
            version: first.version,
            title: title.clone(),
            source: source.clone(),
            meta_depth: *meta_depth,
            human_takeover: false,
            created_at: first.timestamp,
            updated_at: first.timestamp,
        };
        for event in &events[1..] {
            incident.apply(event);
        }
        Some(incident)
    }

    /// Fold one more committed event into the aggregate.
    pub fn apply(&mut self, event: &IncidentEvent) {
        self.version = event.version;
        self.updated_at = event.timestamp;

        match &event.payload {
            EventPayload::Created { .. } => {}
            EventPayload::AgentJoined { .. } | EventPayload::RecommendationSubmitted { .. } => {
                if self.status == IncidentStatus::Open {
                    self.status = IncidentStatus::Analyzing;
                }
            }
            EventPayload::ConsensusPhase { .. } => {
                if !self.status.is_terminal() {
                    self.status = IncidentStatus::Consensus;
                }
            }
            EventPayload::DecisionCommitted { .. } | EventPayload::ActionExecuted { .. } => {
                if !self.status.is_terminal() {
                    self.status = IncidentStatus::Executing;
                }
            }
            EventPayload::SandboxRejected { .. } => {
                if !self.status.is_terminal() {
                    self.status = IncidentStatus::Consensus;
                }
            }
            EventPayload::Resolved { .. } => self.status = IncidentStatus::Resolved,
            EventPayload::Failed { human_takeover, .. } => {
                self.status = IncidentStatus::Failed;
                self.human_takeover |= *human_takeover;
            }
            EventPayload::InsufficientQuorum { .. } | EventPayload::MetaIncident { .. } => {
                if !self.status.is_terminal() {
                    self.status = IncidentStatus::Meta;
                }
            }
            EventPayload::HumanTakeoverRequired { .. } => {
                self.human_takeover = true;
            }
            // Audit-only events: no lifecycle effect.
            EventPayload::Rollback { .. }
            | EventPayload::BudgetDenied { .. }
            | EventPayload::Degraded { .. }
            | EventPayload::Timeout { .. }
            | EventPayload::Cancelled { .. }
            | EventPayload::Quarantine { .. } => {}
        }
    }
}

/// Cost tier for a severity; tier 0 is reserved for meta-incidents.
pub fn tier_for(severity: Severity, meta: bool) -> u8 {
    if meta {
        return 0;
    }
    match severity {
        Severity::Critical => 1,
        Severity::High => 2,
        Severity::Medium | Severity::Low => 3,
        Severity::Info => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(version: u64, payload: EventPayload) -> IncidentEvent {
        IncidentEvent {
            incident_id: IncidentId(uuid::Uuid::from_u128(1)),
            version,
            payload,
            timestamp: Utc::now(),
            producer: "test".into(),
            content_hash: String::new(),
            chain_hash: String::new(),
            signature: String::new(),
        }
    }

    fn created() -> IncidentEvent {
        event(0, EventPayload::Created {
            severity: Severity::High,
            tier: 2,
            source: "db-proxy".into(),
            title: "pool saturation".into(),
            meta_depth: 0,
        })
    }

    #[test]
    fn replay_walks_the_lifecycle() {
        let events = vec![
            created(),
            event(1, EventPayload::RecommendationSubmitted {
                agent_id: "detection-0".into(),
                round: 1,
                confidence: 0.8,
                action_key: "severity:High".into(),
                summary: "s".into(),
            }),
            event(2, EventPayload::ConsensusPhase {
                round: 1,
                view: 0,
                phase: "PRE_PREPARE".into(),
            }),
            event(3, EventPayload::ActionExecuted {
                round: 1,
                step_index: 0,
                step_name: "scale_pool".into(),
                target: "db".into(),
                verified: true,
            }),
            event(4, EventPayload::Resolved {
                round: 1,
                summary: "pool scaled".into(),
            }),
        ];

        let mut statuses = Vec::new();
        for end in 1..=events.len() {
            statuses.push(Incident::replay(&events[..end]).unwrap().status);
        }
        assert_eq!(
            statuses,
            vec![
                IncidentStatus::Open,
                IncidentStatus::Analyzing,
                IncidentStatus::Consensus,
                IncidentStatus::Executing,
                IncidentStatus::Resolved,
            ]
        );

        let incident = Incident::replay(&events).unwrap();
        assert_eq!(incident.version, 4);
        assert!(incident.status.is_terminal());
    }

    #[test]
    fn replay_requires_a_created_head() {
        let events = vec![event(0, EventPayload::Timeout { stage: "x".into() })];
        assert!(Incident::replay(&events).is_none());
        assert!(Incident::replay(&[]).is_none());
    }

    #[test]
    fn insufficient_quorum_sends_the_incident_to_meta() {
        let events = vec![
            created(),
            event(1, EventPayload::InsufficientQuorum {
                round: 1,
                available: 2,
                required: 3,
            }),
        ];
        let incident = Incident::replay(&events).unwrap();
        assert_eq!(incident.status, IncidentStatus::Meta);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let events = vec![
            created(),
            event(1, EventPayload::Resolved { round: 1, summary: "done".into() }),
            event(2, EventPayload::ConsensusPhase {
                round: 2,
                view: 0,
                phase: "PRE_PREPARE".into(),
            }),
        ];
        let incident = Incident::replay(&events).unwrap();
        assert_eq!(incident.status, IncidentStatus::Resolved);
    }

    #[test]
    fn audit_events_do_not_move_the_lifecycle() {
        let events = vec![
            created(),
            event(1, EventPayload::Quarantine {
                agent_id: "diagnosis-0".into(),
                reason: "equivocation".into(),
                durable: false,
            }),
            event(2, EventPayload::BudgetDenied {
                dependency: "model".into(),
                tier: "accurate".into(),
                estimated_cost: 10.0,
            }),
        ];
        let incident = Incident::replay(&events).unwrap();
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.version, 2);
    }

    #[test]
    fn meta_incidents_carry_the_reserved_tier() {
        assert_eq!(tier_for(Severity::Critical, true), 0);
        assert_eq!(tier_for(Severity::Critical, false), 1);
        assert_eq!(tier_for(Severity::Low, false), 3);
    }
}
