//! Consensus protocol messages and configuration.
//!
//! Every message carries the round id, the view it was sent in, and a
//! signature over its canonical bytes; verification runs against the key
//! that was active at the message timestamp.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use aegis_agents::{AgentId, Recommendation};
use aegis_events::{canonical_bytes, IncidentId};

/// Protocol tuning. `n` and `f` must satisfy n ≥ 3f + 1.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Total agent count participating in consensus.
    pub n: usize,

    /// Byzantine agents tolerated.
    pub f: usize,

    /// Deadline for each protocol phase before a view change.
    pub phase_timeout: Duration,

    /// How long the primary collects recommendation submissions.
    pub submission_window: Duration,

    /// Deadline for assembling a view-change quorum.
    pub view_change_timeout: Duration,

    /// View changes tolerated before the round aborts.
    pub max_view_changes: u64,
}

impl ConsensusConfig {
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    pub fn validate(&self) -> Result<(), crate::ConsensusError> {
        if self.n < 3 * self.f + 1 {
            return Err(crate::ConsensusError::InvalidConfig(format!(
                "n = {} cannot tolerate f = {}; need n >= 3f + 1",
                self.n, self.f
            )));
        }
        Ok(())
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            n: 5,
            f: 1,
            phase_timeout: Duration::from_secs(60),
            submission_window: Duration::from_secs(30),
            view_change_timeout: Duration::from_secs(30),
            max_view_changes: 4,
        }
    }
}

/// Identity of one consensus round: the incident plus a round number that
/// increments on re-consensus (e.g. after a sandbox rejection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundId {
    pub incident_id: IncidentId,
    pub round: u64,
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.incident_id, self.round)
    }
}

/// Digest of a recommendation batch: blake3 over the sorted recommendation
/// ids, so any two honest nodes computing it over the same batch agree.
pub fn batch_digest(recommendations: &[&Recommendation]) -> String {
    let mut ids: Vec<String> = recommendations.iter().map(|r| r.id.to_string()).collect();
    ids.sort();
    let mut hasher = blake3::Hasher::new();
    for id in ids {
        hasher.update(id.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

macro_rules! signable_without_signature {
    ($ty:ty) => {
        impl $ty {
            /// Canonical bytes bound by the sender signature.
            pub fn signable_bytes(&self) -> Vec<u8> {
                let mut unsigned = self.clone();
                unsigned.signature = String::new();
                canonical_bytes(&unsigned).expect("message serialization is infallible")
            }
        }
    };
}

/// Primary's batch announcement opening the agreement phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub round_id: RoundId,
    pub view: u64,
    pub primary: AgentId,
    pub batch_digest: String,
    pub recommendation_ids: Vec<Uuid>,
    pub sent_at: DateTime<Utc>,
    pub signature: String,
}

signable_without_signature!(PrePrepare);

/// Backup's agreement that the pre-prepared batch matches what it saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prepare {
    pub round_id: RoundId,
    pub view: u64,
    pub sender: AgentId,
    pub batch_digest: String,
    pub sent_at: DateTime<Utc>,
    pub signature: String,
}

signable_without_signature!(Prepare);

/// Commit-phase message; 2f+1 of these from distinct senders make a node
/// committed-local and form the quorum proof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMsg {
    pub round_id: RoundId,
    pub view: u64,
    pub sender: AgentId,
    pub batch_digest: String,
    pub sent_at: DateTime<Utc>,
    pub signature: String,
}

signable_without_signature!(CommitMsg);

/// Vote to depose the current primary after a phase timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewChangeMsg {
    pub round_id: RoundId,
    pub new_view: u64,
    pub sender: AgentId,
    pub sent_at: DateTime<Utc>,
    pub signature: String,
}

signable_without_signature!(ViewChangeMsg);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation_enforces_the_bft_bound() {
        let ok = ConsensusConfig { n: 4, f: 1, ..ConsensusConfig::default() };
        assert!(ok.validate().is_ok());

        let bad = ConsensusConfig { n: 3, f: 1, ..ConsensusConfig::default() };
        assert!(bad.validate().is_err());

        assert_eq!(ConsensusConfig::default().quorum(), 3);
    }

    #[test]
    fn batch_digest_is_order_independent() {
        use aegis_agents::{AgentRole, ProposedAction};
        use chrono::Utc;

        let rec = |instance| Recommendation {
            id: Uuid::from_u128(instance as u128 + 1),
            agent_id: AgentId::new(AgentRole::Detection, instance),
            incident_id: IncidentId::new(),
            round: 1,
            confidence: 0.5,
            action: ProposedAction::Notify { audience: "a".into(), stage: "s".into() },
            evidence: vec![],
            reasoning: String::new(),
            submitted_at: Utc::now(),
            signature: String::new(),
        };
        let a = rec(0);
        let b = rec(1);

        assert_eq!(batch_digest(&[&a, &b]), batch_digest(&[&b, &a]));
        assert_ne!(batch_digest(&[&a]), batch_digest(&[&a, &b]));
    }
}
