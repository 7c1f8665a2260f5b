//! Byzantine screening at consensus ingress.
//!
//! Checks, in order: quarantined or revoked identities, impossible
//! confidence values, signature validity, dangling evidence references,
//! and — across the whole batch — confidence outliers whose dissent has no
//! other support. Each finding is a flag, not an error: the engine turns
//! flags into reputation penalties, round-local exclusion, and suspicion
//! reports for the monitor to corroborate.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use aegis_agents::{AgentId, AgentRegistry, AgentState, Recommendation};
use aegis_events::{EventStore, EvidenceRef};
use aegis_identity::IdentityService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByzantineFlag {
    /// Sender is quarantined; message rejected at ingress.
    QuarantinedSender,
    /// Confidence outside [0, 1].
    ImpossibleConfidence,
    /// Signature does not verify, or the identity is revoked.
    InvalidSignature,
    /// Cited evidence points at events that do not exist.
    DanglingEvidence,
    /// Conflicting protocol messages in one view.
    Equivocation,
    /// Confidence far from the pack with no supporting dissent.
    ConfidenceOutlier,
}

impl ByzantineFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ByzantineFlag::QuarantinedSender => "quarantined_sender",
            ByzantineFlag::ImpossibleConfidence => "impossible_confidence",
            ByzantineFlag::InvalidSignature => "invalid_signature",
            ByzantineFlag::DanglingEvidence => "dangling_evidence",
            ByzantineFlag::Equivocation => "equivocation",
            ByzantineFlag::ConfidenceOutlier => "confidence_outlier",
        }
    }
}

pub struct ByzantineDetector {
    identity: Arc<IdentityService>,
    registry: Arc<AgentRegistry>,
    /// Outlier sensitivity: flag when |confidence − median| > k · MAD.
    mad_k: f64,
}

impl ByzantineDetector {
    pub fn new(identity: Arc<IdentityService>, registry: Arc<AgentRegistry>, mad_k: f64) -> Self {
        Self {
            identity,
            registry,
            mad_k,
        }
    }

    /// Screen one recommendation at ingress. `None` means it is admissible.
    pub async fn screen(
        &self,
        recommendation: &Recommendation,
        store: &EventStore,
    ) -> Option<ByzantineFlag> {
        let sender = recommendation.agent_id;

        if matches!(
            self.registry.state(&sender),
            AgentState::Quarantined | AgentState::Dead
        ) {
            warn!(agent = %sender, "rejected message from quarantined agent");
            return Some(ByzantineFlag::QuarantinedSender);
        }

        if !(0.0..=1.0).contains(&recommendation.confidence) {
            warn!(agent = %sender, confidence = recommendation.confidence, "impossible confidence");
            return Some(ByzantineFlag::ImpossibleConfidence);
        }

        let valid = self.identity.verify(
            &sender.to_string(),
            &recommendation.signable_bytes(),
            &recommendation.signature,
            recommendation.submitted_at,
        );
        if !valid {
            self.identity.record_forgery(&sender.to_string());
            warn!(agent = %sender, "recommendation signature failed verification");
            return Some(ByzantineFlag::InvalidSignature);
        }

        for evidence in &recommendation.evidence {
            if let EvidenceRef::Event { incident_id, version } = evidence {
                match store.head_version(*incident_id).await {
                    Ok(Some(head)) if *version <= head => {}
                    _ => {
                        warn!(agent = %sender, "evidence reference points at a non-existent event");
                        return Some(ByzantineFlag::DanglingEvidence);
                    }
                }
            }
        }

        None
    }

    /// Batch-level outlier pass: agents whose confidence sits more than
    /// k·MAD from the median while nothing else supports their action.
    pub fn confidence_outliers(&self, batch: &[Recommendation]) -> Vec<AgentId> {
        if batch.len() < 4 {
            return Vec::new();
        }

        let mut confidences: Vec<f64> = batch.iter().map(|r| r.confidence).collect();
        let median = median_of(&mut confidences);
        let mut deviations: Vec<f64> = batch
            .iter()
            .map(|r| (r.confidence - median).abs())
            .collect();
        let mad = median_of(&mut deviations);
        if mad <= f64::EPSILON {
            // Uniform pack; nothing to single out.
            return Vec::new();
        }

        let mut support: HashMap<String, usize> = HashMap::new();
        for rec in batch {
            *support.entry(rec.action_key()).or_insert(0) += 1;
        }

        batch
            .iter()
            .filter(|rec| {
                let deviant = (rec.confidence - median).abs() > self.mad_k * mad;
                let unsupported = support.get(&rec.action_key()).copied().unwrap_or(0) <= 1;
                deviant && unsupported
            })
            .map(|rec| rec.agent_id)
            .collect()
    }
}

fn median_of(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).expect("confidences are finite"));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
