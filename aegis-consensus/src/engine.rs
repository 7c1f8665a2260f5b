//! The consensus engine: submission collection, ingress screening, the
//! three PBFT phases with view changes, weighted outcome selection, and
//! the durable committed decision.
//!
//! The engine drives the protocol for every participant in the in-process
//! fleet: it generates each agent's signed phase messages through the
//! identity service and validates them exactly as a remote peer would, so
//! forged signatures, equivocation, and silence behave the way they would
//! on a wire.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use aegis_agents::{
    AgentId, AgentRegistry, ChaosProfile, ChaosRegistry, Recommendation, ReputationSignal,
};
use aegis_events::{
    DecisionRecord, EventPayload, EventStore, IncidentId, QuorumVote, RecommendationDigest,
};
use aegis_identity::IdentityService;

use crate::byzantine::{ByzantineDetector, ByzantineFlag};
use crate::round::ConsensusRound;
use crate::types::{
    batch_digest, CommitMsg, ConsensusConfig, PrePrepare, Prepare, RoundId, ViewChangeMsg,
};
use crate::ConsensusError;

const PRODUCER: &str = "consensus";

/// Cross-round suspicion evidence handed to the meta-health monitor for
/// corroboration before quarantine becomes durable.
#[derive(Debug, Clone)]
pub struct SuspicionReport {
    pub agent_id: AgentId,
    pub round_id: RoundId,
    pub reason: String,
}

/// Rolling consensus health, consumed by the meta-health monitor.
pub struct ConsensusStats {
    attempts: AtomicU64,
    commits: AtomicU64,
    window: Mutex<Vec<(chrono::DateTime<Utc>, bool)>>,
}

impl ConsensusStats {
    fn new() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            window: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, success: bool) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.commits.fetch_add(1, Ordering::Relaxed);
        }
        let mut window = self.window.lock();
        let cutoff = Utc::now() - chrono::Duration::minutes(15);
        window.retain(|(at, _)| *at > cutoff);
        window.push((Utc::now(), success));
    }

    /// Success rate over the sliding window; 1.0 when idle.
    pub fn success_rate(&self) -> f64 {
        let window = self.window.lock();
        if window.is_empty() {
            return 1.0;
        }
        let ok = window.iter().filter(|(_, success)| *success).count();
        ok as f64 / window.len() as f64
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.attempts.load(Ordering::Relaxed),
            self.commits.load(Ordering::Relaxed),
        )
    }
}

/// Outcome of one consensus round.
#[derive(Debug, Clone)]
pub enum ConsensusOutcome {
    Committed(DecisionRecord),
    /// Fewer than 2f+1 usable participants; the incident escalates to META.
    InsufficientQuorum { available: usize, required: usize },
    /// The round cannot make progress (view changes exhausted, no
    /// executable plan). The incident escalates to META.
    Aborted { reason: String },
}

enum ViewResult {
    Committed,
    ViewChange(&'static str),
}

pub struct ConsensusEngine {
    config: ConsensusConfig,
    identity: Arc<IdentityService>,
    registry: Arc<AgentRegistry>,
    chaos: Arc<ChaosRegistry>,
    detector: ByzantineDetector,
    store: Arc<EventStore>,
    stats: Arc<ConsensusStats>,
    suspicion_tx: mpsc::UnboundedSender<SuspicionReport>,
}

impl ConsensusEngine {
    /// Build the engine; the returned receiver delivers suspicion reports
    /// to the meta-health monitor.
    pub fn new(
        config: ConsensusConfig,
        identity: Arc<IdentityService>,
        registry: Arc<AgentRegistry>,
        chaos: Arc<ChaosRegistry>,
        store: Arc<EventStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SuspicionReport>), ConsensusError> {
        config.validate()?;
        let (suspicion_tx, suspicion_rx) = mpsc::unbounded_channel();
        let detector = ByzantineDetector::new(identity.clone(), registry.clone(), 3.0);
        Ok((
            Self {
                config,
                identity,
                registry,
                chaos,
                detector,
                store,
                stats: Arc::new(ConsensusStats::new()),
                suspicion_tx,
            },
            suspicion_rx,
        ))
    }

    pub fn stats(&self) -> Arc<ConsensusStats> {
        self.stats.clone()
    }

    /// Run one consensus round: collect submissions within the window,
    /// screen them, then drive pre-prepare → prepare → commit to a
    /// committed decision, changing views on phase timeouts.
    ///
    /// The `DECISION_COMMITTED` event is durable before this returns.
    pub async fn run_round(
        &self,
        incident_id: IncidentId,
        round: u64,
        submissions: &mut mpsc::Receiver<Recommendation>,
    ) -> Result<ConsensusOutcome, ConsensusError> {
        let round_id = RoundId { incident_id, round };
        let quorum = self.config.quorum();

        let members = self.registry.non_quarantined_ordered();
        if members.len() < quorum {
            warn!(round = %round_id, available = members.len(), required = quorum, "liveness floor breached");
            self.store
                .append_next(incident_id, PRODUCER, EventPayload::InsufficientQuorum {
                    round,
                    available: members.len(),
                    required: quorum,
                })
                .await?;
            self.stats.record(false);
            return Ok(ConsensusOutcome::InsufficientQuorum {
                available: members.len(),
                required: quorum,
            });
        }

        let accepted = self.collect_submissions(round_id, &members, submissions).await?;
        if accepted.is_empty() {
            self.stats.record(false);
            return Ok(ConsensusOutcome::Aborted {
                reason: "no admissible recommendations in the submission window".to_string(),
            });
        }

        let mut view: u64 = 0;
        loop {
            if view > self.config.max_view_changes {
                self.stats.record(false);
                return Ok(ConsensusOutcome::Aborted {
                    reason: format!("view changes exhausted after view {view}"),
                });
            }

            // Round-local exclusions may have changed membership.
            let members = self.registry.non_quarantined_ordered();
            if members.len() < quorum {
                self.store
                    .append_next(incident_id, PRODUCER, EventPayload::InsufficientQuorum {
                        round,
                        available: members.len(),
                        required: quorum,
                    })
                    .await?;
                self.stats.record(false);
                return Ok(ConsensusOutcome::InsufficientQuorum {
                    available: members.len(),
                    required: quorum,
                });
            }

            let primary = members[(view as usize) % members.len()];
            self.store
                .append_next(incident_id, PRODUCER, EventPayload::ConsensusPhase {
                    round,
                    view,
                    phase: "PRE_PREPARE".to_string(),
                })
                .await?;

            let mut state =
                ConsensusRound::new(round_id, view, primary, self.config.f, accepted.clone());

            match self.drive_view(&mut state, &members).await? {
                ViewResult::Committed => {
                    let decision = match self.build_decision(&state, view) {
                        Ok(decision) => decision,
                        Err(ConsensusError::NoExecutablePlan) => {
                            self.stats.record(false);
                            return Ok(ConsensusOutcome::Aborted {
                                reason: "no executable plan among committed recommendations"
                                    .to_string(),
                            });
                        }
                        Err(other) => return Err(other),
                    };

                    // Durability gate: the committed event (with quorum
                    // proof) lands in the store before any caller can act.
                    self.store
                        .append_next(incident_id, PRODUCER, EventPayload::DecisionCommitted {
                            decision: decision.clone(),
                        })
                        .await?;

                    self.settle_reputations(&state, &decision);
                    self.stats.record(true);
                    info!(round = %round_id, view, plan = %decision.plan.summary, "decision committed");
                    return Ok(ConsensusOutcome::Committed(decision));
                }
                ViewResult::ViewChange(reason) => {
                    debug!(round = %round_id, view, reason, "phase failed; moving to view change");
                    self.store
                        .append_next(incident_id, PRODUCER, EventPayload::ConsensusPhase {
                            round,
                            view,
                            phase: "VIEW_CHANGE".to_string(),
                        })
                        .await?;

                    let voters = self.collect_view_change(&mut state, &members)?;
                    if voters < quorum {
                        self.stats.record(false);
                        self.store
                            .append_next(incident_id, PRODUCER, EventPayload::InsufficientQuorum {
                                round,
                                available: voters,
                                required: quorum,
                            })
                            .await?;
                        return Ok(ConsensusOutcome::InsufficientQuorum {
                            available: voters,
                            required: quorum,
                        });
                    }
                    view += 1;
                }
            }
        }
    }

    /// Collect signed recommendations until the window closes or every
    /// member has submitted, screening each at ingress.
    async fn collect_submissions(
        &self,
        round_id: RoundId,
        members: &[AgentId],
        submissions: &mut mpsc::Receiver<Recommendation>,
    ) -> Result<BTreeMap<AgentId, Recommendation>, ConsensusError> {
        let mut accepted = BTreeMap::new();
        let mut flagged: std::collections::HashSet<AgentId> = std::collections::HashSet::new();
        let window_closes = Instant::now() + self.config.submission_window;

        loop {
            match timeout_at(window_closes, submissions.recv()).await {
                Ok(Some(recommendation)) => {
                    let sender = recommendation.agent_id;
                    match self.detector.screen(&recommendation, &self.store).await {
                        None => {
                            self.store
                                .append_next(
                                    round_id.incident_id,
                                    PRODUCER,
                                    EventPayload::RecommendationSubmitted {
                                        agent_id: sender.to_string(),
                                        round: round_id.round,
                                        confidence: recommendation.confidence,
                                        action_key: recommendation.action_key(),
                                        summary: recommendation.reasoning.chars().take(240).collect(),
                                    },
                                )
                                .await?;
                            accepted.insert(sender, recommendation);
                            if accepted.len() == members.len() {
                                break;
                            }
                        }
                        Some(flag) => {
                            flagged.insert(sender);
                            self.penalize(round_id, sender, flag).await?;
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        // Batch-level outlier screening needs the whole pack.
        let batch: Vec<Recommendation> = accepted.values().cloned().collect();
        for outlier in self.detector.confidence_outliers(&batch) {
            accepted.remove(&outlier);
            flagged.insert(outlier);
            self.penalize(round_id, outlier, ByzantineFlag::ConfidenceOutlier)
                .await?;
        }

        // Members that stayed silent through the window lose a little
        // reputation. Agents already penalized for a flag this round are
        // not double-counted.
        for member in members {
            if !accepted.contains_key(member) && !flagged.contains(member) {
                self.registry
                    .record_signal(member, ReputationSignal::SilentTimeout);
            }
        }

        Ok(accepted)
    }

    /// Drive pre-prepare, prepare, and commit for one view, generating and
    /// validating every participant's messages.
    async fn drive_view(
        &self,
        state: &mut ConsensusRound,
        members: &[AgentId],
    ) -> Result<ViewResult, ConsensusError> {
        let primary = state.primary;
        let round_id = state.id;

        // PRE-PREPARE: a silent primary produces nothing and the phase
        // deadline lapses; an equivocating primary is caught by the first
        // backup comparing digests.
        match self.chaos.get(&primary) {
            Some(ChaosProfile::Silent) => {
                tokio::time::sleep(self.config.phase_timeout).await;
                return Ok(ViewResult::ViewChange("pre-prepare timeout"));
            }
            Some(ChaosProfile::Equivocate) => {
                self.penalize(round_id, primary, ByzantineFlag::Equivocation)
                    .await?;
                return Ok(ViewResult::ViewChange("primary equivocation"));
            }
            _ => {}
        }

        let recommendations: Vec<&Recommendation> = state.recommendations().values().collect();
        let digest = batch_digest(&recommendations);
        let recommendation_ids = recommendations.iter().map(|r| r.id).collect();

        let mut pre_prepare = PrePrepare {
            round_id,
            view: state.view,
            primary,
            batch_digest: digest.clone(),
            recommendation_ids,
            sent_at: Utc::now(),
            signature: String::new(),
        };
        pre_prepare.signature = self
            .identity
            .sign(&primary.to_string(), &pre_prepare.signable_bytes())?;

        if state.accept_pre_prepare(pre_prepare.clone()).is_err() {
            return Ok(ViewResult::ViewChange("pre-prepare rejected"));
        }

        // PREPARE: each backup verifies the primary's signature and
        // legitimacy before preparing.
        for backup in members.iter().filter(|id| **id != primary) {
            match self.chaos.get(backup) {
                Some(ChaosProfile::Silent) => continue,
                Some(ChaosProfile::Equivocate) => {
                    let honest = self.signed_prepare(*backup, state, &digest)?;
                    let _ = state.accept_prepare(honest);

                    let mut conflicting = self.signed_prepare(*backup, state, &digest)?;
                    conflicting.batch_digest = "0".repeat(64);
                    conflicting.signature = self
                        .identity
                        .sign(&backup.to_string(), &conflicting.signable_bytes())?;

                    // The conflicting digest is rejected; the sender is
                    // struck so neither message counts toward quorum.
                    if state.accept_prepare(conflicting).is_err() {
                        state.strike(backup);
                        self.penalize(round_id, *backup, ByzantineFlag::Equivocation)
                            .await?;
                    }
                }
                _ => {
                    let primary_ok = self.identity.verify(
                        &primary.to_string(),
                        &pre_prepare.signable_bytes(),
                        &pre_prepare.signature,
                        pre_prepare.sent_at,
                    );
                    if !primary_ok {
                        continue;
                    }
                    let prepare = self.signed_prepare(*backup, state, &digest)?;
                    let _ = state.accept_prepare(prepare);
                }
            }
        }

        if !state.is_prepared() {
            tokio::time::sleep(self.config.phase_timeout).await;
            return Ok(ViewResult::ViewChange("prepare timeout"));
        }

        // COMMIT: every prepared participant (primary included) commits.
        for member in members {
            if matches!(
                self.chaos.get(member),
                Some(ChaosProfile::Silent) | Some(ChaosProfile::Equivocate)
            ) {
                continue;
            }
            let mut commit = CommitMsg {
                round_id,
                view: state.view,
                sender: *member,
                batch_digest: digest.clone(),
                sent_at: Utc::now(),
                signature: String::new(),
            };
            commit.signature = self
                .identity
                .sign(&member.to_string(), &commit.signable_bytes())?;
            let _ = state.accept_commit(commit);
        }

        if !state.is_committed_local() {
            tokio::time::sleep(self.config.phase_timeout).await;
            return Ok(ViewResult::ViewChange("commit timeout"));
        }

        debug!(round = %round_id, view = state.view, "committed-local");
        Ok(ViewResult::Committed)
    }

    fn signed_prepare(
        &self,
        sender: AgentId,
        state: &ConsensusRound,
        digest: &str,
    ) -> Result<Prepare, ConsensusError> {
        let mut prepare = Prepare {
            round_id: state.id,
            view: state.view,
            sender,
            batch_digest: digest.to_string(),
            sent_at: Utc::now(),
            signature: String::new(),
        };
        prepare.signature = self
            .identity
            .sign(&sender.to_string(), &prepare.signable_bytes())?;
        Ok(prepare)
    }

    /// Gather view-change votes from everything still responsive; returns
    /// the number of distinct voters.
    fn collect_view_change(
        &self,
        state: &mut ConsensusRound,
        members: &[AgentId],
    ) -> Result<usize, ConsensusError> {
        let mut voters = 0;
        for member in members {
            if self.chaos.get(member) == Some(ChaosProfile::Silent) {
                continue;
            }
            let mut msg = ViewChangeMsg {
                round_id: state.id,
                new_view: state.view + 1,
                sender: *member,
                sent_at: Utc::now(),
                signature: String::new(),
            };
            msg.signature = self
                .identity
                .sign(&member.to_string(), &msg.signable_bytes())?;
            if state.accept_view_change(msg).is_ok() {
                voters += 1;
            }
        }
        Ok(voters)
    }

    /// Weighted vote over the accepted recommendations:
    /// `weight(a) = reputation(a) · confidence(a)`, aggregated by action
    /// key. Ties break toward the key whose highest-weight contributor has
    /// the lower agent id, so identical inputs always produce identical
    /// outcomes.
    fn build_decision(
        &self,
        state: &ConsensusRound,
        view: u64,
    ) -> Result<DecisionRecord, ConsensusError> {
        struct Tally {
            weight: f64,
            best_weight: f64,
            best_agent: AgentId,
        }

        let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
        for (agent_id, rec) in state.recommendations() {
            let weight = self.registry.reputation(agent_id) * rec.confidence;
            let entry = tallies.entry(rec.action_key()).or_insert(Tally {
                weight: 0.0,
                best_weight: f64::MIN,
                best_agent: *agent_id,
            });
            entry.weight += weight;
            if weight > entry.best_weight
                || (weight == entry.best_weight && *agent_id < entry.best_agent)
            {
                entry.best_weight = weight;
                entry.best_agent = *agent_id;
            }
        }

        // BTreeMap iteration is key-ordered, so the scan itself is
        // deterministic; the comparison adds the weight and tie-break.
        let mut winner: Option<(&String, &Tally)> = None;
        for (key, tally) in &tallies {
            winner = match winner {
                None => Some((key, tally)),
                Some((_, best)) if tally.weight > best.weight => Some((key, tally)),
                Some((_, best))
                    if tally.weight == best.weight && tally.best_agent < best.best_agent =>
                {
                    Some((key, tally))
                }
                keep => keep,
            };
        }
        let (winning_key, _) = winner.expect("accepted recommendations are non-empty");

        // The committed action must be executable. When the weighted
        // winner is a plan we are done; otherwise fall back to the
        // heaviest plan-carrying key.
        let plan_key = if state.recommendations().values().any(|r| {
            r.action_key() == *winning_key && r.action.plan().is_some()
        }) {
            winning_key.clone()
        } else {
            tallies
                .iter()
                .filter(|(key, _)| {
                    state
                        .recommendations()
                        .values()
                        .any(|r| r.action_key() == **key && r.action.plan().is_some())
                })
                .max_by(|(ka, a), (kb, b)| {
                    a.weight
                        .partial_cmp(&b.weight)
                        .expect("weights are finite")
                        .then_with(|| {
                            // Lower best-agent wins, so reverse for max_by.
                            b.best_agent.cmp(&a.best_agent).then(kb.cmp(ka))
                        })
                })
                .map(|(key, _)| key.clone())
                .ok_or(ConsensusError::NoExecutablePlan)?
        };

        let plan = state
            .recommendations()
            .values()
            .find(|r| r.action_key() == plan_key)
            .and_then(|r| r.action.plan().cloned())
            .ok_or(ConsensusError::NoExecutablePlan)?;

        let mut contributing: Vec<RecommendationDigest> = Vec::new();
        let mut dissenting: Vec<RecommendationDigest> = Vec::new();
        let mut weight_sum = 0.0;
        let mut confidence_sum = 0.0;
        for (agent_id, rec) in state.recommendations() {
            if rec.action_key() == plan_key {
                let weight = self.registry.reputation(agent_id) * rec.confidence;
                weight_sum += weight;
                confidence_sum += weight * rec.confidence;
                contributing.push(rec.digest());
            } else {
                dissenting.push(rec.digest());
            }
        }
        let aggregate_confidence = if weight_sum > 0.0 {
            confidence_sum / weight_sum
        } else {
            0.0
        };

        let quorum = state
            .commits()
            .values()
            .map(|commit| QuorumVote {
                agent_id: commit.sender.to_string(),
                view: commit.view,
                signed_at: commit.sent_at,
                signature: commit.signature.clone(),
            })
            .collect();

        Ok(DecisionRecord {
            round: state.id.round,
            view,
            plan,
            aggregate_confidence,
            contributing,
            dissenting,
            quorum,
        })
    }

    /// Post-commit reputation settlement: aligned agents gain, honest
    /// dissenters drift slightly.
    fn settle_reputations(&self, state: &ConsensusRound, decision: &DecisionRecord) {
        let contributing: Vec<&String> =
            decision.contributing.iter().map(|d| &d.agent_id).collect();
        for agent_id in state.recommendations().keys() {
            let signal = if contributing.contains(&&agent_id.to_string()) {
                ReputationSignal::MajorityAligned
            } else {
                ReputationSignal::HonestDissent
            };
            self.registry.record_signal(agent_id, signal);
        }
    }

    /// Round-local Byzantine handling: reputation penalty, lifecycle
    /// escalation, audit event, and a suspicion report for the monitor.
    async fn penalize(
        &self,
        round_id: RoundId,
        agent_id: AgentId,
        flag: ByzantineFlag,
    ) -> Result<(), ConsensusError> {
        warn!(agent = %agent_id, flag = flag.as_str(), round = %round_id, "Byzantine indicator");
        self.registry
            .record_signal(&agent_id, ReputationSignal::ByzantineIndicator);
        // Single-round suspicion stops at probation; durable quarantine
        // needs monitor corroboration of the suspicion report below.
        if self.registry.state(&agent_id) == aegis_agents::AgentState::Healthy {
            self.registry
                .set_state(&agent_id, aegis_agents::AgentState::Probation);
        }

        self.store
            .append_next(round_id.incident_id, PRODUCER, EventPayload::Quarantine {
                agent_id: agent_id.to_string(),
                reason: flag.as_str().to_string(),
                durable: false,
            })
            .await?;

        let _ = self.suspicion_tx.send(SuspicionReport {
            agent_id,
            round_id,
            reason: flag.as_str().to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_agents::{AgentRole, AgentState, LinearReputation, ProposedAction};
    use aegis_events::{ActionPlan, ActionStep, EventKind, IncidentId, MemoryEventSink};
    use std::collections::BTreeMap as StdBTreeMap;
    use std::time::Duration;
    use uuid::Uuid;

    struct Harness {
        identity: Arc<IdentityService>,
        registry: Arc<AgentRegistry>,
        chaos: Arc<ChaosRegistry>,
        store: Arc<EventStore>,
        engine: ConsensusEngine,
        suspicions: mpsc::UnboundedReceiver<SuspicionReport>,
    }

    fn harness() -> Harness {
        let identity = Arc::new(IdentityService::new());
        let registry = Arc::new(AgentRegistry::new(Box::new(LinearReputation::default()), 0.2));
        for role in AgentRole::all() {
            let id = AgentId::new(role, 0);
            let key = identity.register(&id.to_string()).unwrap();
            registry.register(id, hex::encode(key.to_bytes()));
        }
        identity.register(PRODUCER).unwrap();
        let store = Arc::new(EventStore::new(
            Arc::new(MemoryEventSink::new()),
            identity.clone(),
        ));
        let chaos = Arc::new(ChaosRegistry::new());
        let config = ConsensusConfig {
            n: 5,
            f: 1,
            phase_timeout: Duration::from_millis(50),
            submission_window: Duration::from_millis(200),
            view_change_timeout: Duration::from_millis(50),
            max_view_changes: 4,
        };
        let (engine, suspicions) = ConsensusEngine::new(
            config,
            identity.clone(),
            registry.clone(),
            chaos.clone(),
            store.clone(),
        )
        .unwrap();
        Harness {
            identity,
            registry,
            chaos,
            store,
            engine,
            suspicions,
        }
    }

    fn plan(tag: u128) -> ActionPlan {
        ActionPlan {
            plan_id: Uuid::from_u128(tag),
            summary: format!("plan-{tag}"),
            steps: vec![ActionStep {
                name: "scale_pool".into(),
                target: format!("db-{tag}"),
                params: StdBTreeMap::new(),
                reversal: None,
                success_criteria: vec![],
            }],
        }
    }

    fn endorsement(
        harness: &Harness,
        role: AgentRole,
        incident_id: IncidentId,
        plan: &ActionPlan,
        confidence: f64,
    ) -> Recommendation {
        let agent_id = AgentId::new(role, 0);
        let mut rec = Recommendation {
            id: Uuid::new_v4(),
            agent_id,
            incident_id,
            round: 1,
            confidence,
            action: ProposedAction::ExecutePlan { plan: plan.clone() },
            evidence: vec![],
            reasoning: format!("{} endorses", agent_id),
            submitted_at: Utc::now(),
            signature: String::new(),
        };
        rec.signature = harness
            .identity
            .sign(&agent_id.to_string(), &rec.signable_bytes())
            .unwrap();
        rec
    }

    async fn submit_all(recs: Vec<Recommendation>) -> mpsc::Receiver<Recommendation> {
        let (tx, rx) = mpsc::channel(16);
        for rec in recs {
            tx.send(rec).await.unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn five_honest_agents_commit_with_a_quorum_proof() {
        let harness = harness();
        let incident_id = IncidentId::new();
        let plan = plan(1);

        let recs: Vec<Recommendation> = AgentRole::all()
            .into_iter()
            .map(|role| endorsement(&harness, role, incident_id, &plan, 0.8))
            .collect();
        let mut rx = submit_all(recs.clone()).await;

        let outcome = harness
            .engine
            .run_round(incident_id, 1, &mut rx)
            .await
            .unwrap();

        let decision = match outcome {
            ConsensusOutcome::Committed(decision) => decision,
            other => panic!("expected commit, got {other:?}"),
        };
        assert_eq!(decision.plan.plan_id, plan.plan_id);
        assert_eq!(decision.contributing.len(), 5);
        assert!(decision.dissenting.is_empty());
        assert!(decision.quorum.len() >= 3);

        // Quorum proof: distinct signers, every signature valid against
        // the commit message it covers (P3).
        let mut signers: Vec<&String> = decision.quorum.iter().map(|v| &v.agent_id).collect();
        signers.sort();
        signers.dedup();
        assert_eq!(signers.len(), decision.quorum.len());

        let refs: Vec<&Recommendation> = recs.iter().collect();
        let digest = batch_digest(&refs);
        for vote in &decision.quorum {
            let (role_str, instance) = vote.agent_id.rsplit_once('-').unwrap();
            let role = AgentRole::all()
                .into_iter()
                .find(|r| r.as_str() == role_str)
                .unwrap();
            let reconstructed = CommitMsg {
                round_id: RoundId { incident_id, round: 1 },
                view: vote.view,
                sender: AgentId::new(role, instance.parse().unwrap()),
                batch_digest: digest.clone(),
                sent_at: vote.signed_at,
                signature: String::new(),
            };
            assert!(harness.identity.verify(
                &vote.agent_id,
                &reconstructed.signable_bytes(),
                &vote.signature,
                vote.signed_at,
            ));
        }

        // The committed decision is durable in the event stream (I4).
        let events = harness.store.read(incident_id, 0, None).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind() == EventKind::DecisionCommitted));
        assert_eq!(harness.engine.stats().success_rate(), 1.0);
    }

    #[tokio::test]
    async fn byzantine_agent_is_flagged_and_consensus_survives() {
        let mut harness = harness();
        let incident_id = IncidentId::new();
        let plan = plan(2);

        let mut recs: Vec<Recommendation> = [
            AgentRole::Detection,
            AgentRole::Prediction,
            AgentRole::Resolution,
            AgentRole::Communication,
        ]
        .into_iter()
        .map(|role| endorsement(&harness, role, incident_id, &plan, 0.8))
        .collect();

        // Diagnosis is the adversary: impossible confidence and a
        // signature forged against its own key.
        let mut byzantine = endorsement(&harness, AgentRole::Diagnosis, incident_id, &plan, 0.8);
        byzantine.confidence = 1.5;
        byzantine.signature = "ff".repeat(64);
        recs.push(byzantine);

        let mut rx = submit_all(recs).await;
        let outcome = harness
            .engine
            .run_round(incident_id, 1, &mut rx)
            .await
            .unwrap();

        let decision = match outcome {
            ConsensusOutcome::Committed(decision) => decision,
            other => panic!("expected commit, got {other:?}"),
        };
        assert_eq!(decision.plan.plan_id, plan.plan_id);
        assert_eq!(decision.contributing.len(), 4);
        assert!(decision.quorum.len() >= 3);

        let diagnosis = AgentId::new(AgentRole::Diagnosis, 0);
        assert!(harness.registry.reputation(&diagnosis) < 0.5);
        assert_eq!(harness.registry.state(&diagnosis), AgentState::Probation);

        let report = harness.suspicions.recv().await.unwrap();
        assert_eq!(report.agent_id, diagnosis);

        let events = harness.store.read(incident_id, 0, None).await.unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.payload,
            EventPayload::Quarantine { durable: false, .. }
        )));
    }

    #[tokio::test]
    async fn silent_primary_triggers_view_change_and_commit_under_new_view() {
        let harness = harness();
        let incident_id = IncidentId::new();
        let plan = plan(3);

        // detection-0 is first in stable order, so it is primary in view
        // 0. Blackhole it at the protocol layer; its recommendation still
        // arrived before it went dark.
        harness
            .chaos
            .set(AgentId::new(AgentRole::Detection, 0), ChaosProfile::Silent);

        let recs = AgentRole::all()
            .into_iter()
            .map(|role| endorsement(&harness, role, incident_id, &plan, 0.8))
            .collect();
        let mut rx = submit_all(recs).await;

        let outcome = harness
            .engine
            .run_round(incident_id, 1, &mut rx)
            .await
            .unwrap();

        let decision = match outcome {
            ConsensusOutcome::Committed(decision) => decision,
            other => panic!("expected commit, got {other:?}"),
        };
        assert_eq!(decision.view, 1);

        let events = harness.store.read(incident_id, 0, None).await.unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.payload,
            EventPayload::ConsensusPhase { phase, .. } if phase == "VIEW_CHANGE"
        )));
    }

    #[tokio::test]
    async fn equivocating_backup_is_struck_but_quorum_holds() {
        let mut harness = harness();
        let incident_id = IncidentId::new();
        let plan = plan(4);

        harness
            .chaos
            .set(AgentId::new(AgentRole::Diagnosis, 0), ChaosProfile::Equivocate);

        let recs = AgentRole::all()
            .into_iter()
            .map(|role| endorsement(&harness, role, incident_id, &plan, 0.8))
            .collect();
        let mut rx = submit_all(recs).await;

        let outcome = harness
            .engine
            .run_round(incident_id, 1, &mut rx)
            .await
            .unwrap();
        assert!(matches!(outcome, ConsensusOutcome::Committed(_)));

        let report = harness.suspicions.recv().await.unwrap();
        assert_eq!(report.reason, "equivocation");
    }

    #[tokio::test]
    async fn liveness_floor_aborts_with_insufficient_quorum() {
        let harness = harness();
        let incident_id = IncidentId::new();

        for role in [AgentRole::Detection, AgentRole::Diagnosis, AgentRole::Prediction] {
            harness
                .registry
                .set_state(&AgentId::new(role, 0), AgentState::Quarantined);
        }

        let (_tx, mut rx) = mpsc::channel(4);
        let outcome = harness
            .engine
            .run_round(incident_id, 1, &mut rx)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ConsensusOutcome::InsufficientQuorum { available: 2, required: 3 }
        ));
        let events = harness.store.read(incident_id, 0, None).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind() == EventKind::InsufficientQuorum));
    }

    #[tokio::test]
    async fn identical_inputs_produce_identical_outcomes() {
        // Two plans with exactly equal aggregate weight; the tie must
        // break the same way every run (P10).
        let mut digests = Vec::new();
        for _ in 0..2 {
            let harness = harness();
            let incident_id = IncidentId(Uuid::from_u128(42));
            let plan_a = plan(10);
            let plan_b = plan(11);

            let recs = vec![
                endorsement(&harness, AgentRole::Detection, incident_id, &plan_a, 0.8),
                endorsement(&harness, AgentRole::Diagnosis, incident_id, &plan_a, 0.8),
                endorsement(&harness, AgentRole::Prediction, incident_id, &plan_b, 0.8),
                endorsement(&harness, AgentRole::Resolution, incident_id, &plan_b, 0.8),
                endorsement(&harness, AgentRole::Communication, incident_id, &plan_b, 0.0),
            ];
            let mut rx = submit_all(recs).await;

            let outcome = harness
                .engine
                .run_round(incident_id, 1, &mut rx)
                .await
                .unwrap();
            match outcome {
                ConsensusOutcome::Committed(decision) => digests.push(decision.plan.digest()),
                other => panic!("expected commit, got {other:?}"),
            }
        }
        assert_eq!(digests[0], digests[1]);
    }
}
