//! The agent runtime: one concurrent worker per fleet member, consuming
//! typed jobs from bounded queues and replying with signed
//! recommendations.
//!
//! Chaos profiles can be attached per agent to make it misbehave in
//! controlled ways (impossible confidence, forged signatures, silence,
//! equivocation) for Byzantine-tolerance testing and the operator chaos
//! endpoint.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aegis_events::{ActionPlan, IncidentId};
use aegis_identity::IdentityService;

use crate::communication::CommunicationAgent;
use crate::detection::DetectionAgent;
use crate::diagnosis::DiagnosisAgent;
use crate::interfaces::TelemetrySignal;
use crate::prediction::PredictionAgent;
use crate::registry::AgentRegistry;
use crate::resolution::ResolutionAgent;
use crate::types::{AgentId, AgentRole, ProposedAction, Recommendation};
use crate::AgentError;

/// Controlled misbehavior for Byzantine-tolerance testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosProfile {
    /// Emit confidence outside [0, 1].
    BadConfidence,
    /// Emit a signature that does not verify against the agent's own key.
    ForgeSignature,
    /// Both of the above: the canonical Byzantine mock.
    Byzantine,
    /// Send conflicting protocol messages in the same view.
    Equivocate,
    /// Submit nothing; let windows and phases time out.
    Silent,
}

/// Per-agent chaos assignments, consulted by the runtime when producing
/// recommendations and by the consensus engine when generating protocol
/// messages.
pub struct ChaosRegistry {
    profiles: DashMap<AgentId, ChaosProfile>,
}

impl ChaosRegistry {
    pub fn new() -> Self {
        Self {
            profiles: DashMap::new(),
        }
    }

    pub fn set(&self, id: AgentId, profile: ChaosProfile) {
        warn!(agent = %id, ?profile, "chaos profile armed");
        self.profiles.insert(id, profile);
    }

    pub fn clear(&self, id: &AgentId) {
        self.profiles.remove(id);
    }

    pub fn get(&self, id: &AgentId) -> Option<ChaosProfile> {
        self.profiles.get(id).map(|p| *p)
    }
}

impl Default for ChaosRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a worker needs to analyze one incident for one round.
#[derive(Clone)]
pub struct AnalysisContext {
    pub incident_id: IncidentId,
    pub round: u64,
    pub title: String,
    pub source_component: String,
    pub signals: Vec<TelemetrySignal>,
    /// Diagnosed (component, hypothesis), once diagnosis has run.
    pub root_cause: Option<(String, String)>,
    /// The remediation candidate under consensus; present means "endorse
    /// or dissent".
    pub candidate_plan: Option<ActionPlan>,
    pub cancel: CancellationToken,
}

/// One unit of agent work plus the channel its recommendation goes to.
pub struct AgentJob {
    pub ctx: AnalysisContext,
    pub reply: mpsc::Sender<Recommendation>,
}

const JOB_QUEUE_DEPTH: usize = 16;

/// Hosts the five role workers over bounded job queues.
pub struct AgentRuntime {
    identity: Arc<IdentityService>,
    registry: Arc<AgentRegistry>,
    chaos: Arc<ChaosRegistry>,
    detection: Arc<DetectionAgent>,
    diagnosis: Arc<DiagnosisAgent>,
    prediction: Arc<PredictionAgent>,
    resolution: Arc<ResolutionAgent>,
    communication: Arc<CommunicationAgent>,
    queues: DashMap<AgentId, mpsc::Sender<AgentJob>>,
    shutdown: CancellationToken,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<IdentityService>,
        registry: Arc<AgentRegistry>,
        chaos: Arc<ChaosRegistry>,
        detection: Arc<DetectionAgent>,
        diagnosis: Arc<DiagnosisAgent>,
        prediction: Arc<PredictionAgent>,
        resolution: Arc<ResolutionAgent>,
        communication: Arc<CommunicationAgent>,
    ) -> Self {
        Self {
            identity,
            registry,
            chaos,
            detection,
            diagnosis,
            prediction,
            resolution,
            communication,
            queues: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn one worker per role instance. Idempotent per agent id.
    pub fn start(self: &Arc<Self>) {
        for role in AgentRole::all() {
            let id = AgentId::new(role, 0);
            if self.queues.contains_key(&id) {
                continue;
            }
            let (tx, rx) = mpsc::channel(JOB_QUEUE_DEPTH);
            self.queues.insert(id, tx);
            let runtime = self.clone();
            tokio::spawn(async move {
                runtime.worker_loop(id, rx).await;
            });
        }
        info!("agent fleet started");
    }

    /// Stop all workers by closing their shutdown token; queued jobs are
    /// abandoned.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.queues.clear();
    }

    /// Enqueue a job for an agent. Blocks when the bounded queue is full,
    /// applying backpressure to the orchestrator.
    pub async fn dispatch(
        &self,
        id: AgentId,
        ctx: AnalysisContext,
        reply: mpsc::Sender<Recommendation>,
    ) -> Result<(), AgentError> {
        let tx = self
            .queues
            .get(&id)
            .map(|tx| tx.clone())
            .ok_or(AgentError::ChannelClosed)?;
        tx.send(AgentJob { ctx, reply })
            .await
            .map_err(|_| AgentError::ChannelClosed)
    }

    async fn worker_loop(&self, id: AgentId, mut rx: mpsc::Receiver<AgentJob>) {
        debug!(agent = %id, "worker started");
        let mut heartbeat = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    self.registry.heartbeat(&id);
                }
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    self.registry.heartbeat(&id);
                    if let Some(recommendation) = self.produce(id, &job.ctx).await {
                        if job.reply.send(recommendation).await.is_err() {
                            debug!(agent = %id, "reply channel closed; round likely over");
                        }
                    }
                }
            }
        }
        debug!(agent = %id, "worker stopped");
    }

    /// Run the role-appropriate analysis and apply any armed chaos
    /// profile to the result.
    async fn produce(&self, id: AgentId, ctx: &AnalysisContext) -> Option<Recommendation> {
        if self.chaos.get(&id) == Some(ChaosProfile::Silent) {
            warn!(agent = %id, "chaos: staying silent");
            return None;
        }

        let produced = match id.role {
            AgentRole::Detection => {
                self.detection
                    .classify(ctx.incident_id, ctx.round, &ctx.signals, &ctx.cancel)
                    .await
            }
            AgentRole::Diagnosis => {
                let metrics = merged_metrics(&ctx.signals);
                self.diagnosis
                    .diagnose(ctx.incident_id, ctx.round, &ctx.source_component, &metrics, &ctx.cancel)
                    .await
            }
            AgentRole::Prediction => {
                self.prediction
                    .forecast(ctx.incident_id, ctx.round, &ctx.title, &ctx.cancel)
                    .await
            }
            AgentRole::Resolution => match &ctx.candidate_plan {
                Some(plan) => self.resolution.endorse(ctx.incident_id, ctx.round, plan),
                None => {
                    let (component, hypothesis) = ctx
                        .root_cause
                        .clone()
                        .unwrap_or_else(|| (ctx.source_component.clone(), ctx.title.clone()));
                    self.resolution
                        .propose(ctx.incident_id, ctx.round, &component, &hypothesis)
                }
            },
            AgentRole::Communication => {
                self.communication
                    .assess(ctx.incident_id, ctx.round, ctx.candidate_plan.as_ref())
            }
        };

        let recommendation = match produced {
            Ok(recommendation) => recommendation,
            Err(AgentError::Cancelled) => return None,
            Err(err) => {
                warn!(agent = %id, error = %err, "agent failed to produce a recommendation");
                return None;
            }
        };

        // With a candidate plan on the table, analysis roles convert an
        // aligned result into an endorsement; a conflicting one stands as
        // dissent.
        let recommendation = match (&ctx.candidate_plan, id.role) {
            (Some(plan), AgentRole::Detection | AgentRole::Diagnosis | AgentRole::Prediction) => {
                if self.endorses(&recommendation, plan) {
                    self.re_sign(Recommendation {
                        action: ProposedAction::ExecutePlan { plan: plan.clone() },
                        ..recommendation
                    })?
                } else {
                    recommendation
                }
            }
            _ => recommendation,
        };

        Some(self.apply_chaos(id, recommendation)?)
    }

    /// Whether an analysis result is consistent with the candidate plan.
    fn endorses(&self, recommendation: &Recommendation, plan: &ActionPlan) -> bool {
        match &recommendation.action {
            ProposedAction::ClassifySeverity { severity, .. } => {
                *severity >= aegis_events::Severity::Medium
            }
            ProposedAction::RootCause { component, .. } => {
                plan.steps.iter().any(|step| step.target == *component)
            }
            ProposedAction::Prevent { .. } => recommendation.confidence >= 0.3,
            ProposedAction::ExecutePlan { plan: own } => own.digest() == plan.digest(),
            ProposedAction::Notify { .. } => true,
        }
    }

    fn apply_chaos(&self, id: AgentId, mut rec: Recommendation) -> Option<Recommendation> {
        match self.chaos.get(&id) {
            Some(ChaosProfile::BadConfidence) => {
                rec.confidence = 1.5;
                self.re_sign(rec)
            }
            Some(ChaosProfile::ForgeSignature) => {
                rec.signature = "ff".repeat(64);
                Some(rec)
            }
            Some(ChaosProfile::Byzantine) => {
                rec.confidence = 1.5;
                rec.signature = "ff".repeat(64);
                Some(rec)
            }
            // Equivocation plays out in the consensus message phases.
            Some(ChaosProfile::Equivocate) | Some(ChaosProfile::Silent) | None => Some(rec),
        }
    }

    fn re_sign(&self, mut rec: Recommendation) -> Option<Recommendation> {
        match self
            .identity
            .sign(&rec.agent_id.to_string(), &rec.signable_bytes())
        {
            Ok(signature) => {
                rec.signature = signature;
                Some(rec)
            }
            Err(err) => {
                warn!(agent = %rec.agent_id, error = %err, "failed to sign recommendation");
                None
            }
        }
    }
}

fn merged_metrics(signals: &[TelemetrySignal]) -> std::collections::BTreeMap<String, f64> {
    let mut merged = std::collections::BTreeMap::new();
    for signal in signals {
        for (metric, value) in &signal.metrics {
            let entry = merged.entry(metric.clone()).or_insert(*value);
            if *value > *entry {
                *entry = *value;
            }
        }
    }
    merged
}
