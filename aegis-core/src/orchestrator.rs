//! The incident orchestrator: the top-level state machine binding ingest,
//! analysis fan-out, consensus, guarded execution, and escalation.
//!
//! Transitions are driven exclusively by committed events; the aggregate
//! cache here is derived state, rebuilt from the stream on demand. Every
//! long-running stage carries a per-incident cancellation token, and a
//! cancelled stage appends a single audit event and nothing else.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use aegis_agents::{
    AgentId, AgentRole, AgentRuntime, AnalysisContext, DetectionAgent, ProposedAction,
    Recommendation, SignalDeduper, TelemetrySignal,
};
use aegis_consensus::{ConsensusEngine, ConsensusOutcome};
use aegis_events::{
    EventPayload, EventStore, IncidentId, MetricGate, Severity,
};
use aegis_executor::{ExecutionOutcome, ExecutorError, ResolutionExecutor};
use aegis_monitor::{MetaHealthMonitor, MetaIncidentRequest};

use crate::config::AegisConfig;
use crate::types::{tier_for, Incident, IncidentStatus};
use crate::OrchestratorError;

const PRODUCER: &str = "orchestrator";

pub struct IncidentOrchestrator {
    config: AegisConfig,
    store: Arc<EventStore>,
    runtime: Arc<AgentRuntime>,
    engine: Arc<ConsensusEngine>,
    executor: Arc<ResolutionExecutor>,
    monitor: Arc<MetaHealthMonitor>,
    detection: Arc<DetectionAgent>,
    deduper: SignalDeduper,
    signals: DashMap<IncidentId, Vec<TelemetrySignal>>,
    cancels: DashMap<IncidentId, CancellationToken>,
}

impl IncidentOrchestrator {
    pub fn new(
        config: AegisConfig,
        store: Arc<EventStore>,
        runtime: Arc<AgentRuntime>,
        engine: Arc<ConsensusEngine>,
        executor: Arc<ResolutionExecutor>,
        monitor: Arc<MetaHealthMonitor>,
        detection: Arc<DetectionAgent>,
    ) -> Self {
        let dedup_window = chrono::Duration::milliseconds(config.ingest.dedup_window_ms as i64);
        Self {
            config,
            store,
            runtime,
            engine,
            executor,
            monitor,
            detection,
            deduper: SignalDeduper::new(dedup_window),
            signals: DashMap::new(),
            cancels: DashMap::new(),
        }
    }

    /// Ingest one telemetry batch. Signals already seen inside the replay
    /// window are dropped; a batch that is entirely replay yields no
    /// incident. Returns the incident opened for the batch, if any.
    pub async fn ingest_batch(
        self: &Arc<Self>,
        batch: Vec<TelemetrySignal>,
    ) -> Result<Option<IncidentId>, OrchestratorError> {
        let fresh: Vec<TelemetrySignal> = batch
            .into_iter()
            .filter(|signal| self.deduper.admit(&signal.signal_id))
            .collect();
        if fresh.is_empty() {
            debug!("telemetry batch fully deduplicated; nothing to do");
            return Ok(None);
        }

        // Storm shedding happens at the detection buffer; the summary is
        // folded into the incident title so the decision reflects it.
        let storm = self.detection.observe_batch(&fresh);

        let severity = initial_severity(&fresh);
        let source = fresh
            .first()
            .map(|s| s.source.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let title = match &storm {
            Some(summary) => format!(
                "alert storm from {} ({} signals, {} sampled)",
                summary.dominant_source, summary.observed, summary.sampled
            ),
            None => format!("telemetry anomaly at {source}"),
        };

        let incident_id = self
            .open_incident(severity, 0, &source, &title, fresh)
            .await?;
        Ok(Some(incident_id))
    }

    /// Open an incident directly (control API path).
    pub async fn create_incident(
        self: &Arc<Self>,
        severity: Option<Severity>,
        title: &str,
        source: &str,
    ) -> Result<IncidentId, OrchestratorError> {
        self.open_incident(
            severity.unwrap_or(Severity::Medium),
            0,
            source,
            title,
            Vec::new(),
        )
        .await
    }

    /// Open a meta-incident on the monitor's request.
    pub async fn open_meta_incident(
        self: &Arc<Self>,
        request: MetaIncidentRequest,
    ) -> Result<IncidentId, OrchestratorError> {
        let incident_id = self
            .open_incident(
                request.severity,
                request.depth,
                "aegis-platform",
                &request.reason,
                Vec::new(),
            )
            .await?;
        self.monitor.note_meta_created(incident_id);
        Ok(incident_id)
    }

    async fn open_incident(
        self: &Arc<Self>,
        severity: Severity,
        meta_depth: u32,
        source: &str,
        title: &str,
        signals: Vec<TelemetrySignal>,
    ) -> Result<IncidentId, OrchestratorError> {
        let incident_id = IncidentId::new();
        self.store
            .append(incident_id, 0, PRODUCER, EventPayload::Created {
                severity,
                tier: tier_for(severity, meta_depth > 0),
                source: source.to_string(),
                title: title.to_string(),
                meta_depth,
            })
            .await?;
        self.signals.insert(incident_id, signals);
        info!(incident = %incident_id, ?severity, meta_depth, "incident opened");

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.run_incident(incident_id).await {
                error!(incident = %incident_id, error = %err, "incident pipeline failed");
            }
        });
        self.monitor
            .backlog_gauge()
            .store(self.cancels.len() + 1, std::sync::atomic::Ordering::Relaxed);
        Ok(incident_id)
    }

    /// Drive one incident from ANALYZING to a terminal state. Public so
    /// tests can await the pipeline deterministically.
    pub async fn run_incident(
        self: &Arc<Self>,
        incident_id: IncidentId,
    ) -> Result<IncidentStatus, OrchestratorError> {
        let cancel = CancellationToken::new();
        self.cancels.insert(incident_id, cancel.clone());
        let result = self.pipeline(incident_id, cancel.clone()).await;
        // Terminal transition: whatever agent work is still in flight for
        // this incident stops here.
        cancel.cancel();
        self.cancels.remove(&incident_id);
        self.signals.remove(&incident_id);
        self.monitor
            .backlog_gauge()
            .store(self.cancels.len(), std::sync::atomic::Ordering::Relaxed);
        result
    }

    async fn pipeline(
        self: &Arc<Self>,
        incident_id: IncidentId,
        cancel: CancellationToken,
    ) -> Result<IncidentStatus, OrchestratorError> {
        let incident = self
            .incident(incident_id)
            .await?
            .ok_or(OrchestratorError::UnknownIncident(incident_id))?;
        let signals = self
            .signals
            .get(&incident_id)
            .map(|s| s.clone())
            .unwrap_or_default();

        let base_ctx = AnalysisContext {
            incident_id,
            round: 1,
            title: incident.title.clone(),
            source_component: incident.source.clone(),
            signals,
            root_cause: None,
            candidate_plan: None,
            cancel: cancel.clone(),
        };

        // ANALYZING: detection, diagnosis, and prediction fan out
        // concurrently; advance when all have submitted or the stage
        // deadline lapses.
        let analysis = self.analysis_phase(incident_id, &base_ctx, &cancel).await?;
        if cancel.is_cancelled() {
            self.store
                .append_next(incident_id, PRODUCER, EventPayload::Cancelled {
                    stage: "analysis".to_string(),
                })
                .await?;
            return self.current_status(incident_id).await;
        }

        let root_cause = analysis.get(&AgentRole::Diagnosis).and_then(|rec| {
            match &rec.action {
                ProposedAction::RootCause { component, hypothesis } => {
                    Some((component.clone(), hypothesis.clone()))
                }
                _ => None,
            }
        });

        // CONSENSUS → EXECUTING, re-entering consensus after sandbox
        // rejections and clean rollbacks, up to the round bound.
        let max_rounds = self.config.executor.max_remediation_rounds as u64;
        for round in 1..=max_rounds {
            if cancel.is_cancelled() {
                self.store
                    .append_next(incident_id, PRODUCER, EventPayload::Cancelled {
                        stage: format!("consensus round {round}"),
                    })
                    .await?;
                return self.current_status(incident_id).await;
            }

            let candidate = self
                .candidate_plan(incident_id, round, &base_ctx, &root_cause)
                .await?;

            let mut ctx = base_ctx.clone();
            ctx.round = round;
            ctx.root_cause = root_cause.clone();
            ctx.candidate_plan = candidate;

            let (tx, mut rx) = mpsc::channel(16);
            for role in AgentRole::all() {
                let _ = self
                    .runtime
                    .dispatch(AgentId::new(role, 0), ctx.clone(), tx.clone())
                    .await;
            }
            drop(tx);

            let outcome = self.engine.run_round(incident_id, round, &mut rx).await?;
            match outcome {
                ConsensusOutcome::Committed(decision) => {
                    let gates: Vec<MetricGate> = decision
                        .plan
                        .steps
                        .iter()
                        .flat_map(|step| step.success_criteria.clone())
                        .collect();

                    match self
                        .executor
                        .execute(incident_id, &decision, &gates, &cancel)
                        .await
                    {
                        Ok(ExecutionOutcome::Completed) => {
                            self.store
                                .append_next(incident_id, PRODUCER, EventPayload::Resolved {
                                    round,
                                    summary: decision.plan.summary.clone(),
                                })
                                .await?;
                            return Ok(IncidentStatus::Resolved);
                        }
                        Ok(ExecutionOutcome::SandboxRejected { violations }) => {
                            warn!(incident = %incident_id, round, ?violations, "sandbox rejected; re-entering consensus");
                            continue;
                        }
                        Ok(ExecutionOutcome::RolledBack { reason }) => {
                            warn!(incident = %incident_id, round, reason, "plan rolled back; re-entering consensus");
                            continue;
                        }
                        Ok(ExecutionOutcome::RollbackFailed { reason }) => {
                            self.store
                                .append_next(incident_id, PRODUCER, EventPayload::Failed {
                                    reason: format!("rollback failed: {reason}"),
                                    human_takeover: true,
                                })
                                .await?;
                            return Ok(IncidentStatus::Failed);
                        }
                        Err(ExecutorError::Store(err)) => return Err(err.into()),
                        Err(err) => {
                            self.store
                                .append_next(incident_id, PRODUCER, EventPayload::Failed {
                                    reason: err.to_string(),
                                    human_takeover: true,
                                })
                                .await?;
                            return Ok(IncidentStatus::Failed);
                        }
                    }
                }
                ConsensusOutcome::InsufficientQuorum { available, required } => {
                    let reason = format!(
                        "insufficient quorum: {available} of {required} required agents"
                    );
                    return self
                        .escalate_meta(incident_id, incident.meta_depth, &reason)
                        .await;
                }
                ConsensusOutcome::Aborted { reason } => {
                    return self
                        .escalate_meta(incident_id, incident.meta_depth, &reason)
                        .await;
                }
            }
        }

        self.store
            .append_next(incident_id, PRODUCER, EventPayload::Failed {
                reason: format!("remediation not accepted within {max_rounds} rounds"),
                human_takeover: true,
            })
            .await?;
        Ok(IncidentStatus::Failed)
    }

    async fn analysis_phase(
        &self,
        incident_id: IncidentId,
        base_ctx: &AnalysisContext,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<AgentRole, Recommendation>, OrchestratorError> {
        let (tx, mut rx) = mpsc::channel(8);
        let analysts = [AgentRole::Detection, AgentRole::Diagnosis, AgentRole::Prediction];
        for role in analysts {
            let id = AgentId::new(role, 0);
            self.store
                .append_next(incident_id, PRODUCER, EventPayload::AgentJoined {
                    agent_id: id.to_string(),
                    role: role.as_str().to_string(),
                })
                .await?;
            let _ = self
                .runtime
                .dispatch(id, base_ctx.clone(), tx.clone())
                .await;
        }
        drop(tx);

        let mut gathered = BTreeMap::new();
        let deadline = tokio::time::Instant::now() + self.config.analysis_timeout();
        loop {
            if gathered.len() == analysts.len() || cancel.is_cancelled() {
                break;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                self.store
                    .append_next(incident_id, PRODUCER, EventPayload::Timeout {
                        stage: "analysis".to_string(),
                    })
                    .await?;
                break;
            }
            match timeout(remaining, rx.recv()).await {
                Ok(Some(recommendation)) => {
                    gathered.insert(recommendation.agent_id.role, recommendation);
                }
                Ok(None) => break,
                Err(_) => {
                    self.store
                        .append_next(incident_id, PRODUCER, EventPayload::Timeout {
                            stage: "analysis".to_string(),
                        })
                        .await?;
                    break;
                }
            }
        }
        Ok(gathered)
    }

    /// Ask the resolution agent for the round's remediation candidate.
    async fn candidate_plan(
        &self,
        incident_id: IncidentId,
        round: u64,
        base_ctx: &AnalysisContext,
        root_cause: &Option<(String, String)>,
    ) -> Result<Option<aegis_events::ActionPlan>, OrchestratorError> {
        let mut ctx = base_ctx.clone();
        ctx.round = round;
        ctx.root_cause = root_cause.clone();

        let (tx, mut rx) = mpsc::channel(1);
        let _ = self
            .runtime
            .dispatch(AgentId::new(AgentRole::Resolution, 0), ctx, tx)
            .await;

        let candidate = match timeout(self.config.analysis_timeout(), rx.recv()).await {
            Ok(Some(recommendation)) => recommendation.action.plan().cloned(),
            _ => None,
        };
        if candidate.is_none() {
            debug!(incident = %incident_id, round, "no remediation candidate this round");
        }
        Ok(candidate)
    }

    /// Escalate an incident to META: record the escalation, ask the
    /// monitor to open a meta-incident, and fall back to human takeover
    /// when the recursion bound refuses one.
    async fn escalate_meta(
        self: &Arc<Self>,
        incident_id: IncidentId,
        meta_depth: u32,
        reason: &str,
    ) -> Result<IncidentStatus, OrchestratorError> {
        warn!(incident = %incident_id, reason, "escalating to meta-incident");
        self.store
            .append_next(incident_id, PRODUCER, EventPayload::MetaIncident {
                subject: incident_id.to_string(),
                reason: reason.to_string(),
                depth: meta_depth + 1,
            })
            .await?;

        let raised = self
            .monitor
            .maybe_request_meta(reason.to_string(), meta_depth + 1)
            .await;
        if !raised {
            self.store
                .append_next(incident_id, PRODUCER, EventPayload::HumanTakeoverRequired {
                    reason: format!("meta escalation refused: {reason}"),
                })
                .await?;
        }
        Ok(IncidentStatus::Meta)
    }

    /// Cancel an in-flight incident. The pipeline appends exactly one
    /// audit event for the cancelled stage and stops producing.
    pub async fn cancel_incident(&self, incident_id: IncidentId) -> bool {
        match self.cancels.get(&incident_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Current derived state, rebuilt from the stream.
    pub async fn incident(
        &self,
        incident_id: IncidentId,
    ) -> Result<Option<Incident>, OrchestratorError> {
        use aegis_events::EventStoreError;
        let events = match self.store.read(incident_id, 0, None).await {
            Ok(events) => events,
            Err(EventStoreError::UnknownIncident(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Incident::replay(&events))
    }

    async fn current_status(
        &self,
        incident_id: IncidentId,
    ) -> Result<IncidentStatus, OrchestratorError> {
        Ok(self
            .incident(incident_id)
            .await?
            .map(|i| i.status)
            .unwrap_or(IncidentStatus::Failed))
    }
}

/// Creation-time severity: the worst of the hints and a fast metric
/// heuristic, so an obviously cascading batch opens CRITICAL before any
/// agent has spoken.
fn initial_severity(signals: &[TelemetrySignal]) -> Severity {
    let hinted = signals
        .iter()
        .filter_map(|s| s.severity_hint)
        .max()
        .unwrap_or(Severity::Info);

    let mut metric_severity = Severity::Info;
    for signal in signals {
        let error_rate = signal.metrics.get("error_rate").copied().unwrap_or(0.0);
        let pool = signal.metrics.get("connection_pool_util").copied().unwrap_or(0.0);
        let p99 = signal.metrics.get("p99_latency_ms").copied().unwrap_or(0.0);
        let level = if error_rate >= 0.4 || pool >= 0.95 || p99 >= 5_000.0 {
            Severity::Critical
        } else if error_rate >= 0.2 || pool >= 0.8 || p99 >= 2_000.0 {
            Severity::High
        } else {
            Severity::Info
        };
        metric_severity = metric_severity.max(level);
    }

    hinted.max(metric_severity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn signal(id: &str, hint: Option<Severity>, metrics: &[(&str, f64)]) -> TelemetrySignal {
        TelemetrySignal {
            signal_id: id.to_string(),
            timestamp: Utc::now(),
            source: "db-proxy".into(),
            severity_hint: hint,
            metrics: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            tags: Default::default(),
        }
    }

    #[test]
    fn cascade_metrics_open_critical_regardless_of_hint() {
        let batch = vec![signal(
            "s1",
            Some(Severity::High),
            &[("connection_pool_util", 1.0), ("error_rate", 0.47), ("p99_latency_ms", 8500.0)],
        )];
        assert_eq!(initial_severity(&batch), Severity::Critical);
    }

    #[test]
    fn hints_floor_the_severity() {
        let batch = vec![signal("s1", Some(Severity::High), &[("error_rate", 0.01)])];
        assert_eq!(initial_severity(&batch), Severity::High);
        let batch = vec![signal("s1", None, &[])];
        assert_eq!(initial_severity(&batch), Severity::Info);
    }
}
