//! The guarded execution pipeline: commit gate, sandbox, safety gate,
//! production, regression watch, rollback.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use aegis_events::{
    ActionStep, DecisionRecord, EventPayload, EventStore, IncidentId, MetricGate,
};

use crate::backend::{CredentialHandle, ExecutorBackend};
use crate::ExecutorError;

const PRODUCER: &str = "executor";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Refuse production execution without a passing sandbox run.
    pub sandbox_required: bool,

    /// How long to watch for regressions after the plan completes.
    pub observation_window: Duration,

    /// Number of regression probes spread across the window.
    pub observation_probes: u32,

    /// Step names the deployment declares irreversible regardless of any
    /// declared reversal.
    pub irreversible_steps: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            sandbox_required: true,
            observation_window: Duration::from_secs(60),
            observation_probes: 6,
            irreversible_steps: vec!["kill_query".to_string()],
        }
    }
}

/// Terminal state of one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Sandbox passed, production applied, regression watch clean.
    Completed,
    /// The sandbox run violated the safety gate; nothing touched
    /// production. The orchestrator re-opens consensus.
    SandboxRejected { violations: Vec<String> },
    /// Production ran but was reversed (step failure, regression, or
    /// cancellation) and every reversible step was undone.
    RolledBack { reason: String },
    /// Rollback itself failed; the incident needs a human.
    RollbackFailed { reason: String },
}

pub struct ResolutionExecutor {
    backend: Arc<dyn ExecutorBackend>,
    store: Arc<EventStore>,
    config: ExecutorConfig,
}

impl ResolutionExecutor {
    pub fn new(
        backend: Arc<dyn ExecutorBackend>,
        store: Arc<EventStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            backend,
            store,
            config,
        }
    }

    /// Execute a committed decision. `regression_gates` are the indicators
    /// watched after completion.
    pub async fn execute(
        &self,
        incident_id: IncidentId,
        decision: &DecisionRecord,
        regression_gates: &[MetricGate],
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let plan = &decision.plan;

        // Execution gate: a matching DECISION_COMMITTED event must be
        // durable in the stream before anything runs.
        let committed = self
            .store
            .read(incident_id, 0, None)
            .await?
            .iter()
            .any(|event| match &event.payload {
                EventPayload::DecisionCommitted { decision: recorded } => {
                    recorded.plan.digest() == plan.digest()
                }
                _ => false,
            });
        if !committed {
            return Err(ExecutorError::NoCommittedDecision(plan.digest()));
        }

        // JIT credentials live exactly as long as execution plus the
        // observation window.
        let ttl = self.config.observation_window
            + Duration::from_secs(30 * plan.steps.len().max(1) as u64);
        let credential = self.backend.issue_scope(plan, ttl).await?;
        info!(incident = %incident_id, scope = %credential.scope_id, "credential scope issued");

        if self.config.sandbox_required {
            let violations = self.sandbox_phase(&credential, plan).await?;
            if !violations.is_empty() {
                warn!(incident = %incident_id, ?violations, "sandbox rejected the plan");
                self.store
                    .append_next(incident_id, PRODUCER, EventPayload::SandboxRejected {
                        round: decision.round,
                        violations: violations.clone(),
                    })
                    .await?;
                return Ok(ExecutionOutcome::SandboxRejected { violations });
            }
        }

        // Production, step by step with per-step verification.
        let mut applied: Vec<(usize, &ActionStep)> = Vec::new();
        for (index, step) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                let outcome = self
                    .rollback(incident_id, &credential, &applied, "cancelled mid-execution")
                    .await?;
                return Ok(outcome);
            }
            if !credential.is_valid() {
                return Err(ExecutorError::CredentialExpired);
            }

            let result = self.backend.exec_production(&credential, step).await?;
            self.store
                .append_next(incident_id, PRODUCER, EventPayload::ActionExecuted {
                    round: decision.round,
                    step_index: index,
                    step_name: step.name.clone(),
                    target: step.target.clone(),
                    verified: result.success,
                })
                .await?;

            if !result.success {
                warn!(incident = %incident_id, step = %step.name, "production step failed");
                applied.push((index, step));
                let outcome = self
                    .rollback(
                        incident_id,
                        &credential,
                        &applied,
                        &format!("step {} failed: {}", step.name, result.detail),
                    )
                    .await?;
                return Ok(outcome);
            }
            applied.push((index, step));
            debug!(incident = %incident_id, step = %step.name, "step applied and verified");
        }

        // Regression watch across the observation window.
        if self.regression_watch(regression_gates, cancel).await {
            warn!(incident = %incident_id, "regression detected; rolling back");
            let outcome = self
                .rollback(incident_id, &credential, &applied, "regression detected")
                .await?;
            return Ok(outcome);
        }

        info!(incident = %incident_id, "plan completed; observation window clean");
        Ok(ExecutionOutcome::Completed)
    }

    /// Run every step in the sandbox and collect safety-gate violations.
    async fn sandbox_phase(
        &self,
        credential: &CredentialHandle,
        plan: &aegis_events::ActionPlan,
    ) -> Result<Vec<String>, ExecutorError> {
        let mut violations = Vec::new();
        for step in &plan.steps {
            let metrics = self.backend.exec_sandbox(credential, step).await?;
            for gate in &step.success_criteria {
                let observed = metrics.metrics.get(&gate.metric).copied().unwrap_or(f64::NAN);
                if observed.is_nan() || !gate.admits(observed) {
                    violations.push(format!(
                        "{}: {} = {observed} outside the safety gate",
                        step.name, gate.metric
                    ));
                }
            }
        }
        Ok(violations)
    }

    /// Poll the regression indicators across the observation window;
    /// true means a regression fired.
    async fn regression_watch(
        &self,
        gates: &[MetricGate],
        cancel: &CancellationToken,
    ) -> bool {
        if gates.is_empty() || self.config.observation_probes == 0 {
            return false;
        }
        let names: Vec<String> = gates.iter().map(|g| g.metric.clone()).collect();
        let pause = self.config.observation_window / self.config.observation_probes;

        for _ in 0..self.config.observation_probes {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(pause) => {}
            }
            match self.backend.observe(&names).await {
                Ok(observed) => {
                    for gate in gates {
                        if let Some(value) = observed.get(&gate.metric) {
                            if !gate.admits(*value) {
                                return true;
                            }
                        }
                    }
                }
                Err(err) => {
                    // A blind regression watch is treated as regression;
                    // silent failure must not look like success.
                    error!(error = %err, "regression probe failed");
                    return true;
                }
            }
        }
        false
    }

    /// Reverse applied steps in reverse order, emitting a rollback event
    /// per step. Irreversible steps are recorded as such (P6).
    async fn rollback(
        &self,
        incident_id: IncidentId,
        credential: &CredentialHandle,
        applied: &[(usize, &ActionStep)],
        reason: &str,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let mut failed = false;

        for (index, step) in applied.iter().rev() {
            let irreversible = step.reversal.is_none()
                || self.config.irreversible_steps.contains(&step.name);

            let (reversed, error) = if irreversible {
                (false, Some("declared irreversible".to_string()))
            } else {
                let reversal = step.reversal.as_ref().expect("checked above");
                match self.backend.reverse(credential, reversal).await {
                    Ok(result) if result.success => (true, None),
                    Ok(result) => {
                        failed = true;
                        (false, Some(result.detail))
                    }
                    Err(err) => {
                        failed = true;
                        (false, Some(err.to_string()))
                    }
                }
            };

            self.store
                .append_next(incident_id, PRODUCER, EventPayload::Rollback {
                    step_index: *index,
                    step_name: step.name.clone(),
                    reversed,
                    irreversible,
                    error,
                })
                .await?;
        }

        if failed {
            error!(incident = %incident_id, reason, "rollback incomplete; human takeover required");
            Ok(ExecutionOutcome::RollbackFailed {
                reason: reason.to_string(),
            })
        } else {
            Ok(ExecutionOutcome::RolledBack {
                reason: reason.to_string(),
            })
        }
    }
}
