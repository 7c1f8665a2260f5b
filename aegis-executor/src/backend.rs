//! Execution backend boundary: sandbox replicas, production actions,
//! reversals, and just-in-time credential scopes.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use aegis_events::{ActionPlan, ActionStep, ReversalStep};

use crate::ExecutorError;

/// Metrics observed while running a step in the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    pub metrics: BTreeMap<String, f64>,
}

/// Result of a production or reversal action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub detail: String,
}

/// Short-lived credential minted for exactly one plan's actions.
#[derive(Debug, Clone)]
pub struct CredentialHandle {
    pub scope_id: String,
    pub allowed_actions: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl CredentialHandle {
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }

    pub fn permits(&self, action: &str) -> bool {
        self.is_valid() && self.allowed_actions.iter().any(|a| a == action)
    }
}

/// Sandbox/production execution boundary.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Mint a credential scoped to the plan's declared actions with the
    /// given TTL.
    async fn issue_scope(
        &self,
        plan: &ActionPlan,
        ttl: Duration,
    ) -> Result<CredentialHandle, ExecutorError>;

    /// Run a step against isolated infrastructure (read-only replicas,
    /// ephemeral namespaces) and report observed metrics.
    async fn exec_sandbox(
        &self,
        credential: &CredentialHandle,
        step: &ActionStep,
    ) -> Result<StepMetrics, ExecutorError>;

    /// Apply a step to production.
    async fn exec_production(
        &self,
        credential: &CredentialHandle,
        step: &ActionStep,
    ) -> Result<StepResult, ExecutorError>;

    /// Apply a step's declared reversal.
    async fn reverse(
        &self,
        credential: &CredentialHandle,
        reversal: &ReversalStep,
    ) -> Result<StepResult, ExecutorError>;

    /// Sample the named metrics from production, for regression watching.
    async fn observe(&self, metrics: &[String]) -> Result<BTreeMap<String, f64>, ExecutorError>;
}

/// Scriptable in-memory backend for tests and demo scenarios.
///
/// By default every sandbox run satisfies the step's success criteria,
/// production succeeds, reversals succeed, and observed metrics are
/// healthy. Individual steps and metrics can be scripted to fail.
pub struct MockExecutorBackend {
    sandbox_overrides: Mutex<BTreeMap<String, BTreeMap<String, f64>>>,
    production_failures: Mutex<HashSet<String>>,
    reversal_failures: Mutex<HashSet<String>>,
    observed: Mutex<BTreeMap<String, f64>>,
    pub production_log: Mutex<Vec<String>>,
    pub reversal_log: Mutex<Vec<String>>,
}

impl MockExecutorBackend {
    pub fn new() -> Self {
        Self {
            sandbox_overrides: Mutex::new(BTreeMap::new()),
            production_failures: Mutex::new(HashSet::new()),
            reversal_failures: Mutex::new(HashSet::new()),
            observed: Mutex::new(BTreeMap::new()),
            production_log: Mutex::new(Vec::new()),
            reversal_log: Mutex::new(Vec::new()),
        }
    }

    /// Script the sandbox metrics for a step.
    pub fn sandbox_metrics(&self, step_name: &str, metric: &str, value: f64) {
        self.sandbox_overrides
            .lock()
            .entry(step_name.to_string())
            .or_default()
            .insert(metric.to_string(), value);
    }

    pub fn fail_production(&self, step_name: &str) {
        self.production_failures.lock().insert(step_name.to_string());
    }

    pub fn fail_reversal(&self, reversal_name: &str) {
        self.reversal_failures.lock().insert(reversal_name.to_string());
    }

    /// Script an observed production metric (for regression watching).
    pub fn set_observed(&self, metric: &str, value: f64) {
        self.observed.lock().insert(metric.to_string(), value);
    }
}

impl Default for MockExecutorBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutorBackend for MockExecutorBackend {
    async fn issue_scope(
        &self,
        plan: &ActionPlan,
        ttl: Duration,
    ) -> Result<CredentialHandle, ExecutorError> {
        let allowed_actions = plan
            .steps
            .iter()
            .flat_map(|step| {
                let mut actions = vec![step.name.clone()];
                if let Some(reversal) = &step.reversal {
                    actions.push(reversal.name.clone());
                }
                actions
            })
            .collect();
        Ok(CredentialHandle {
            scope_id: format!("scope-{}", uuid::Uuid::new_v4()),
            allowed_actions,
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5)),
        })
    }

    async fn exec_sandbox(
        &self,
        credential: &CredentialHandle,
        step: &ActionStep,
    ) -> Result<StepMetrics, ExecutorError> {
        if !credential.permits(&step.name) {
            return Err(ExecutorError::CredentialExpired);
        }

        let overrides = self.sandbox_overrides.lock();
        let scripted = overrides.get(&step.name);
        let mut metrics = BTreeMap::new();
        for gate in &step.success_criteria {
            let value = scripted
                .and_then(|m| m.get(&gate.metric).copied())
                .unwrap_or_else(|| gate.max.or(gate.min).unwrap_or(0.0));
            metrics.insert(gate.metric.clone(), value);
        }
        Ok(StepMetrics { metrics })
    }

    async fn exec_production(
        &self,
        credential: &CredentialHandle,
        step: &ActionStep,
    ) -> Result<StepResult, ExecutorError> {
        if !credential.permits(&step.name) {
            return Err(ExecutorError::CredentialExpired);
        }
        self.production_log.lock().push(step.name.clone());
        if self.production_failures.lock().contains(&step.name) {
            return Ok(StepResult {
                success: false,
                detail: format!("{} failed in production", step.name),
            });
        }
        Ok(StepResult {
            success: true,
            detail: format!("{} applied", step.name),
        })
    }

    async fn reverse(
        &self,
        credential: &CredentialHandle,
        reversal: &ReversalStep,
    ) -> Result<StepResult, ExecutorError> {
        if !credential.permits(&reversal.name) {
            return Err(ExecutorError::CredentialExpired);
        }
        self.reversal_log.lock().push(reversal.name.clone());
        if self.reversal_failures.lock().contains(&reversal.name) {
            return Ok(StepResult {
                success: false,
                detail: format!("reversal {} failed", reversal.name),
            });
        }
        Ok(StepResult {
            success: true,
            detail: format!("{} reversed", reversal.name),
        })
    }

    async fn observe(&self, metrics: &[String]) -> Result<BTreeMap<String, f64>, ExecutorError> {
        let observed = self.observed.lock();
        Ok(metrics
            .iter()
            .map(|name| (name.clone(), observed.get(name).copied().unwrap_or(0.0)))
            .collect())
    }
}
