//! Diagnosis agent: bounded causal analysis over the dependency topology.
//!
//! Traversal is breadth-first with an explicit fan-out bound, a depth
//! bound, and a visited set for cycle detection, so corrupted dependency
//! data cannot send the analysis into a runaway walk.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use aegis_events::{EvidenceRef, IncidentId};
use aegis_identity::IdentityService;
use aegis_resilience::Priority;

use crate::invoke::{GuardedInvoker, GuardedOutcome};
use crate::types::{AgentId, ProposedAction, Recommendation};
use crate::AgentError;

#[derive(Debug, Clone)]
pub struct DiagnosisConfig {
    /// Maximum children expanded per node during causal traversal.
    pub max_fanout: usize,
    /// Maximum traversal depth from the symptom component.
    pub max_depth: usize,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            max_fanout: 8,
            max_depth: 6,
        }
    }
}

/// Service dependency topology: component → components it depends on.
/// May contain cycles; traversal tolerates them.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dependency(&mut self, component: &str, depends_on: &str) {
        self.edges
            .entry(component.to_string())
            .or_default()
            .push(depends_on.to_string());
    }

    fn dependencies(&self, component: &str) -> &[String] {
        self.edges
            .get(component)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

pub struct DiagnosisAgent {
    id: AgentId,
    identity: Arc<IdentityService>,
    invoker: Arc<GuardedInvoker>,
    graph: DependencyGraph,
    config: DiagnosisConfig,
}

impl DiagnosisAgent {
    pub fn new(
        id: AgentId,
        identity: Arc<IdentityService>,
        invoker: Arc<GuardedInvoker>,
        graph: DependencyGraph,
        config: DiagnosisConfig,
    ) -> Self {
        Self {
            id,
            identity,
            invoker,
            graph,
            config,
        }
    }

    /// Produce a root-cause hypothesis for an incident whose symptom
    /// surfaced at `symptom_component`.
    pub async fn diagnose(
        &self,
        incident_id: IncidentId,
        round: u64,
        symptom_component: &str,
        metrics: &BTreeMap<String, f64>,
        cancel: &CancellationToken,
    ) -> Result<Recommendation, AgentError> {
        let candidates = self.causal_candidates(symptom_component, cancel)?;

        let prompt = format!(
            "Rank root-cause candidates {candidates:?} for symptom at {symptom_component} \
             given metrics {}",
            serde_json::to_string(metrics)?
        );
        let outcome = self
            .invoker
            .invoke_json(
                incident_id,
                &self.id.to_string(),
                0.75,
                0.6,
                &prompt,
                512,
                Priority::High,
                Duration::from_secs(30),
                cancel,
            )
            .await;

        let (component, hypothesis, confidence) = match outcome {
            GuardedOutcome::Completed { body, .. } => {
                let ranked = body["root_cause"]
                    .as_str()
                    .filter(|c| candidates.contains(&c.to_string()))
                    .unwrap_or_else(|| candidates.last().map(String::as_str).unwrap_or(symptom_component));
                let hypothesis = body["hypothesis"]
                    .as_str()
                    .unwrap_or("model-ranked causal candidate")
                    .to_string();
                let confidence = body["confidence"].as_f64().unwrap_or(0.6).clamp(0.0, 1.0);
                (ranked.to_string(), hypothesis, confidence)
            }
            GuardedOutcome::Degraded(crate::invoke::DegradeReason::Cancelled) => {
                return Err(AgentError::Cancelled);
            }
            GuardedOutcome::Degraded(reason) => {
                debug!(?reason, "diagnosis degraded to topology heuristic");
                // Deepest candidate on the causal walk is the heuristic
                // root cause; confidence reflects the blind spot.
                let component = candidates
                    .last()
                    .cloned()
                    .unwrap_or_else(|| symptom_component.to_string());
                (
                    component,
                    "deepest upstream dependency on the causal path".to_string(),
                    0.35,
                )
            }
        };

        let mut recommendation = Recommendation {
            id: Uuid::new_v4(),
            agent_id: self.id,
            incident_id,
            round,
            confidence,
            action: ProposedAction::RootCause {
                component: component.clone(),
                hypothesis: hypothesis.clone(),
            },
            evidence: vec![EvidenceRef::Event {
                incident_id,
                version: 0,
            }],
            reasoning: format!("causal path from {symptom_component} to {component}: {hypothesis}"),
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

    /// Bounded BFS over the dependency graph. Visit order is the candidate
    /// order: nearer causes first, deepest last.
    fn causal_candidates(
        &self,
        symptom: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, AgentError> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let mut candidates = Vec::new();

        visited.insert(symptom.to_string());
        queue.push_back((symptom.to_string(), 0usize));

        while let Some((component, depth)) = queue.pop_front() {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if depth >= self.config.max_depth {
                continue;
            }
            for dependency in self.graph.dependencies(&component).iter().take(self.config.max_fanout) {
                if visited.insert(dependency.clone()) {
                    candidates.push(dependency.clone());
                    queue.push_back((dependency.clone(), depth + 1));
                }
            }
        }
        Ok(candidates)
    }
}
