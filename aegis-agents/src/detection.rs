//! Detection agent: telemetry correlation and severity classification.
//!
//! Keeps a bounded per-signal ring buffer with explicit eviction. Under an
//! alert storm the agent switches to reservoir sampling over the incoming
//! batch and reports a storm summary so the consensus decision reflects
//! the storm rather than a truncated view of it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::seq::index::sample;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use aegis_events::{EvidenceRef, IncidentId, Severity};
use aegis_identity::IdentityService;
use aegis_resilience::Priority;

use crate::interfaces::TelemetrySignal;
use crate::invoke::{GuardedInvoker, GuardedOutcome};
use crate::types::{AgentId, ProposedAction, Recommendation};
use crate::AgentError;

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Ring buffer capacity; the oldest signals are evicted first.
    pub ring_capacity: usize,
    /// Batch size beyond which storm shedding kicks in.
    pub storm_threshold: usize,
    /// Signals kept per batch while shedding.
    pub reservoir_size: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 2048,
            storm_threshold: 256,
            reservoir_size: 64,
        }
    }
}

/// Emitted when a batch was reservoir-sampled instead of fully buffered.
#[derive(Debug, Clone)]
pub struct StormSummary {
    pub observed: usize,
    pub sampled: usize,
    pub dominant_source: String,
}

pub struct DetectionAgent {
    id: AgentId,
    identity: Arc<IdentityService>,
    invoker: Arc<GuardedInvoker>,
    config: DetectionConfig,
    buffer: Mutex<VecDeque<TelemetrySignal>>,
}

impl DetectionAgent {
    pub fn new(
        id: AgentId,
        identity: Arc<IdentityService>,
        invoker: Arc<GuardedInvoker>,
        config: DetectionConfig,
    ) -> Self {
        Self {
            id,
            identity,
            invoker,
            config,
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Fold a telemetry batch into the ring buffer. Returns a storm
    /// summary when the batch tripped reservoir sampling.
    pub fn observe_batch(&self, batch: &[TelemetrySignal]) -> Option<StormSummary> {
        let (kept, summary) = if batch.len() > self.config.storm_threshold {
            let k = self.config.reservoir_size.min(batch.len());
            let sampled = reservoir_sample(batch, k, &mut rand::thread_rng());
            let dominant = dominant_source(batch);
            info!(
                observed = batch.len(),
                sampled = k,
                source = %dominant,
                "alert storm: reservoir sampling engaged"
            );
            (
                sampled,
                Some(StormSummary {
                    observed: batch.len(),
                    sampled: k,
                    dominant_source: dominant,
                }),
            )
        } else {
            (batch.to_vec(), None)
        };

        let mut buffer = self.buffer.lock();
        for signal in kept {
            if buffer.len() >= self.config.ring_capacity {
                buffer.pop_front();
            }
            buffer.push_back(signal);
        }
        summary
    }

    /// Correlate buffered signals for an incident and produce a severity
    /// classification. Consults the model for corroboration; a degraded
    /// model path yields a low-confidence placeholder instead of failing.
    pub async fn classify(
        &self,
        incident_id: IncidentId,
        round: u64,
        signals: &[TelemetrySignal],
        cancel: &CancellationToken,
    ) -> Result<Recommendation, AgentError> {
        let correlated = self.correlate(signals, cancel)?;
        let (heuristic_severity, rationale) = classify_metrics(&correlated);

        let prompt = format!(
            "Classify incident severity. Correlated metrics: {}",
            serde_json::to_string(&correlated)?
        );
        let outcome = self
            .invoker
            .invoke_json(
                incident_id,
                &self.id.to_string(),
                0.6,
                0.3,
                &prompt,
                256,
                Priority::High,
                Duration::from_secs(20),
                cancel,
            )
            .await;

        let (severity, confidence, reasoning) = match outcome {
            GuardedOutcome::Completed { body, .. } => {
                let model_conf = body["confidence"].as_f64().unwrap_or(0.5);
                // The model corroborates or disputes the heuristic; the
                // heuristic severity stands, confidence reflects agreement.
                let agrees = body["severity"]
                    .as_str()
                    .map(|s| s.eq_ignore_ascii_case(&format!("{heuristic_severity:?}")))
                    .unwrap_or(false);
                let confidence = if agrees {
                    (0.6 + 0.4 * model_conf).min(0.95)
                } else {
                    0.55
                };
                (heuristic_severity, confidence, rationale.clone())
            }
            GuardedOutcome::Degraded(crate::invoke::DegradeReason::Cancelled) => {
                return Err(AgentError::Cancelled);
            }
            GuardedOutcome::Degraded(reason) => {
                debug!(?reason, "detection degraded to placeholder classification");
                (heuristic_severity, 0.3, format!("{rationale} (degraded path)"))
            }
        };

        let evidence = signals
            .iter()
            .take(16)
            .map(|s| EvidenceRef::Telemetry {
                signal_id: s.signal_id.clone(),
            })
            .collect();

        self.finish(incident_id, round, severity, confidence, evidence, reasoning)
    }

    fn finish(
        &self,
        incident_id: IncidentId,
        round: u64,
        severity: Severity,
        confidence: f64,
        evidence: Vec<EvidenceRef>,
        reasoning: String,
    ) -> Result<Recommendation, AgentError> {
        let mut recommendation = Recommendation {
            id: Uuid::new_v4(),
            agent_id: self.id,
            incident_id,
            round,
            confidence,
            action: ProposedAction::ClassifySeverity {
                severity,
                rationale: reasoning.clone(),
            },
            evidence,
            reasoning,
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

    /// Merge per-metric maxima across signals. CPU-bound loop; polls the
    /// cancellation token at batch boundaries.
    fn correlate(
        &self,
        signals: &[TelemetrySignal],
        cancel: &CancellationToken,
    ) -> Result<std::collections::BTreeMap<String, f64>, AgentError> {
        let mut merged = std::collections::BTreeMap::new();
        for (i, signal) in signals.iter().enumerate() {
            if i % 64 == 0 && cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            for (metric, value) in &signal.metrics {
                let entry = merged.entry(metric.clone()).or_insert(*value);
                if *value > *entry {
                    *entry = *value;
                }
            }
        }
        Ok(merged)
    }
}

/// Severity heuristic over correlated metric maxima.
fn classify_metrics(metrics: &std::collections::BTreeMap<String, f64>) -> (Severity, String) {
    let error_rate = metrics.get("error_rate").copied().unwrap_or(0.0);
    let pool_util = metrics.get("connection_pool_util").copied().unwrap_or(0.0);
    let p99 = metrics.get("p99_latency_ms").copied().unwrap_or(0.0);

    let severity = if pool_util >= 0.95 || error_rate >= 0.4 || p99 >= 5_000.0 {
        Severity::Critical
    } else if pool_util >= 0.8 || error_rate >= 0.2 || p99 >= 2_000.0 {
        Severity::High
    } else if error_rate >= 0.05 || p99 >= 1_000.0 {
        Severity::Medium
    } else if error_rate > 0.0 || p99 > 500.0 {
        Severity::Low
    } else {
        Severity::Info
    };

    let rationale = format!(
        "error_rate={error_rate:.2} connection_pool_util={pool_util:.2} p99_latency_ms={p99:.0}"
    );
    (severity, rationale)
}

/// Uniform fixed-memory sample of `k` items from a slice.
fn reservoir_sample<R: Rng>(items: &[TelemetrySignal], k: usize, rng: &mut R) -> Vec<TelemetrySignal> {
    if items.len() <= k {
        return items.to_vec();
    }
    sample(rng, items.len(), k)
        .into_iter()
        .map(|i| items[i].clone())
        .collect()
}

fn dominant_source(batch: &[TelemetrySignal]) -> String {
    let mut counts = std::collections::HashMap::new();
    for signal in batch {
        *counts.entry(signal.source.as_str()).or_insert(0usize) += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(source, _)| source.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::ScriptedModelInvoker;
    use crate::types::AgentRole;
    use aegis_resilience::{
        BreakerConfig, BreakerRegistry, BudgetConfig, BudgetEnvelope, CostRouter,
        ModelTier, RateLimitConfig, RateLimiterRegistry, TierProfile,
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn signal(id: &str, metrics: &[(&str, f64)]) -> TelemetrySignal {
        TelemetrySignal {
            signal_id: id.to_string(),
            timestamp: Utc::now(),
            source: "db-proxy".into(),
            severity_hint: None,
            metrics: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            tags: BTreeMap::new(),
        }
    }

    fn agent(invoker: Arc<ScriptedModelInvoker>) -> DetectionAgent {
        let identity = Arc::new(IdentityService::new());
        let id = AgentId::new(AgentRole::Detection, 0);
        identity.register(&id.to_string()).unwrap();
        let budget = Arc::new(BudgetEnvelope::new(BudgetConfig::default()));
        let router = Arc::new(CostRouter::new(
            vec![TierProfile {
                tier: ModelTier::Balanced,
                cost_per_call: 1.0,
                expected_confidence: 0.8,
            }],
            budget,
        ));
        let store = Arc::new(aegis_events::EventStore::new(
            Arc::new(aegis_events::MemoryEventSink::new()),
            identity.clone(),
        ));
        let guarded = Arc::new(GuardedInvoker::new(
            invoker,
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            Arc::new(RateLimiterRegistry::new(RateLimitConfig::default())),
            router,
            store,
        ));
        DetectionAgent::new(id, identity, guarded, DetectionConfig::default())
    }

    #[tokio::test]
    async fn cascade_metrics_classify_critical() {
        let invoker = Arc::new(ScriptedModelInvoker::new());
        invoker.push_json(json!({"severity": "Critical", "confidence": 0.9}));
        let agent = agent(invoker);

        let signals = vec![signal(
            "s1",
            &[("connection_pool_util", 1.0), ("error_rate", 0.47), ("p99_latency_ms", 8500.0)],
        )];
        let rec = agent
            .classify(IncidentId::new(), 1, &signals, &CancellationToken::new())
            .await
            .unwrap();

        match rec.action {
            ProposedAction::ClassifySeverity { severity, .. } => {
                assert_eq!(severity, Severity::Critical)
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert!(rec.confidence > 0.8);
        assert!(!rec.signature.is_empty());
        assert!(!rec.evidence.is_empty());
    }

    #[tokio::test]
    async fn degraded_model_path_yields_low_confidence_placeholder() {
        // Empty script: the invocation errors and retries exhaust.
        let agent = agent(Arc::new(ScriptedModelInvoker::new()));
        let signals = vec![signal("s1", &[("error_rate", 0.5)])];

        let rec = agent
            .classify(IncidentId::new(), 1, &signals, &CancellationToken::new())
            .await
            .unwrap();
        assert!(rec.confidence <= 0.3);
        assert!(rec.reasoning.contains("degraded"));
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let agent = agent(Arc::new(ScriptedModelInvoker::new()));
        let mut config = DetectionConfig::default();
        config.ring_capacity = 4;
        let agent = DetectionAgent { config, ..agent };

        for i in 0..6 {
            agent.observe_batch(&[signal(&format!("s{i}"), &[])]);
        }
        let buffer = agent.buffer.lock();
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.front().unwrap().signal_id, "s2");
    }

    #[test]
    fn alert_storm_triggers_reservoir_sampling() {
        let agent = agent(Arc::new(ScriptedModelInvoker::new()));
        let storm: Vec<TelemetrySignal> = (0..1000)
            .map(|i| signal(&format!("s{i}"), &[("error_rate", 0.9)]))
            .collect();

        let summary = agent.observe_batch(&storm).expect("storm summary");
        assert_eq!(summary.observed, 1000);
        assert_eq!(summary.sampled, DetectionConfig::default().reservoir_size);
        assert_eq!(summary.dominant_source, "db-proxy");
        assert!(agent.buffer.lock().len() <= DetectionConfig::default().reservoir_size);
    }

    #[test]
    fn cancellation_aborts_correlation() {
        let agent = agent(Arc::new(ScriptedModelInvoker::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let signals: Vec<TelemetrySignal> = (0..10).map(|i| signal(&format!("s{i}"), &[])).collect();
        assert!(matches!(
            agent.correlate(&signals, &cancel),
            Err(AgentError::Cancelled)
        ));
    }
}
