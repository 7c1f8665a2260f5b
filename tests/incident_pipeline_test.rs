//! End-to-end scenarios for the incident pipeline: ingest → analysis →
//! consensus → guarded execution → resolution, with Byzantine agents,
//! view changes, budget exhaustion, sandbox rejection, chain tampering,
//! and cancellation. Everything runs in-process against the in-memory
//! adapters.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use aegis_agents::{
    AgentId, AgentRole, ChannelTelemetrySource, ChaosProfile, DependencyGraph, InvocationResult,
    ModelError, ModelInvoker, RecordingChannel, StaticModelInvoker, StaticVectorMemory,
    TelemetrySignal,
};
use aegis_core::{AegisConfig, AegisPlatform, Incident, IncidentStatus, PlatformDeps};
use aegis_events::{
    EventKind, EventPayload, IncidentId, MemoryEventSink, Severity,
};
use aegis_executor::MockExecutorBackend;
use aegis_resilience::ModelTier;

struct TestPlatform {
    platform: Arc<AegisPlatform>,
    sink: Arc<MemoryEventSink>,
    backend: Arc<MockExecutorBackend>,
    channel: Arc<RecordingChannel>,
}

fn fast_config() -> AegisConfig {
    let mut config = AegisConfig::default();
    config.consensus.phase_timeout_ms = 100;
    config.consensus.submission_window_ms = 400;
    config.consensus.view_change_timeout_ms = 100;
    config.ingest.analysis_timeout_ms = 1_500;
    config.executor.observation_window_ms = 60;
    config.executor.observation_probes = 3;
    config.executor.max_remediation_rounds = 2;
    config
}

fn build(config: AegisConfig, invoker: Arc<dyn ModelInvoker>) -> TestPlatform {
    let sink = Arc::new(MemoryEventSink::new());
    let backend = Arc::new(MockExecutorBackend::new());
    let channel = Arc::new(RecordingChannel::new());

    let mut memory = StaticVectorMemory::new();
    memory.insert(
        "seed-db-cascade",
        "database connection pool exhaustion cascade",
        serde_json::json!({ "cascaded": true }),
    );
    let mut topology = DependencyGraph::new();
    topology.add_dependency("db-proxy", "db-primary");

    let (_telemetry_tx, telemetry) = ChannelTelemetrySource::new(16);
    let platform = AegisPlatform::build(config, PlatformDeps {
        invoker,
        memory: Arc::new(memory),
        sink: sink.clone(),
        backend: backend.clone(),
        notifications: channel.clone(),
        telemetry: Arc::new(telemetry),
        topology,
    })
    .expect("platform assembly");
    platform.start();

    TestPlatform {
        platform,
        sink,
        backend,
        channel,
    }
}

fn cascade_batch(tag: &str) -> Vec<TelemetrySignal> {
    vec![TelemetrySignal {
        signal_id: format!("cascade-{tag}"),
        timestamp: Utc::now(),
        source: "db-proxy".to_string(),
        severity_hint: Some(Severity::High),
        metrics: BTreeMap::from([
            ("connection_pool_util".to_string(), 1.0),
            ("error_rate".to_string(), 0.47),
            ("p99_latency_ms".to_string(), 8500.0),
        ]),
        tags: BTreeMap::new(),
    }]
}

async fn await_terminal(test: &TestPlatform, incident_id: IncidentId, limit: Duration) -> Incident {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Ok(Some(incident)) = test.platform.orchestrator.incident(incident_id).await {
            if incident.status.is_terminal() || incident.status == IncidentStatus::Meta {
                return incident;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "incident {incident_id} did not reach a terminal state in time"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn database_cascade_resolves_end_to_end() {
    let test = build(fast_config(), Arc::new(StaticModelInvoker::new(0.8)));

    let incident_id = test
        .platform
        .orchestrator
        .ingest_batch(cascade_batch("s1"))
        .await
        .unwrap()
        .expect("fresh batch opens an incident");

    let incident = await_terminal(&test, incident_id, Duration::from_secs(10)).await;
    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert_eq!(incident.severity, Severity::Critical);
    assert_eq!(incident.tier, 1);

    let events = test.platform.store.read(incident_id, 0, None).await.unwrap();

    // The committed decision carries the remediation playbook.
    let decision = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::DecisionCommitted { decision } => Some(decision.clone()),
            _ => None,
        })
        .expect("a committed decision");
    let step_names: Vec<&str> = decision.plan.steps.iter().map(|s| s.name.as_str()).collect();
    assert!(step_names.contains(&"kill_query"));
    assert!(step_names.contains(&"scale_pool"));
    assert!(decision.quorum.len() >= 3);

    // Every plan step executed and verified, then the incident resolved.
    let executed = events
        .iter()
        .filter(|e| matches!(&e.payload, EventPayload::ActionExecuted { verified: true, .. }))
        .count();
    assert_eq!(executed, 2);
    assert!(events.iter().any(|e| e.kind() == EventKind::Resolved));

    // The audit chain checks out end to end, and the derived aggregate
    // tracks the stream head.
    assert!(test.platform.store.verify_chain(incident_id).await.unwrap());
    assert_eq!(incident.version, events.last().unwrap().version);

    // Stakeholders heard about the decision and the resolution, once each.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let stages: Vec<String> = test
            .channel
            .sent
            .lock()
            .iter()
            .filter_map(|(_, payload)| payload["stage"].as_str().map(String::from))
            .collect();
        if stages.contains(&"decision".to_string()) && stages.contains(&"resolved".to_string()) {
            assert_eq!(stages.iter().filter(|s| *s == "decision").count(), 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "notifications never arrived");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn duplicate_signal_ids_yield_one_incident() {
    let test = build(fast_config(), Arc::new(StaticModelInvoker::new(0.8)));

    let first = test
        .platform
        .orchestrator
        .ingest_batch(cascade_batch("dup"))
        .await
        .unwrap();
    assert!(first.is_some());

    // Same signal id inside the replay window: no second incident.
    let second = test
        .platform
        .orchestrator
        .ingest_batch(cascade_batch("dup"))
        .await
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn byzantine_diagnosis_is_flagged_and_consensus_survives() {
    let test = build(fast_config(), Arc::new(StaticModelInvoker::new(0.8)));
    let diagnosis = AgentId::new(AgentRole::Diagnosis, 0);
    test.platform.chaos.set(diagnosis, ChaosProfile::Byzantine);

    let incident_id = test
        .platform
        .orchestrator
        .ingest_batch(cascade_batch("byz"))
        .await
        .unwrap()
        .unwrap();

    let incident = await_terminal(&test, incident_id, Duration::from_secs(10)).await;
    assert_eq!(incident.status, IncidentStatus::Resolved);

    let events = test.platform.store.read(incident_id, 0, None).await.unwrap();
    let decision = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::DecisionCommitted { decision } => Some(decision.clone()),
            _ => None,
        })
        .expect("consensus survived the adversary");

    // The honest four carried the decision with quorum 2f+1 = 3.
    assert_eq!(decision.contributing.len(), 4);
    assert!(decision.quorum.len() >= 3);
    assert!(!decision
        .contributing
        .iter()
        .any(|c| c.agent_id == diagnosis.to_string()));

    // The adversary was flagged, penalized, and audited.
    assert!(test.platform.registry.reputation(&diagnosis) < 0.5);
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::Quarantine { agent_id, durable: false, .. }
            if agent_id == &diagnosis.to_string()
    )));
}

#[tokio::test]
async fn silent_primary_forces_a_view_change_and_still_resolves() {
    let test = build(fast_config(), Arc::new(StaticModelInvoker::new(0.8)));
    // detection-0 is first in stable order, hence primary in view 0.
    test.platform
        .chaos
        .set(AgentId::new(AgentRole::Detection, 0), ChaosProfile::Silent);

    let incident_id = test
        .platform
        .orchestrator
        .ingest_batch(cascade_batch("vc"))
        .await
        .unwrap()
        .unwrap();

    let incident = await_terminal(&test, incident_id, Duration::from_secs(10)).await;
    assert_eq!(incident.status, IncidentStatus::Resolved);

    let events = test.platform.store.read(incident_id, 0, None).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::ConsensusPhase { phase, .. } if phase == "VIEW_CHANGE"
    )));
    let decision = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::DecisionCommitted { decision } => Some(decision.clone()),
            _ => None,
        })
        .unwrap();
    assert!(decision.view >= 1, "decision committed under a later view");
}

#[tokio::test]
async fn budget_exhaustion_is_audited_and_consensus_still_commits() {
    let mut config = fast_config();
    config.budget.hourly_cap = 4.5;
    config.budget.daily_cap = 100.0;
    let test = build(config, Arc::new(StaticModelInvoker::new(0.8)));

    let incident_id = test
        .platform
        .orchestrator
        .ingest_batch(cascade_batch("budget"))
        .await
        .unwrap()
        .unwrap();

    let incident = await_terminal(&test, incident_id, Duration::from_secs(10)).await;
    assert_eq!(incident.status, IncidentStatus::Resolved);

    // At least one invocation was refused and audited; spend never
    // exceeded the envelope.
    let events = test.platform.store.read(incident_id, 0, None).await.unwrap();
    assert!(events.iter().any(|e| e.kind() == EventKind::BudgetDenied));
    let snapshot = test.platform.budget.snapshot();
    assert!(snapshot.hourly_spent <= 4.5 + f64::EPSILON);
}

#[tokio::test]
async fn persistent_sandbox_rejection_fails_the_incident() {
    let test = build(fast_config(), Arc::new(StaticModelInvoker::new(0.8)));
    // The sandbox replica keeps showing a violated gate.
    test.backend.sandbox_metrics("kill_query", "active_queries", 500.0);

    let incident_id = test
        .platform
        .orchestrator
        .ingest_batch(cascade_batch("sandbox"))
        .await
        .unwrap()
        .unwrap();

    let incident = await_terminal(&test, incident_id, Duration::from_secs(15)).await;
    assert_eq!(incident.status, IncidentStatus::Failed);
    assert!(incident.human_takeover);

    let events = test.platform.store.read(incident_id, 0, None).await.unwrap();
    let rejections = events
        .iter()
        .filter(|e| e.kind() == EventKind::SandboxRejected)
        .count();
    assert_eq!(rejections, 2, "one rejection per bounded remediation round");

    // Nothing ever touched production.
    assert!(test.backend.production_log.lock().is_empty());
}

#[tokio::test]
async fn tampering_fences_the_stream_and_alerts_the_monitor() {
    let test = build(fast_config(), Arc::new(StaticModelInvoker::new(0.8)));
    let mut alerts = test.platform.store.integrity_alerts();

    let incident_id = test
        .platform
        .orchestrator
        .ingest_batch(cascade_batch("tamper"))
        .await
        .unwrap()
        .unwrap();
    await_terminal(&test, incident_id, Duration::from_secs(10)).await;

    // Flip one byte of a committed record in the sink.
    assert!(test.sink.corrupt(&format!("incidents/{incident_id}"), 1, 40));

    let err = test.platform.store.read(incident_id, 0, None).await.unwrap_err();
    assert!(matches!(err, aegis_events::EventStoreError::Integrity { .. }));
    assert!(!test.platform.store.verify_chain(incident_id).await.unwrap());

    // The stream is fenced: the orchestrator can write nothing further.
    let refused = test
        .platform
        .store
        .append_next(incident_id, "orchestrator", EventPayload::Timeout {
            stage: "post-tamper".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(refused, aegis_events::EventStoreError::Fenced(_)));

    // The monitor heard about it.
    let alert = alerts.recv().await.unwrap();
    assert_eq!(alert.incident_id, incident_id);
}

/// Model invoker that hangs long enough for cancellation to land first.
struct HangingModelInvoker;

#[async_trait]
impl ModelInvoker for HangingModelInvoker {
    async fn invoke(
        &self,
        _tier: ModelTier,
        _prompt: &str,
        _max_tokens: u32,
        _deadline: Duration,
    ) -> Result<InvocationResult, ModelError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(ModelError::Timeout)
    }
}

#[tokio::test]
async fn cancellation_leaves_no_partial_history() {
    let test = build(fast_config(), Arc::new(HangingModelInvoker));

    let incident_id = test
        .platform
        .orchestrator
        .ingest_batch(cascade_batch("cancel"))
        .await
        .unwrap()
        .unwrap();

    // Let the analysis fan-out block inside the hanging model call.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(test.platform.orchestrator.cancel_incident(incident_id).await);

    // The pipeline winds down with exactly one audit event.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let events = test.platform.store.read(incident_id, 0, None).await.unwrap();
        if events.iter().any(|e| e.kind() == EventKind::Cancelled) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "cancellation never landed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let events = test.platform.store.read(incident_id, 0, None).await.unwrap();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind()).collect();

    // The log holds creation, the analysis fan-out joins, and the single
    // cancellation marker. No recommendation, decision, or execution
    // event ever landed, and nothing follows the cancellation.
    assert_eq!(kinds.first(), Some(&EventKind::Created));
    assert_eq!(kinds.last(), Some(&EventKind::Cancelled));
    for kind in &kinds[1..kinds.len() - 1] {
        assert_eq!(*kind, EventKind::AgentJoined);
    }
    for forbidden in [
        EventKind::RecommendationSubmitted,
        EventKind::DecisionCommitted,
        EventKind::ActionExecuted,
        EventKind::Rollback,
    ] {
        assert!(!kinds.contains(&forbidden));
    }
    assert!(test.platform.store.verify_chain(incident_id).await.unwrap());
}
