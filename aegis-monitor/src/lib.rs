//! # AEGIS Meta-Health Monitor
//!
//! Watches the watchers: agent liveness, dependency breaker states,
//! consensus success rates, and event backlog depth, on a fixed cadence.
//! When the platform itself degrades past the critical thresholds the
//! monitor raises a meta-incident — an incident whose subject is the
//! incident-response system — which flows through the same pipeline with
//! a reserved tier and may trigger a restricted set of self-healing
//! actions (agent restart, breaker reset, quorum reduction request).
//!
//! The monitor is also the corroborating authority for quarantine:
//! consensus rounds report suspicion, and only cross-round corroboration
//! here makes a quarantine durable.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use aegis_agents::{AgentId, AgentRegistry, AgentState};
use aegis_consensus::{ConsensusStats, SuspicionReport};
use aegis_events::{EventKind, EventPayload, EventStore, IncidentId, Severity};
use aegis_resilience::BreakerRegistry;

const PRODUCER: &str = "monitor";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Probe cadence.
    pub cadence: Duration,

    /// Agent-failure fraction at which the platform counts as degraded /
    /// critical.
    pub degraded_agent_failure: f64,
    pub critical_agent_failure: f64,

    /// Consensus-failure rate at which the platform counts as degraded /
    /// critical.
    pub degraded_consensus_failure: f64,
    pub critical_consensus_failure: f64,

    /// Unresolved meta-incidents older than this escalate to human
    /// takeover.
    pub escalation_timeout: Duration,

    /// Distinct rounds with suspicion reports needed before a probation
    /// agent is durably quarantined.
    pub quarantine_corroboration: u32,

    /// Meta-incident recursion bound; beyond it, straight to human
    /// takeover.
    pub max_meta_depth: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(10),
            degraded_agent_failure: 0.2,
            critical_agent_failure: 0.4,
            degraded_consensus_failure: 0.4,
            critical_consensus_failure: 0.6,
            escalation_timeout: Duration::from_secs(600),
            quarantine_corroboration: 2,
            max_meta_depth: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

/// One probe's findings.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub level: HealthLevel,
    pub agent_healthy_fraction: f64,
    pub consensus_success_rate: f64,
    pub open_breakers: usize,
    pub backlog_depth: usize,
    pub probed_at: DateTime<Utc>,
}

/// Ask the orchestrator to open a meta-incident.
#[derive(Debug, Clone)]
pub struct MetaIncidentRequest {
    pub reason: String,
    pub severity: Severity,
    pub depth: u32,
}

struct OutstandingMeta {
    incident_id: IncidentId,
    created_at: DateTime<Utc>,
}

pub struct MetaHealthMonitor {
    config: MonitorConfig,
    registry: Arc<AgentRegistry>,
    breakers: Arc<BreakerRegistry>,
    stats: Arc<ConsensusStats>,
    store: Arc<EventStore>,
    meta_tx: mpsc::Sender<MetaIncidentRequest>,
    /// Event backlog gauge, updated by the orchestrator's ingest queue.
    backlog: Arc<AtomicUsize>,
    suspicion_rounds: DashMap<AgentId, HashSet<String>>,
    outstanding: Mutex<Vec<OutstandingMeta>>,
}

impl MetaHealthMonitor {
    pub fn new(
        config: MonitorConfig,
        registry: Arc<AgentRegistry>,
        breakers: Arc<BreakerRegistry>,
        stats: Arc<ConsensusStats>,
        store: Arc<EventStore>,
        meta_tx: mpsc::Sender<MetaIncidentRequest>,
    ) -> Self {
        Self {
            config,
            registry,
            breakers,
            stats,
            store,
            meta_tx,
            backlog: Arc::new(AtomicUsize::new(0)),
            suspicion_rounds: DashMap::new(),
            outstanding: Mutex::new(Vec::new()),
        }
    }

    pub fn backlog_gauge(&self) -> Arc<AtomicUsize> {
        self.backlog.clone()
    }

    /// Fixed-cadence probe loop; runs until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.cadence);
        info!("meta-health monitor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.probe().await;
                    debug!(level = ?report.level, "health probe");
                }
            }
        }
        info!("meta-health monitor stopped");
    }

    /// Consume suspicion reports from the consensus engine and apply
    /// cross-round corroboration.
    pub async fn run_suspicions(
        self: Arc<Self>,
        mut reports: mpsc::UnboundedReceiver<SuspicionReport>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                report = reports.recv() => {
                    let Some(report) = report else { break };
                    self.corroborate(report).await;
                }
            }
        }
    }

    /// One health probe: gather inputs, classify, raise a meta-incident on
    /// critical, walk outstanding meta-incidents for escalation.
    pub async fn probe(&self) -> HealthReport {
        let agent_healthy_fraction = self.registry.healthy_fraction();
        let consensus_success_rate = self.stats.success_rate();
        let open_breakers = self.breakers.unhealthy_count();
        let backlog_depth = self.backlog.load(Ordering::Relaxed);

        let agent_failure = 1.0 - agent_healthy_fraction;
        let consensus_failure = 1.0 - consensus_success_rate;

        let level = if agent_failure >= self.config.critical_agent_failure
            || consensus_failure >= self.config.critical_consensus_failure
        {
            HealthLevel::Critical
        } else if agent_failure >= self.config.degraded_agent_failure
            || consensus_failure >= self.config.degraded_consensus_failure
        {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        };

        if level == HealthLevel::Critical {
            warn!(
                agent_failure,
                consensus_failure, open_breakers, "platform critical"
            );
            self.self_heal();
            self.maybe_request_meta(
                format!(
                    "platform critical: agent_failure={agent_failure:.2} \
                     consensus_failure={consensus_failure:.2} open_breakers={open_breakers}"
                ),
                1,
            )
            .await;
        }

        self.escalate_stale_meta().await;

        // Periodic reputation checkpoint; scores are in-memory derived
        // state and this is their durable record between restarts.
        for (agent, reputation) in self.registry.checkpoint() {
            debug!(agent = %agent, reputation, "reputation checkpoint");
        }

        HealthReport {
            level,
            agent_healthy_fraction,
            consensus_success_rate,
            open_breakers,
            backlog_depth,
            probed_at: Utc::now(),
        }
    }

    /// Request a meta-incident unless one is already outstanding or the
    /// recursion bound is hit (then it goes straight to human takeover on
    /// the source stream, handled by the caller).
    pub async fn maybe_request_meta(&self, reason: String, depth: u32) -> bool {
        if depth > self.config.max_meta_depth {
            error!(depth, "meta-incident recursion bound hit; requesting human takeover");
            return false;
        }
        if !self.outstanding.lock().is_empty() {
            debug!("meta-incident already outstanding; not raising another");
            return false;
        }
        let request = MetaIncidentRequest {
            reason,
            severity: Severity::Critical,
            depth,
        };
        self.meta_tx.send(request).await.is_ok()
    }

    /// Record a meta-incident the orchestrator opened for us, for
    /// escalation tracking.
    pub fn note_meta_created(&self, incident_id: IncidentId) {
        self.outstanding.lock().push(OutstandingMeta {
            incident_id,
            created_at: Utc::now(),
        });
    }

    /// Restricted self-healing: reset open breakers and restart agents
    /// that stopped heartbeating. A quorum reduction request is recorded
    /// but requires operator action.
    fn self_heal(&self) {
        for snapshot in self.breakers.snapshots() {
            if snapshot.state != aegis_resilience::BreakerState::Closed {
                info!(dependency = %snapshot.dependency, "self-heal: resetting breaker");
                self.breakers.get(&snapshot.dependency).reset();
            }
        }
        for profile in self.registry.all_profiles() {
            if profile.state == AgentState::Dead {
                info!(agent = %profile.id, "self-heal: restarting dead agent");
                self.registry.restart(&profile.id);
            }
        }
    }

    async fn corroborate(&self, report: SuspicionReport) {
        let mut rounds = self
            .suspicion_rounds
            .entry(report.agent_id)
            .or_insert_with(HashSet::new);
        rounds.insert(report.round_id.to_string());
        let distinct = rounds.len() as u32;
        drop(rounds);

        debug!(agent = %report.agent_id, distinct, reason = %report.reason, "suspicion recorded");

        if distinct >= self.config.quarantine_corroboration
            && self.registry.state(&report.agent_id) == AgentState::Probation
        {
            warn!(agent = %report.agent_id, distinct, "cross-round corroboration; quarantining");
            self.registry
                .set_state(&report.agent_id, AgentState::Quarantined);

            if let Err(err) = self
                .store
                .append_next(report.round_id.incident_id, PRODUCER, EventPayload::Quarantine {
                    agent_id: report.agent_id.to_string(),
                    reason: format!("corroborated across {distinct} rounds: {}", report.reason),
                    durable: true,
                })
                .await
            {
                error!(error = %err, "failed to record durable quarantine");
            }
        }
    }

    /// Walk outstanding meta-incidents: drop resolved ones, escalate the
    /// stale ones to human takeover.
    async fn escalate_stale_meta(&self) {
        let candidates: Vec<(IncidentId, DateTime<Utc>)> = {
            let outstanding = self.outstanding.lock();
            outstanding
                .iter()
                .map(|m| (m.incident_id, m.created_at))
                .collect()
        };

        let mut keep: Vec<IncidentId> = Vec::new();
        for (incident_id, created_at) in candidates {
            let terminal = match self.store.read(incident_id, 0, None).await {
                Ok(events) => events.iter().any(|e| {
                    matches!(e.kind(), EventKind::Resolved | EventKind::Failed)
                        || e.kind() == EventKind::HumanTakeoverRequired
                }),
                Err(_) => true,
            };
            if terminal {
                continue;
            }

            let age = Utc::now() - created_at;
            let limit = chrono::Duration::from_std(self.config.escalation_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
            if age > limit {
                error!(incident = %incident_id, "meta-incident unresolved past escalation timeout");
                let _ = self
                    .store
                    .append_next(incident_id, PRODUCER, EventPayload::HumanTakeoverRequired {
                        reason: "meta-incident unresolved past escalation timeout".to_string(),
                    })
                    .await;
                continue;
            }
            keep.push(incident_id);
        }

        self.outstanding
            .lock()
            .retain(|m| keep.contains(&m.incident_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_agents::{AgentRole, ChaosRegistry, LinearReputation};
    use aegis_consensus::{ConsensusConfig, ConsensusEngine, RoundId};
    use aegis_events::MemoryEventSink;
    use aegis_identity::IdentityService;
    use aegis_resilience::BreakerConfig;

    struct Fixture {
        monitor: Arc<MetaHealthMonitor>,
        registry: Arc<AgentRegistry>,
        store: Arc<EventStore>,
        meta_rx: mpsc::Receiver<MetaIncidentRequest>,
    }

    fn fixture(config: MonitorConfig) -> Fixture {
        let identity = Arc::new(IdentityService::new());
        let registry = Arc::new(AgentRegistry::new(Box::new(LinearReputation::default()), 0.2));
        for role in AgentRole::all() {
            let id = AgentId::new(role, 0);
            let key = identity.register(&id.to_string()).unwrap();
            registry.register(id, hex::encode(key.to_bytes()));
        }
        identity.register(PRODUCER).unwrap();
        identity.register("consensus").unwrap();

        let store = Arc::new(EventStore::new(
            Arc::new(MemoryEventSink::new()),
            identity.clone(),
        ));
        let (engine, _suspicions) = ConsensusEngine::new(
            ConsensusConfig::default(),
            identity.clone(),
            registry.clone(),
            Arc::new(ChaosRegistry::new()),
            store.clone(),
        )
        .unwrap();
        let stats = engine.stats();

        let (meta_tx, meta_rx) = mpsc::channel(4);
        let monitor = Arc::new(MetaHealthMonitor::new(
            config,
            registry.clone(),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            stats.clone(),
            store.clone(),
            meta_tx,
        ));
        Fixture {
            monitor,
            registry,
            store,
            meta_rx,
        }
    }

    fn suspicion(role: AgentRole, round: u64) -> SuspicionReport {
        SuspicionReport {
            agent_id: AgentId::new(role, 0),
            round_id: RoundId {
                incident_id: IncidentId(uuid::Uuid::from_u128(7)),
                round,
            },
            reason: "equivocation".to_string(),
        }
    }

    #[tokio::test]
    async fn healthy_fleet_probes_healthy() {
        let fixture = fixture(MonitorConfig::default());
        let report = fixture.monitor.probe().await;
        assert_eq!(report.level, HealthLevel::Healthy);
        assert_eq!(report.agent_healthy_fraction, 1.0);
    }

    #[tokio::test]
    async fn agent_failures_cross_degraded_then_critical() {
        let mut fixture = fixture(MonitorConfig::default());

        fixture
            .registry
            .set_state(&AgentId::new(AgentRole::Detection, 0), AgentState::Quarantined);
        let report = fixture.monitor.probe().await;
        assert_eq!(report.level, HealthLevel::Degraded);
        assert!(fixture.meta_rx.try_recv().is_err());

        fixture
            .registry
            .set_state(&AgentId::new(AgentRole::Diagnosis, 0), AgentState::Quarantined);
        let report = fixture.monitor.probe().await;
        assert_eq!(report.level, HealthLevel::Critical);

        let request = fixture.meta_rx.recv().await.unwrap();
        assert_eq!(request.severity, Severity::Critical);
        assert_eq!(request.depth, 1);
    }

    #[tokio::test]
    async fn corroborated_suspicion_quarantines_durably() {
        let fixture = fixture(MonitorConfig::default());
        let agent = AgentId::new(AgentRole::Diagnosis, 0);
        fixture.registry.set_state(&agent, AgentState::Probation);

        // First round of suspicion: probation holds.
        fixture.monitor.corroborate(suspicion(AgentRole::Diagnosis, 1)).await;
        assert_eq!(fixture.registry.state(&agent), AgentState::Probation);

        // Second distinct round: durable quarantine plus audit event.
        fixture.monitor.corroborate(suspicion(AgentRole::Diagnosis, 2)).await;
        assert_eq!(fixture.registry.state(&agent), AgentState::Quarantined);

        let incident_id = IncidentId(uuid::Uuid::from_u128(7));
        let events = fixture.store.read(incident_id, 0, None).await.unwrap();
        assert!(events.iter().any(|e| matches!(
            &e.payload,
            EventPayload::Quarantine { durable: true, .. }
        )));
    }

    #[tokio::test]
    async fn repeated_suspicion_in_one_round_is_not_corroboration() {
        let fixture = fixture(MonitorConfig::default());
        let agent = AgentId::new(AgentRole::Prediction, 0);
        fixture.registry.set_state(&agent, AgentState::Probation);

        fixture.monitor.corroborate(suspicion(AgentRole::Prediction, 1)).await;
        fixture.monitor.corroborate(suspicion(AgentRole::Prediction, 1)).await;
        assert_eq!(fixture.registry.state(&agent), AgentState::Probation);
    }

    #[tokio::test]
    async fn stale_meta_incident_escalates_to_human_takeover() {
        let config = MonitorConfig {
            escalation_timeout: Duration::from_millis(0),
            ..MonitorConfig::default()
        };
        let fixture = fixture(config);

        let incident_id = IncidentId::new();
        fixture
            .store
            .append(incident_id, 0, PRODUCER, EventPayload::MetaIncident {
                subject: "platform".into(),
                reason: "consensus failing".into(),
                depth: 1,
            })
            .await
            .unwrap();
        fixture.monitor.note_meta_created(incident_id);

        fixture.monitor.escalate_stale_meta().await;

        let events = fixture.store.read(incident_id, 0, None).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind() == EventKind::HumanTakeoverRequired));
    }

    #[tokio::test]
    async fn meta_recursion_is_depth_capped() {
        let fixture = fixture(MonitorConfig::default());
        assert!(
            !fixture
                .monitor
                .maybe_request_meta("meta about meta".into(), 2)
                .await
        );
    }
}
