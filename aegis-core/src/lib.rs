//! # AEGIS Core — Platform Orchestration
//!
//! The composition root and top-level incident state machine for the
//! autonomous incident-response platform. This crate owns:
//!
//! - **Configuration**: the full recognized option surface with defaults,
//!   file loading, and validation.
//! - **The incident aggregate**: derived purely by event replay, so every
//!   cache in the system is rebuildable from the log.
//! - **The incident orchestrator**: ingest → detect → diagnose/predict →
//!   consensus → execute → communicate, with cancellation flowing down and
//!   meta-incident escalation flowing back up.
//! - **`AegisPlatform`**: explicit construction of the process-wide
//!   singletons (event store, breaker registry, budget envelope, agent
//!   fleet, consensus engine, monitor, executor) with injection by handle
//!   and topological shutdown. No ambient state.
//!
//! External collaborators — model providers, vector memory, the durable
//! event sink, executor backends, notification channels, telemetry
//! sources — arrive as trait objects through [`PlatformDeps`].

mod config;
mod orchestrator;
mod types;

pub use config::{
    AegisConfig, ApiConfig, BreakerSection, BudgetSection, ConsensusTimingConfig,
    ExecutorSection, IngestConfig, MonitorSection, QuorumConfig, RateLimitSection,
    ReputationConfig,
};
pub use orchestrator::IncidentOrchestrator;
pub use types::{tier_for, Incident, IncidentStatus};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use aegis_agents::{
    AgentId, AgentRegistry, AgentRole, AgentRuntime, ChaosRegistry, CommunicationAgent,
    DependencyGraph, DetectionAgent, DetectionConfig, DiagnosisAgent, DiagnosisConfig,
    GuardedInvoker, LinearReputation, ModelInvoker, NotificationChannel, PredictionAgent,
    PredictionConfig, ResolutionAgent, TelemetrySource, VectorMemory,
};
use aegis_consensus::{ConsensusConfig, ConsensusEngine, SuspicionReport};
use aegis_events::{EventSink, EventStore, IncidentId};
use aegis_executor::{ExecutorBackend, ExecutorConfig, ResolutionExecutor};
use aegis_identity::IdentityService;
use aegis_monitor::{MetaHealthMonitor, MetaIncidentRequest, MonitorConfig};
use aegis_resilience::{
    BreakerConfig, BreakerRegistry, BudgetConfig, BudgetEnvelope, CostRouter, ModelTier,
    RateLimitConfig, RateLimiterRegistry, TierProfile,
};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown incident {0}")]
    UnknownIncident(IncidentId),

    #[error("event store error: {0}")]
    Store(#[from] aegis_events::EventStoreError),

    #[error("agent runtime error: {0}")]
    Agent(#[from] aegis_agents::AgentError),

    #[error("consensus error: {0}")]
    Consensus(#[from] aegis_consensus::ConsensusError),

    #[error("executor error: {0}")]
    Executor(#[from] aegis_executor::ExecutorError),
}

/// External collaborators injected at the composition root.
pub struct PlatformDeps {
    pub invoker: Arc<dyn ModelInvoker>,
    pub memory: Arc<dyn VectorMemory>,
    pub sink: Arc<dyn EventSink>,
    pub backend: Arc<dyn ExecutorBackend>,
    pub notifications: Arc<dyn NotificationChannel>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub topology: DependencyGraph,
}

/// The assembled platform: every subsystem constructed once, injected by
/// handle, started together, and shut down in topological order.
pub struct AegisPlatform {
    pub config: AegisConfig,
    pub identity: Arc<IdentityService>,
    pub store: Arc<EventStore>,
    pub registry: Arc<AgentRegistry>,
    pub chaos: Arc<ChaosRegistry>,
    pub breakers: Arc<BreakerRegistry>,
    pub budget: Arc<BudgetEnvelope>,
    pub runtime: Arc<AgentRuntime>,
    pub engine: Arc<ConsensusEngine>,
    pub monitor: Arc<MetaHealthMonitor>,
    pub orchestrator: Arc<IncidentOrchestrator>,
    communication: Arc<CommunicationAgent>,
    telemetry: Arc<dyn TelemetrySource>,
    meta_rx: Mutex<Option<mpsc::Receiver<MetaIncidentRequest>>>,
    suspicion_rx: Mutex<Option<mpsc::UnboundedReceiver<SuspicionReport>>>,
    shutdown: CancellationToken,
}

impl AegisPlatform {
    /// Construct every subsystem. Nothing starts running until
    /// [`start`] is called.
    ///
    /// [`start`]: AegisPlatform::start
    pub fn build(config: AegisConfig, deps: PlatformDeps) -> Result<Arc<Self>> {
        config.validate()?;
        info!(n = config.quorum.n, f = config.quorum.f, "assembling platform");

        // Identities: the five agents plus the internal producers that
        // sign audit events.
        let identity = Arc::new(IdentityService::new());
        for producer in ["orchestrator", "consensus", "executor", "monitor"] {
            identity.register(producer)?;
        }

        let registry = Arc::new(AgentRegistry::new(
            Box::new(LinearReputation {
                delta_reward: config.reputation.delta_reward,
                delta_penalty: config.reputation.delta_penalty,
            }),
            config.reputation.quarantine_threshold,
        ));
        for role in AgentRole::all() {
            let id = AgentId::new(role, 0);
            identity.register(&id.to_string())?;
            let key_hex = identity
                .public_key_hex(&id.to_string())
                .expect("identity was just registered");
            registry.register(id, key_hex);
        }

        let store = Arc::new(EventStore::new(deps.sink, identity.clone()));
        let chaos = Arc::new(ChaosRegistry::new());

        // Process-wide resilience singletons.
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: config.breaker.failure_threshold,
            failure_rate_threshold: config.breaker.failure_rate_threshold,
            window: Duration::from_millis(config.breaker.window_ms),
            min_window_calls: config.breaker.min_window_calls,
            cooldown: Duration::from_millis(config.breaker.cooldown_ms),
            halfopen_probes: config.breaker.halfopen_probes,
        }));
        let limits = Arc::new(RateLimiterRegistry::new(RateLimitConfig {
            rps: config.ratelimit.default_rps,
            burst: config.ratelimit.default_burst,
        }));
        limits.configure("model", RateLimitConfig {
            rps: config.ratelimit.model_rps,
            burst: config.ratelimit.model_burst,
        });
        limits.configure("memory", RateLimitConfig {
            rps: config.ratelimit.memory_rps,
            burst: config.ratelimit.memory_burst,
        });
        let budget = Arc::new(BudgetEnvelope::new(BudgetConfig {
            hourly_cap: config.budget.hourly_cap,
            daily_cap: config.budget.daily_cap,
        }));
        let router = Arc::new(CostRouter::new(
            vec![
                TierProfile {
                    tier: ModelTier::FastCheap,
                    cost_per_call: config.budget.cost_fast,
                    expected_confidence: config.budget.confidence_fast,
                },
                TierProfile {
                    tier: ModelTier::Balanced,
                    cost_per_call: config.budget.cost_balanced,
                    expected_confidence: config.budget.confidence_balanced,
                },
                TierProfile {
                    tier: ModelTier::SlowAccurate,
                    cost_per_call: config.budget.cost_accurate,
                    expected_confidence: config.budget.confidence_accurate,
                },
            ],
            budget.clone(),
        ));
        let guarded = Arc::new(GuardedInvoker::new(
            deps.invoker,
            breakers.clone(),
            limits.clone(),
            router,
            store.clone(),
        ));

        // The agent fleet.
        let detection = Arc::new(DetectionAgent::new(
            AgentId::new(AgentRole::Detection, 0),
            identity.clone(),
            guarded.clone(),
            DetectionConfig::default(),
        ));
        let diagnosis = Arc::new(DiagnosisAgent::new(
            AgentId::new(AgentRole::Diagnosis, 0),
            identity.clone(),
            guarded.clone(),
            deps.topology,
            DiagnosisConfig::default(),
        ));
        let prediction = Arc::new(PredictionAgent::new(
            AgentId::new(AgentRole::Prediction, 0),
            identity.clone(),
            deps.memory,
            breakers.clone(),
            limits.clone(),
            PredictionConfig::default(),
        ));
        let resolution = Arc::new(ResolutionAgent::new(
            AgentId::new(AgentRole::Resolution, 0),
            identity.clone(),
        ));
        let communication = Arc::new(CommunicationAgent::new(
            AgentId::new(AgentRole::Communication, 0),
            identity.clone(),
            deps.notifications,
            "incidents",
        ));

        let runtime = Arc::new(AgentRuntime::new(
            identity.clone(),
            registry.clone(),
            chaos.clone(),
            detection.clone(),
            diagnosis,
            prediction,
            resolution,
            communication.clone(),
        ));

        let (engine, suspicion_rx) = ConsensusEngine::new(
            ConsensusConfig {
                n: config.quorum.n,
                f: config.quorum.f,
                phase_timeout: config.phase_timeout(),
                submission_window: config.submission_window(),
                view_change_timeout: Duration::from_millis(
                    config.consensus.view_change_timeout_ms,
                ),
                max_view_changes: config.consensus.max_view_changes,
            },
            identity.clone(),
            registry.clone(),
            chaos.clone(),
            store.clone(),
        )?;
        let engine = Arc::new(engine);

        let (meta_tx, meta_rx) = mpsc::channel(8);
        let monitor = Arc::new(MetaHealthMonitor::new(
            MonitorConfig {
                cadence: Duration::from_millis(config.mhm.cadence_ms),
                degraded_agent_failure: config.mhm.degraded_threshold,
                critical_agent_failure: config.mhm.critical_threshold,
                degraded_consensus_failure: config.mhm.degraded_consensus_threshold,
                critical_consensus_failure: config.mhm.critical_consensus_threshold,
                escalation_timeout: Duration::from_millis(config.mhm.escalation_timeout_ms),
                quarantine_corroboration: config.mhm.quarantine_corroboration,
                max_meta_depth: config.mhm.max_meta_depth,
            },
            registry.clone(),
            breakers.clone(),
            engine.stats(),
            store.clone(),
            meta_tx,
        ));

        let executor = Arc::new(ResolutionExecutor::new(
            deps.backend,
            store.clone(),
            ExecutorConfig {
                sandbox_required: config.executor.sandbox_required,
                observation_window: Duration::from_millis(config.executor.observation_window_ms),
                observation_probes: config.executor.observation_probes,
                irreversible_steps: config.executor.irreversible_steps.clone(),
            },
        ));

        let orchestrator = Arc::new(IncidentOrchestrator::new(
            config.clone(),
            store.clone(),
            runtime.clone(),
            engine.clone(),
            executor,
            monitor.clone(),
            detection,
        ));

        Ok(Arc::new(Self {
            config,
            identity,
            store,
            registry,
            chaos,
            breakers,
            budget,
            runtime,
            engine,
            monitor,
            orchestrator,
            communication,
            telemetry: deps.telemetry,
            meta_rx: Mutex::new(Some(meta_rx)),
            suspicion_rx: Mutex::new(Some(suspicion_rx)),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Start the worker fleet and all background loops: health probing,
    /// suspicion corroboration, telemetry ingest, meta-incident handling,
    /// and stakeholder notification.
    pub fn start(self: &Arc<Self>) {
        self.runtime.start();

        let monitor = self.monitor.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move { monitor.run(token).await });

        if let Some(suspicions) = self.suspicion_rx.lock().take() {
            let monitor = self.monitor.clone();
            let token = self.shutdown.child_token();
            tokio::spawn(async move { monitor.run_suspicions(suspicions, token).await });
        }

        // Telemetry pump: source batches into the orchestrator.
        {
            let platform = self.clone();
            let token = self.shutdown.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        batch = platform.telemetry.next_batch() => {
                            let Some(batch) = batch else { break };
                            if let Err(err) = platform.orchestrator.ingest_batch(batch).await {
                                error!(error = %err, "telemetry ingest failed");
                            }
                        }
                    }
                }
                info!("telemetry pump stopped");
            });
        }

        // Meta-incident pump: monitor requests into the orchestrator.
        if let Some(mut meta_rx) = self.meta_rx.lock().take() {
            let platform = self.clone();
            let token = self.shutdown.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        request = meta_rx.recv() => {
                            let Some(request) = request else { break };
                            warn!(reason = %request.reason, "opening meta-incident");
                            if let Err(err) =
                                platform.orchestrator.open_meta_incident(request).await
                            {
                                error!(error = %err, "failed to open meta-incident");
                            }
                        }
                    }
                }
            });
        }

        // Integrity alarm loop: chain-hash violations become
        // meta-incidents; the fenced stream itself accepts no more writes.
        {
            let monitor = self.monitor.clone();
            let mut alerts = self.store.integrity_alerts();
            let token = self.shutdown.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        alert = alerts.recv() => {
                            match alert {
                                Ok(alert) => {
                                    error!(
                                        incident = %alert.incident_id,
                                        version = alert.version,
                                        "integrity violation reported to monitor"
                                    );
                                    monitor
                                        .maybe_request_meta(
                                            format!(
                                                "hash-chain integrity violation in {} at version {}",
                                                alert.incident_id, alert.version
                                            ),
                                            1,
                                        )
                                        .await;
                                }
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(_) => break,
                            }
                        }
                    }
                }
            });
        }

        // Communication loop: committed events into stakeholder
        // notifications, deduplicated by (incident, stage).
        {
            let communication = self.communication.clone();
            let mut live = self.store.subscribe();
            let token = self.shutdown.child_token();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        event = live.recv() => {
                            match event {
                                Ok(event) => {
                                    let _ = communication.on_event(&event).await;
                                }
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                    warn!(missed, "communication loop lagged the live feed");
                                }
                                Err(_) => break,
                            }
                        }
                    }
                }
            });
        }

        info!("platform started");
    }

    /// Shut down in topological order: stop accepting work, stop the
    /// fleet, then let background loops drain off their closed channels.
    pub fn stop(&self) {
        info!("platform stopping");
        self.shutdown.cancel();
        self.runtime.stop();
    }
}

