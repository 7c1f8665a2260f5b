// AEGIS configuration management.
//
// One root structure covering every subsystem, serde-loadable from a JSON
// file whose path comes from the AEGIS_CONFIG environment variable, with
// defaults tuned for a single-process deployment. Validation runs before
// anything is constructed; an n/f pair that cannot tolerate the declared
// Byzantine count never boots.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Root configuration for the whole platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AegisConfig {
    /// Consensus quorum sizing and phase deadlines.
    pub quorum: QuorumConfig,

    /// Consensus timing knobs.
    pub consensus: ConsensusTimingConfig,

    /// Circuit breaker defaults for all external dependencies.
    pub breaker: BreakerSection,

    /// Spend caps and per-tier model costs.
    pub budget: BudgetSection,

    /// Token-bucket rates per external dependency.
    pub ratelimit: RateLimitSection,

    /// Reputation deltas and the quarantine threshold.
    pub reputation: ReputationConfig,

    /// Sandbox and rollback behavior of the resolution executor.
    pub executor: ExecutorSection,

    /// Meta-health monitor thresholds and cadence.
    pub mhm: MonitorSection,

    /// Control API binding.
    pub api: ApiConfig,

    /// Telemetry ingest behavior.
    pub ingest: IngestConfig,
}

/// Agent count and tolerated Byzantine count; n ≥ 3f + 1 is enforced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    pub n: usize,
    pub f: usize,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self { n: 5, f: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusTimingConfig {
    pub phase_timeout_ms: u64,
    pub submission_window_ms: u64,
    pub view_change_timeout_ms: u64,
    pub max_view_changes: u64,
}

impl Default for ConsensusTimingConfig {
    fn default() -> Self {
        Self {
            phase_timeout_ms: 60_000,
            submission_window_ms: 30_000,
            view_change_timeout_ms: 30_000,
            max_view_changes: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub failure_rate_threshold: f64,
    pub window_ms: u64,
    pub min_window_calls: u32,
    pub cooldown_ms: u64,
    pub halfopen_probes: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            window_ms: 60_000,
            min_window_calls: 10,
            cooldown_ms: 30_000,
            halfopen_probes: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub hourly_cap: f64,
    pub daily_cap: f64,
    pub cost_fast: f64,
    pub cost_balanced: f64,
    pub cost_accurate: f64,
    pub confidence_fast: f64,
    pub confidence_balanced: f64,
    pub confidence_accurate: f64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            hourly_cap: 100.0,
            daily_cap: 1_500.0,
            cost_fast: 1.0,
            cost_balanced: 4.0,
            cost_accurate: 10.0,
            confidence_fast: 0.6,
            confidence_balanced: 0.8,
            confidence_accurate: 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub default_rps: f64,
    pub default_burst: f64,
    pub model_rps: f64,
    pub model_burst: f64,
    pub memory_rps: f64,
    pub memory_burst: f64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            default_rps: 10.0,
            default_burst: 20.0,
            model_rps: 5.0,
            model_burst: 10.0,
            memory_rps: 20.0,
            memory_burst: 40.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub delta_reward: f64,
    pub delta_penalty: f64,
    pub quarantine_threshold: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            delta_reward: 0.05,
            delta_penalty: 0.2,
            quarantine_threshold: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub sandbox_required: bool,
    pub observation_window_ms: u64,
    pub observation_probes: u32,
    pub irreversible_steps: Vec<String>,
    /// Consensus rounds allowed after sandbox rejections or rollbacks
    /// before the incident fails.
    pub max_remediation_rounds: u32,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            sandbox_required: true,
            observation_window_ms: 60_000,
            observation_probes: 6,
            irreversible_steps: vec!["kill_query".to_string()],
            max_remediation_rounds: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub cadence_ms: u64,
    pub degraded_threshold: f64,
    pub critical_threshold: f64,
    pub degraded_consensus_threshold: f64,
    pub critical_consensus_threshold: f64,
    pub escalation_timeout_ms: u64,
    pub quarantine_corroboration: u32,
    pub max_meta_depth: u32,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            cadence_ms: 10_000,
            degraded_threshold: 0.2,
            critical_threshold: 0.4,
            degraded_consensus_threshold: 0.4,
            critical_consensus_threshold: 0.6,
            escalation_timeout_ms: 600_000,
            quarantine_corroboration: 2,
            max_meta_depth: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
    pub cors_enabled: bool,
    /// Header value required for operator-guarded endpoints (chaos
    /// injection).
    pub operator_token: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8686,
            cors_enabled: true,
            operator_token: "operator-dev-token".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Replay window for signal-id idempotency.
    pub dedup_window_ms: u64,
    /// Deadline for the analysis fan-out before advancing with whatever
    /// arrived.
    pub analysis_timeout_ms: u64,
    /// Queue depth for the telemetry channel; full means shed by
    /// priority upstream.
    pub queue_depth: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 300_000,
            analysis_timeout_ms: 45_000,
            queue_depth: 256,
        }
    }
}

impl AegisConfig {
    /// Load from the file named by `AEGIS_CONFIG`, falling back to
    /// defaults when unset. Values are validated either way.
    pub async fn load() -> Result<Self> {
        let config = match std::env::var("AEGIS_CONFIG") {
            Ok(path) => {
                info!(path = %path, "loading configuration file");
                let raw = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading configuration from {path}"))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing configuration from {path}"))?
            }
            Err(_) => {
                info!("AEGIS_CONFIG unset; using default configuration");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.quorum.n >= 3 * self.quorum.f + 1,
            "quorum.n = {} cannot tolerate quorum.f = {}; need n >= 3f + 1",
            self.quorum.n,
            self.quorum.f
        );
        anyhow::ensure!(self.budget.hourly_cap > 0.0, "budget.hourly_cap must be positive");
        anyhow::ensure!(
            self.budget.daily_cap >= self.budget.hourly_cap,
            "budget.daily_cap must be at least the hourly cap"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.reputation.quarantine_threshold),
            "reputation.quarantine_threshold must be within [0, 1]"
        );
        anyhow::ensure!(
            self.executor.max_remediation_rounds > 0,
            "executor.max_remediation_rounds must be at least 1"
        );
        Ok(())
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus.phase_timeout_ms)
    }

    pub fn submission_window(&self) -> Duration {
        Duration::from_millis(self.consensus.submission_window_ms)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.ingest.analysis_timeout_ms)
    }
}
