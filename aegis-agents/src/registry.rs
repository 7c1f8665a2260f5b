//! Agent registry: profiles, reputation, lifecycle states, heartbeats.
//!
//! Reputation is in-memory derived state; the registry can be rebuilt at
//! startup from agent-joined and quarantine events plus periodic
//! checkpoints. The update rule is an injected pure function so deployments
//! can tune or replace it without touching consensus code.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::types::{AgentId, AgentState};

/// Behavioral outcome applied to one agent for one consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationSignal {
    /// Recommendation aligned with the committed majority, honest timing.
    MajorityAligned,
    /// Substantively dissented but behaved honestly; mildly penalized so
    /// persistent outliers drift toward probation while honest dissent
    /// survives occasional rounds.
    HonestDissent,
    /// Submitted nothing before the window closed.
    SilentTimeout,
    /// A Byzantine indicator fired (bad confidence, forged signature,
    /// equivocation, dangling evidence, unsupported outlier).
    ByzantineIndicator,
}

/// Pure reputation update rule: next score from current score and signal.
pub trait ReputationModel: Send + Sync {
    fn update(&self, current: f64, signal: ReputationSignal) -> f64;
}

/// Default rule: symmetric linear deltas from configuration, clamped to
/// [0, 1]. No time decay.
#[derive(Debug, Clone)]
pub struct LinearReputation {
    pub delta_reward: f64,
    pub delta_penalty: f64,
}

impl Default for LinearReputation {
    fn default() -> Self {
        Self {
            delta_reward: 0.05,
            delta_penalty: 0.2,
        }
    }
}

impl ReputationModel for LinearReputation {
    fn update(&self, current: f64, signal: ReputationSignal) -> f64 {
        let next = match signal {
            ReputationSignal::MajorityAligned => current + self.delta_reward,
            ReputationSignal::HonestDissent => current - self.delta_penalty * 0.1,
            ReputationSignal::SilentTimeout => current - self.delta_penalty * 0.5,
            ReputationSignal::ByzantineIndicator => current - self.delta_penalty,
        };
        next.clamp(0.0, 1.0)
    }
}

/// One agent's registry entry.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub id: AgentId,
    pub public_key_hex: String,
    pub reputation: f64,
    pub state: AgentState,
    pub last_heartbeat: DateTime<Utc>,
    /// Rounds in which a Byzantine indicator fired; cross-round suspicion
    /// drives durable quarantine via monitor corroboration.
    pub suspicious_rounds: u32,
}

/// Registry of the live agent fleet.
pub struct AgentRegistry {
    profiles: DashMap<AgentId, AgentProfile>,
    model: Box<dyn ReputationModel>,
    quarantine_threshold: f64,
    heartbeat_ttl: Duration,
}

impl AgentRegistry {
    pub fn new(model: Box<dyn ReputationModel>, quarantine_threshold: f64) -> Self {
        Self {
            profiles: DashMap::new(),
            model,
            quarantine_threshold,
            heartbeat_ttl: Duration::seconds(30),
        }
    }

    /// Register an agent at startup or dynamic join. Reputation starts at
    /// the neutral default.
    pub fn register(&self, id: AgentId, public_key_hex: String) {
        info!(agent = %id, "agent joined the fleet");
        self.profiles.insert(
            id,
            AgentProfile {
                id,
                public_key_hex,
                reputation: 0.5,
                state: AgentState::Healthy,
                last_heartbeat: Utc::now(),
                suspicious_rounds: 0,
            },
        );
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentProfile> {
        self.profiles.get(id).map(|p| p.clone())
    }

    pub fn reputation(&self, id: &AgentId) -> f64 {
        self.profiles.get(id).map(|p| p.reputation).unwrap_or(0.0)
    }

    pub fn state(&self, id: &AgentId) -> AgentState {
        self.profiles
            .get(id)
            .map(|p| p.state)
            .unwrap_or(AgentState::Dead)
    }

    pub fn heartbeat(&self, id: &AgentId) {
        if let Some(mut profile) = self.profiles.get_mut(id) {
            profile.last_heartbeat = Utc::now();
        }
    }

    /// Non-quarantined agents in stable id order; the basis for primary
    /// rotation in consensus.
    pub fn non_quarantined_ordered(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .profiles
            .iter()
            .filter(|p| !matches!(p.state, AgentState::Quarantined | AgentState::Dead))
            .map(|p| p.id)
            .collect();
        ids.sort();
        ids
    }

    /// Apply a behavioral signal through the reputation model. A score
    /// falling under the quarantine threshold moves a healthy agent to
    /// probation; durable quarantine additionally needs corroboration via
    /// [`escalate`].
    ///
    /// [`escalate`]: AgentRegistry::escalate
    pub fn record_signal(&self, id: &AgentId, signal: ReputationSignal) -> f64 {
        let Some(mut profile) = self.profiles.get_mut(id) else {
            return 0.0;
        };
        profile.reputation = self.model.update(profile.reputation, signal);
        if signal == ReputationSignal::ByzantineIndicator {
            profile.suspicious_rounds += 1;
        }

        if profile.reputation < self.quarantine_threshold
            && profile.state == AgentState::Healthy
        {
            warn!(agent = %id, reputation = profile.reputation, "agent placed on probation");
            profile.state = AgentState::Probation;
        }
        profile.reputation
    }

    /// Escalate one lifecycle step: HEALTHY → PROBATION → QUARANTINED.
    /// Returns the new state.
    pub fn escalate(&self, id: &AgentId) -> AgentState {
        let Some(mut profile) = self.profiles.get_mut(id) else {
            return AgentState::Dead;
        };
        profile.state = match profile.state {
            AgentState::Healthy => {
                warn!(agent = %id, "agent placed on probation");
                AgentState::Probation
            }
            AgentState::Probation => {
                warn!(agent = %id, "agent quarantined");
                AgentState::Quarantined
            }
            other => other,
        };
        profile.state
    }

    pub fn set_state(&self, id: &AgentId, state: AgentState) {
        if let Some(mut profile) = self.profiles.get_mut(id) {
            profile.state = state;
        }
    }

    /// Restore a quarantined or dead agent to health. Restricted
    /// self-healing action used by the meta-health monitor.
    pub fn restart(&self, id: &AgentId) {
        if let Some(mut profile) = self.profiles.get_mut(id) {
            info!(agent = %id, "agent restarted");
            profile.state = AgentState::Healthy;
            profile.last_heartbeat = Utc::now();
            profile.suspicious_rounds = 0;
        }
    }

    pub fn suspicious_rounds(&self, id: &AgentId) -> u32 {
        self.profiles
            .get(id)
            .map(|p| p.suspicious_rounds)
            .unwrap_or(0)
    }

    /// Fraction of registered agents with a recent heartbeat and a
    /// non-terminal state. The meta-health monitor's liveness input.
    pub fn healthy_fraction(&self) -> f64 {
        let total = self.profiles.len();
        if total == 0 {
            return 1.0;
        }
        let cutoff = Utc::now() - self.heartbeat_ttl;
        let alive = self
            .profiles
            .iter()
            .filter(|p| {
                matches!(p.state, AgentState::Healthy | AgentState::Probation)
                    && p.last_heartbeat > cutoff
            })
            .count();
        alive as f64 / total as f64
    }

    pub fn all_profiles(&self) -> Vec<AgentProfile> {
        self.profiles.iter().map(|p| p.clone()).collect()
    }

    /// Serializable reputation checkpoint, persisted periodically so the
    /// in-memory scores survive restarts.
    pub fn checkpoint(&self) -> Vec<(String, f64)> {
        self.profiles
            .iter()
            .map(|p| (p.id.to_string(), p.reputation))
            .collect()
    }
}
