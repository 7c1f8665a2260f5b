//! Per-round protocol state machine.
//!
//! The round tracks collected messages indexed by phase and sender and
//! enforces the state gates: a pre-prepare must be accepted before
//! prepares count, and a node only moves to the commit phase once
//! prepared (pre-prepare plus ≥ 2f prepares from distinct senders).
//! All methods are synchronous; the engine owns suspension and timeouts.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use aegis_agents::{AgentId, Recommendation};

use crate::types::{CommitMsg, PrePrepare, Prepare, RoundId, ViewChangeMsg};

/// Protocol phase of a live round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    PrePrepare,
    Prepare,
    Commit,
    Committed,
    ViewChange,
    TimedOut,
}

#[derive(Debug, Error, PartialEq)]
pub enum RoundError {
    #[error("message for wrong round or view")]
    WrongView,

    #[error("pre-prepare from {0} which is not the primary")]
    NotPrimary(AgentId),

    #[error("conflicting message from {0} in the same view")]
    Equivocation(AgentId),

    #[error("message digest does not match the pre-prepared batch")]
    DigestMismatch,

    #[error("message arrived in phase {0:?} where it is not valid")]
    WrongPhase(RoundPhase),
}

/// Transient consensus state for one `(incident, round)`. Created when the
/// submission window closes, destroyed on commit or abort.
pub struct ConsensusRound {
    pub id: RoundId,
    pub view: u64,
    pub primary: AgentId,
    pub phase: RoundPhase,
    f: usize,
    recommendations: BTreeMap<AgentId, Recommendation>,
    pre_prepare: Option<PrePrepare>,
    prepares: BTreeMap<AgentId, Prepare>,
    commits: BTreeMap<AgentId, CommitMsg>,
    view_changes: BTreeMap<AgentId, ViewChangeMsg>,
}

impl ConsensusRound {
    pub fn new(
        id: RoundId,
        view: u64,
        primary: AgentId,
        f: usize,
        recommendations: BTreeMap<AgentId, Recommendation>,
    ) -> Self {
        Self {
            id,
            view,
            primary,
            phase: RoundPhase::PrePrepare,
            f,
            recommendations,
            pre_prepare: None,
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            view_changes: BTreeMap::new(),
        }
    }

    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    pub fn recommendations(&self) -> &BTreeMap<AgentId, Recommendation> {
        &self.recommendations
    }

    pub fn pre_prepare(&self) -> Option<&PrePrepare> {
        self.pre_prepare.as_ref()
    }

    pub fn commits(&self) -> &BTreeMap<AgentId, CommitMsg> {
        &self.commits
    }

    /// Accept the primary's pre-prepare. A second pre-prepare with a
    /// different digest in the same view is equivocation.
    pub fn accept_pre_prepare(&mut self, msg: PrePrepare) -> Result<(), RoundError> {
        if msg.round_id != self.id || msg.view != self.view {
            return Err(RoundError::WrongView);
        }
        if msg.primary != self.primary {
            return Err(RoundError::NotPrimary(msg.primary));
        }
        if let Some(existing) = &self.pre_prepare {
            if existing.batch_digest != msg.batch_digest {
                return Err(RoundError::Equivocation(msg.primary));
            }
            return Ok(());
        }
        if self.phase != RoundPhase::PrePrepare {
            return Err(RoundError::WrongPhase(self.phase));
        }

        debug!(round = %self.id, view = self.view, "pre-prepare accepted");
        self.pre_prepare = Some(msg);
        self.phase = RoundPhase::Prepare;
        Ok(())
    }

    /// Accept a prepare from a backup. Conflicting prepares from the same
    /// sender in one view are equivocation.
    pub fn accept_prepare(&mut self, msg: Prepare) -> Result<(), RoundError> {
        if msg.round_id != self.id || msg.view != self.view {
            return Err(RoundError::WrongView);
        }
        let Some(pre_prepare) = &self.pre_prepare else {
            return Err(RoundError::WrongPhase(self.phase));
        };
        if msg.batch_digest != pre_prepare.batch_digest {
            return Err(RoundError::DigestMismatch);
        }
        if let Some(existing) = self.prepares.get(&msg.sender) {
            if existing.batch_digest != msg.batch_digest {
                return Err(RoundError::Equivocation(msg.sender));
            }
            return Ok(());
        }

        self.prepares.insert(msg.sender, msg);
        if self.is_prepared() && self.phase == RoundPhase::Prepare {
            debug!(round = %self.id, prepares = self.prepares.len(), "prepared; entering commit phase");
            self.phase = RoundPhase::Commit;
        }
        Ok(())
    }

    /// Prepared: holds the pre-prepare and ≥ 2f prepares from distinct
    /// senders.
    pub fn is_prepared(&self) -> bool {
        self.pre_prepare.is_some() && self.prepares.len() >= 2 * self.f
    }

    /// Accept a commit. Only valid once this node is prepared; the state
    /// gate, not wall-clock order, enforces prepare-before-commit.
    pub fn accept_commit(&mut self, msg: CommitMsg) -> Result<(), RoundError> {
        if msg.round_id != self.id || msg.view != self.view {
            return Err(RoundError::WrongView);
        }
        if !matches!(self.phase, RoundPhase::Commit | RoundPhase::Committed) {
            return Err(RoundError::WrongPhase(self.phase));
        }
        let digest = &self
            .pre_prepare
            .as_ref()
            .expect("commit phase implies pre-prepare")
            .batch_digest;
        if &msg.batch_digest != digest {
            return Err(RoundError::DigestMismatch);
        }

        self.commits.insert(msg.sender, msg);
        if self.is_committed_local() {
            self.phase = RoundPhase::Committed;
        }
        Ok(())
    }

    /// Committed-local: ≥ 2f+1 commits from distinct senders.
    pub fn is_committed_local(&self) -> bool {
        self.commits.len() >= self.quorum()
    }

    /// Accept a view-change vote for `view + 1`.
    pub fn accept_view_change(&mut self, msg: ViewChangeMsg) -> Result<(), RoundError> {
        if msg.round_id != self.id || msg.new_view != self.view + 1 {
            return Err(RoundError::WrongView);
        }
        self.view_changes.insert(msg.sender, msg);
        Ok(())
    }

    /// A view change is ready once ≥ 2f+1 distinct agents voted for it.
    pub fn view_change_ready(&self) -> bool {
        self.view_changes.len() >= self.quorum()
    }

    /// Discard everything collected from a sender caught equivocating;
    /// neither of its conflicting messages may count toward quorum.
    pub fn strike(&mut self, sender: &AgentId) {
        self.prepares.remove(sender);
        self.commits.remove(sender);
        self.view_changes.remove(sender);
        if self.phase == RoundPhase::Commit && !self.is_prepared() {
            self.phase = RoundPhase::Prepare;
        }
    }

    /// Restart the round under a new primary after a successful view
    /// change; collected phase messages are discarded, submissions kept.
    pub fn advance_view(&mut self, new_primary: AgentId) {
        self.view += 1;
        self.primary = new_primary;
        self.phase = RoundPhase::PrePrepare;
        self.pre_prepare = None;
        self.prepares.clear();
        self.commits.clear();
        self.view_changes.clear();
    }
}
