//! # AEGIS Consensus Engine
//!
//! Modified PBFT over the in-process agent fleet. For each incident round
//! the engine collects signed recommendations within a submission window,
//! screens them for Byzantine indicators at ingress, then drives the
//! three-phase protocol — pre-prepare, prepare, commit — with quorum
//! 2f+1 of n = 3f+1 participants and view changes on phase timeout.
//!
//! The committed outcome is a weighted vote over recommendation actions
//! (reputation × confidence), with a deterministic tie-break, and is made
//! durable as a `DECISION_COMMITTED` event — including its quorum proof —
//! before the round returns. No action executes without that event.
//!
//! Byzantine behavior is an expected outcome, not an error: flagged agents
//! lose reputation and are excluded for the round; durable quarantine
//! additionally requires meta-health-monitor corroboration, delivered as
//! [`SuspicionReport`]s.

mod byzantine;
mod engine;
mod round;
mod types;

pub use byzantine::{ByzantineDetector, ByzantineFlag};
pub use engine::{ConsensusEngine, ConsensusOutcome, ConsensusStats, SuspicionReport};
pub use round::{ConsensusRound, RoundError, RoundPhase};
pub use types::{
    batch_digest, CommitMsg, ConsensusConfig, PrePrepare, Prepare, RoundId, ViewChangeMsg,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("consensus configuration invalid: {0}")]
    InvalidConfig(String),

    #[error("no executable plan among committed recommendations")]
    NoExecutablePlan,

    #[error("event store error: {0}")]
    Store(#[from] aegis_events::EventStoreError),

    #[error("identity error: {0}")]
    Identity(#[from] aegis_identity::IdentityError),
}
