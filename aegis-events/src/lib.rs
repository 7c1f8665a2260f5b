//! # AEGIS Event Store
//!
//! Append-only, tamper-evident event log for incident streams. This is the
//! authoritative history of the platform: every other component holds only
//! derived caches that must be rebuildable by replaying these events.
//!
//! ## Guarantees
//!
//! - **Contiguous versions**: events for an incident start at version 0 and
//!   increase strictly by one; appends assert the next version and fail with
//!   a conflict on mismatch (optimistic concurrency).
//! - **Hash chaining**: each record carries `content_hash` over its
//!   canonical bytes and `chain_hash = blake3(prev_chain_hash ‖
//!   content_hash)`, so mutating any byte of history is detectable by
//!   end-to-end recomputation.
//! - **Signed producers**: every record is signed by its producer identity;
//!   signatures bind the chain hash, and therefore the entire prefix.
//! - **Integrity fencing**: a chain-hash mismatch discovered on read fences
//!   the stream (further appends are refused) and raises an alert for the
//!   meta-health monitor.
//!
//! Durability itself is the injected [`EventSink`]'s contract; the in-memory
//! sink here backs tests and single-process deployments.

mod canonical;
mod sink;
mod store;
mod types;

pub use canonical::{canonical_bytes, content_hash, chain_hash, GENESIS_CHAIN_HASH};
pub use sink::{EventSink, MemoryEventSink, SinkError};
pub use store::{EventStore, IntegrityAlert};
pub use types::{
    ActionPlan, ActionStep, DecisionRecord, EventKind, EventPayload, EvidenceRef, IncidentEvent,
    IncidentId, MetricGate, QuorumVote, RecommendationDigest, ReversalStep, Severity,
};

use thiserror::Error;

/// Failures surfaced by event-store operations.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Optimistic-concurrency conflict: the caller asserted a version that
    /// is not the next one. Recovered locally by re-read and retry.
    #[error("version conflict: asserted {asserted}, next is {next}")]
    Conflict { asserted: u64, next: u64 },

    /// Chain-hash or content-hash mismatch detected on read. Fatal for the
    /// affected incident; surfaced to the meta-health monitor.
    #[error("integrity violation in stream {incident_id} at version {version}")]
    Integrity { incident_id: IncidentId, version: u64 },

    /// The stream was fenced after an integrity violation; no further
    /// writes are accepted.
    #[error("stream {0} is fenced after an integrity violation")]
    Fenced(IncidentId),

    /// The sink cannot keep up; the caller should back off and retry.
    #[error("event sink backpressure")]
    Backpressure,

    #[error("unknown incident {0}")]
    UnknownIncident(IncidentId),

    #[error("identity error: {0}")]
    Identity(#[from] aegis_identity::IdentityError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("sink error: {0}")]
    Sink(SinkError),
}

impl From<SinkError> for EventStoreError {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::Backpressure => EventStoreError::Backpressure,
            other => EventStoreError::Sink(other),
        }
    }
}
