//! The event store facade: optimistic-concurrency appends, verified reads,
//! live subscriptions, and end-to-end chain verification.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, warn};

use aegis_identity::IdentityService;

use crate::canonical::{canonical_bytes, chain_hash, content_hash, GENESIS_CHAIN_HASH};
use crate::sink::EventSink;
use crate::types::{EventPayload, IncidentEvent, IncidentId};
use crate::{EventStoreError, SinkError};

/// Raised when a read detects hash-chain tampering. The affected stream is
/// fenced; the meta-health monitor subscribes to these.
#[derive(Debug, Clone)]
pub struct IntegrityAlert {
    pub incident_id: IncidentId,
    pub version: u64,
}

/// Secondary index entry: next version and head chain hash per incident,
/// for O(1) append concurrency checks.
struct StreamHead {
    next_version: u64,
    chain_hash: String,
}

/// Append-only event log per incident with monotonic versions and
/// tamper-evident hash chaining. All derived state elsewhere in the
/// platform must be rebuildable from what this store returns.
pub struct EventStore {
    sink: Arc<dyn EventSink>,
    identity: Arc<IdentityService>,
    heads: DashMap<IncidentId, Arc<Mutex<StreamHead>>>,
    fenced: DashMap<IncidentId, ()>,
    live: broadcast::Sender<IncidentEvent>,
    alerts: broadcast::Sender<IntegrityAlert>,
}

impl EventStore {
    pub fn new(sink: Arc<dyn EventSink>, identity: Arc<IdentityService>) -> Self {
        let (live, _) = broadcast::channel(4096);
        let (alerts, _) = broadcast::channel(64);
        Self {
            sink,
            identity,
            heads: DashMap::new(),
            fenced: DashMap::new(),
            live,
            alerts,
        }
    }

    fn stream_name(incident_id: IncidentId) -> String {
        format!("incidents/{incident_id}")
    }

    /// Live event feed across all incidents. Lagging receivers miss events;
    /// catch up with [`read_from`].
    ///
    /// [`read_from`]: EventStore::read_from
    pub fn subscribe(&self) -> broadcast::Receiver<IncidentEvent> {
        self.live.subscribe()
    }

    /// Integrity alarm feed for the meta-health monitor.
    pub fn integrity_alerts(&self) -> broadcast::Receiver<IntegrityAlert> {
        self.alerts.subscribe()
    }

    /// Append one event, asserting that `expected_version` is the next
    /// version of the stream. On [`EventStoreError::Conflict`] the caller
    /// re-reads and retries after merging.
    pub async fn append(
        &self,
        incident_id: IncidentId,
        expected_version: u64,
        producer: &str,
        payload: EventPayload,
    ) -> Result<IncidentEvent, EventStoreError> {
        if self.fenced.contains_key(&incident_id) {
            return Err(EventStoreError::Fenced(incident_id));
        }

        let head = self.head_handle(incident_id).await?;
        let mut head = head.lock().await;

        if expected_version != head.next_version {
            return Err(EventStoreError::Conflict {
                asserted: expected_version,
                next: head.next_version,
            });
        }

        let content = content_hash(&payload)?;
        let chained = chain_hash(&head.chain_hash, &content);

        let mut event = IncidentEvent {
            incident_id,
            version: head.next_version,
            payload,
            timestamp: chrono::Utc::now(),
            producer: producer.to_string(),
            content_hash: content,
            chain_hash: chained,
            signature: String::new(),
        };
        event.signature = self.identity.sign(producer, &event.signable_bytes())?;

        let record = canonical_bytes(&event)?;
        self.sink
            .append(&Self::stream_name(incident_id), &record)
            .await?;

        head.next_version += 1;
        head.chain_hash = event.chain_hash.clone();
        drop(head);

        debug!(
            incident = %incident_id,
            version = event.version,
            kind = ?event.kind(),
            "event appended"
        );
        let _ = self.live.send(event.clone());
        Ok(event)
    }

    /// Append at the current head, retrying a bounded number of times on
    /// version conflicts. Convenience for producers that do not carry their
    /// own version cursor (executor steps, monitor audit events).
    pub async fn append_next(
        &self,
        incident_id: IncidentId,
        producer: &str,
        payload: EventPayload,
    ) -> Result<IncidentEvent, EventStoreError> {
        const MAX_ATTEMPTS: usize = 8;
        let mut last = None;
        for _ in 0..MAX_ATTEMPTS {
            let next = self.next_version(incident_id).await?;
            match self.append(incident_id, next, producer, payload.clone()).await {
                Ok(event) => return Ok(event),
                // Lost the race to another producer; re-read and retry.
                Err(conflict @ EventStoreError::Conflict { .. }) => last = Some(conflict),
                Err(other) => return Err(other),
            }
        }
        Err(last.expect("at least one attempt was made"))
    }

    /// Next version the stream expects, hydrating the head index from the
    /// sink if this store instance has not seen the stream yet.
    pub async fn next_version(&self, incident_id: IncidentId) -> Result<u64, EventStoreError> {
        let head = self.head_handle(incident_id).await?;
        let head = head.lock().await;
        Ok(head.next_version)
    }

    /// Version of the last committed event, if any.
    pub async fn head_version(&self, incident_id: IncidentId) -> Result<Option<u64>, EventStoreError> {
        Ok(self.next_version(incident_id).await?.checked_sub(1))
    }

    /// Read an inclusive version window, verifying content hashes and chain
    /// linkage as records stream by. A mismatch fences the stream, raises an
    /// integrity alert, and surfaces [`EventStoreError::Integrity`].
    pub async fn read(
        &self,
        incident_id: IncidentId,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Result<Vec<IncidentEvent>, EventStoreError> {
        let stream = Self::stream_name(incident_id);
        let records = match self.sink.read(&stream, from_version, to_version).await {
            Ok(records) => records,
            Err(SinkError::UnknownStream(_)) => {
                return Err(EventStoreError::UnknownIncident(incident_id))
            }
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::with_capacity(records.len());
        let mut prev_chain: Option<String> = None;

        for (offset, bytes) in records.iter().enumerate() {
            let version = from_version + offset as u64;
            let event: IncidentEvent = match serde_json::from_slice(bytes) {
                Ok(event) => event,
                // A flipped byte usually breaks the record encoding before
                // it breaks the hash; both are tampering.
                Err(_) => return Err(self.integrity_failure(incident_id, version)),
            };

            if event.version != version || event.incident_id != incident_id {
                return Err(self.integrity_failure(incident_id, version));
            }

            let recomputed = content_hash(&event.payload)?;
            if recomputed != event.content_hash {
                return Err(self.integrity_failure(incident_id, version));
            }

            let expected_prev = match (&prev_chain, version) {
                (Some(prev), _) => Some(prev.clone()),
                (None, 0) => Some(GENESIS_CHAIN_HASH.to_string()),
                // Window starts mid-stream: linkage to the unseen prefix is
                // checked by verify_chain, not here.
                (None, _) => None,
            };
            if let Some(prev) = expected_prev {
                if chain_hash(&prev, &event.content_hash) != event.chain_hash {
                    return Err(self.integrity_failure(incident_id, version));
                }
            }

            prev_chain = Some(event.chain_hash.clone());
            events.push(event);
        }

        Ok(events)
    }

    /// Finite subscription window: up to `limit` events starting at
    /// `cursor`, plus the cursor to continue from. Restartable.
    pub async fn read_from(
        &self,
        incident_id: IncidentId,
        cursor: u64,
        limit: usize,
    ) -> Result<(Vec<IncidentEvent>, u64), EventStoreError> {
        let next = self.next_version(incident_id).await?;
        if cursor >= next || limit == 0 {
            return Ok((Vec::new(), cursor));
        }
        let to = (cursor + limit as u64 - 1).min(next - 1);
        let events = self.read(incident_id, cursor, Some(to)).await?;
        let continuation = events.last().map(|e| e.version + 1).unwrap_or(cursor);
        Ok((events, continuation))
    }

    /// Recompute the hash chain end to end. `Ok(true)` means every content
    /// hash and chain link checks out.
    pub async fn verify_chain(&self, incident_id: IncidentId) -> Result<bool, EventStoreError> {
        let stream = Self::stream_name(incident_id);
        let records = match self.sink.read(&stream, 0, None).await {
            Ok(records) => records,
            Err(SinkError::UnknownStream(_)) => {
                return Err(EventStoreError::UnknownIncident(incident_id))
            }
            Err(e) => return Err(e.into()),
        };

        let mut prev = GENESIS_CHAIN_HASH.to_string();
        for (version, bytes) in records.iter().enumerate() {
            let Ok(event) = serde_json::from_slice::<IncidentEvent>(bytes) else {
                return Ok(false);
            };
            if event.version != version as u64 {
                return Ok(false);
            }
            let content = content_hash(&event.payload)?;
            if content != event.content_hash || chain_hash(&prev, &content) != event.chain_hash {
                return Ok(false);
            }
            prev = event.chain_hash;
        }
        Ok(true)
    }

    /// Whether the stream was fenced after an integrity violation.
    pub fn is_fenced(&self, incident_id: IncidentId) -> bool {
        self.fenced.contains_key(&incident_id)
    }

    fn integrity_failure(&self, incident_id: IncidentId, version: u64) -> EventStoreError {
        error!(incident = %incident_id, version, "hash chain integrity violation; fencing stream");
        self.fenced.insert(incident_id, ());
        let _ = self.alerts.send(IntegrityAlert {
            incident_id,
            version,
        });
        EventStoreError::Integrity {
            incident_id,
            version,
        }
    }

    async fn head_handle(
        &self,
        incident_id: IncidentId,
    ) -> Result<Arc<Mutex<StreamHead>>, EventStoreError> {
        if let Some(head) = self.heads.get(&incident_id) {
            return Ok(head.clone());
        }

        // First touch of this stream: hydrate the head index from the sink
        // so a store restarted over existing history keeps appending where
        // it left off.
        let stream = Self::stream_name(incident_id);
        let head = match self.sink.head(&stream).await? {
            None => StreamHead {
                next_version: 0,
                chain_hash: GENESIS_CHAIN_HASH.to_string(),
            },
            Some(position) => {
                let tail = self.sink.read(&stream, position, Some(position)).await?;
                let bytes = tail.first().ok_or(EventStoreError::Backpressure)?;
                let event: IncidentEvent = serde_json::from_slice(bytes)
                    .map_err(|_| self.integrity_failure(incident_id, position))?;
                warn!(incident = %incident_id, head = position, "hydrated stream head from sink");
                StreamHead {
                    next_version: event.version + 1,
                    chain_hash: event.chain_hash,
                }
            }
        };

        Ok(self
            .heads
            .entry(incident_id)
            .or_insert_with(|| Arc::new(Mutex::new(head)))
            .clone())
    }
}
