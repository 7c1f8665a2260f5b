//! External collaborator boundaries: model invocation, vector memory,
//! telemetry ingest, and notification delivery.
//!
//! Each is a narrow async trait; production deployments inject provider
//! adapters, while the in-memory implementations here back tests and
//! single-process runs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use aegis_events::Severity;
use aegis_resilience::ModelTier;

// ---------------------------------------------------------------------------
// ModelInvoker

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model invocation timed out")]
    Timeout,

    #[error("provider error: {0}")]
    Provider(String),

    /// Response failed schema validation (truncated or malformed). Treated
    /// as transient, never silently absorbed.
    #[error("malformed model response: {0}")]
    Malformed(String),
}

/// One completed model invocation, with token counts for budgeting and the
/// provider request id for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub request_id: String,
}

/// LLM provider boundary.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(
        &self,
        tier: ModelTier,
        prompt: &str,
        max_tokens: u32,
        deadline: Duration,
    ) -> Result<InvocationResult, ModelError>;
}

/// Scripted invoker for tests and demo scenarios: pops pre-loaded
/// responses in order, then fails.
pub struct ScriptedModelInvoker {
    script: Mutex<VecDeque<Result<InvocationResult, ModelError>>>,
}

impl ScriptedModelInvoker {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_json(&self, body: serde_json::Value) {
        self.push(Ok(InvocationResult {
            content: body.to_string(),
            prompt_tokens: 128,
            completion_tokens: 64,
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
        }));
    }

    pub fn push(&self, response: Result<InvocationResult, ModelError>) {
        self.script.lock().push_back(response);
    }
}

impl Default for ScriptedModelInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelInvoker for ScriptedModelInvoker {
    async fn invoke(
        &self,
        _tier: ModelTier,
        _prompt: &str,
        _max_tokens: u32,
        _deadline: Duration,
    ) -> Result<InvocationResult, ModelError> {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Provider("script exhausted".to_string())))
    }
}

/// Invoker that answers every prompt with a fixed-confidence JSON body.
/// Backs single-process runs where no provider is wired in; agents treat
/// it like any other model and still apply their own heuristics.
pub struct StaticModelInvoker {
    confidence: f64,
}

impl StaticModelInvoker {
    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

#[async_trait]
impl ModelInvoker for StaticModelInvoker {
    async fn invoke(
        &self,
        tier: ModelTier,
        _prompt: &str,
        _max_tokens: u32,
        _deadline: Duration,
    ) -> Result<InvocationResult, ModelError> {
        Ok(InvocationResult {
            content: serde_json::json!({ "confidence": self.confidence }).to_string(),
            prompt_tokens: 64,
            completion_tokens: 16,
            request_id: format!("static-{}-{}", tier.as_str(), uuid::Uuid::new_v4()),
        })
    }
}

// ---------------------------------------------------------------------------
// VectorMemory

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory backend error: {0}")]
    Backend(String),
}

/// One similarity hit from the historical pattern memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub entry_id: String,
    pub similarity: f64,
    pub payload: serde_json::Value,
}

/// Historical pattern lookup boundary. Returns at most `top_k` hits;
/// finite and not restartable.
#[async_trait]
pub trait VectorMemory: Send + Sync {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        min_similarity: f64,
    ) -> Result<Vec<MemoryHit>, MemoryError>;
}

/// Keyword-overlap memory for tests and single-process deployments.
pub struct StaticVectorMemory {
    entries: Vec<(String, MemoryHit)>,
}

impl StaticVectorMemory {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn insert(&mut self, entry_id: &str, text: &str, payload: serde_json::Value) {
        self.entries.push((
            text.to_lowercase(),
            MemoryHit {
                entry_id: entry_id.to_string(),
                similarity: 0.0,
                payload,
            },
        ));
    }
}

impl Default for StaticVectorMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorMemory for StaticVectorMemory {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        min_similarity: f64,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        let query_terms: Vec<&str> = query.split_whitespace().collect();
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }
        let query_lower = query.to_lowercase();

        let mut hits: Vec<MemoryHit> = self
            .entries
            .iter()
            .map(|(text, hit)| {
                let overlap = query_lower
                    .split_whitespace()
                    .filter(|term| text.contains(*term))
                    .count();
                let similarity = overlap as f64 / query_terms.len() as f64;
                MemoryHit {
                    similarity,
                    ..hit.clone()
                }
            })
            .filter(|hit| hit.similarity >= min_similarity)
            .collect();

        hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap());
        hits.truncate(top_k);
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// TelemetrySource

/// One telemetry signal. `signal_id` is the per-source idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySignal {
    pub signal_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub severity_hint: Option<Severity>,
    pub metrics: BTreeMap<String, f64>,
    pub tags: BTreeMap<String, String>,
}

/// Inbound telemetry boundary: batches of signals, `None` when the source
/// is closed.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn next_batch(&self) -> Option<Vec<TelemetrySignal>>;
}

/// Telemetry source fed through an mpsc channel, used by the control API
/// and demo scenarios to push batches in.
pub struct ChannelTelemetrySource {
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<TelemetrySignal>>>,
}

impl ChannelTelemetrySource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Vec<TelemetrySignal>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                rx: tokio::sync::Mutex::new(rx),
            },
        )
    }
}

#[async_trait]
impl TelemetrySource for ChannelTelemetrySource {
    async fn next_batch(&self) -> Option<Vec<TelemetrySignal>> {
        self.rx.lock().await.recv().await
    }
}

/// Sliding-window idempotency filter over signal ids. A signal seen within
/// the replay window is dropped; out-of-order arrival inside the window is
/// tolerated.
pub struct SignalDeduper {
    window: chrono::Duration,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SignalDeduper {
    pub fn new(window: chrono::Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// True when the signal is new and should be processed.
    pub fn admit(&self, signal_id: &str) -> bool {
        let now = Utc::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, first_seen| now - *first_seen < self.window);
        match seen.get(signal_id) {
            Some(_) => false,
            None => {
                seen.insert(signal_id.to_string(), now);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationChannel

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Delivered,
    Deferred,
}

/// Outbound stakeholder notification boundary. De-duplication is the
/// core's responsibility, not the channel's.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(
        &self,
        channel_id: &str,
        payload: serde_json::Value,
    ) -> Result<DeliveryStatus, NotifyError>;
}

/// Channel that records every delivery, for tests.
pub struct RecordingChannel {
    pub sent: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl Default for RecordingChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn notify(
        &self,
        channel_id: &str,
        payload: serde_json::Value,
    ) -> Result<DeliveryStatus, NotifyError> {
        self.sent.lock().push((channel_id.to_string(), payload));
        Ok(DeliveryStatus::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn static_memory_ranks_by_overlap() {
        let mut memory = StaticVectorMemory::new();
        memory.insert("m1", "database connection pool exhaustion cascade", json!({"cascaded": true}));
        memory.insert("m2", "dns resolution flake", json!({"cascaded": false}));

        let hits = memory
            .search("database connection pool saturation", 5, 0.3)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry_id, "m1");
        assert!(hits[0].similarity >= 0.5);
    }

    #[tokio::test]
    async fn static_memory_respects_top_k() {
        let mut memory = StaticVectorMemory::new();
        for i in 0..5 {
            memory.insert(&format!("m{i}"), "disk pressure alert", json!({}));
        }
        let hits = memory.search("disk pressure", 2, 0.0).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn deduper_admits_once_within_the_window() {
        let deduper = SignalDeduper::new(chrono::Duration::minutes(5));
        assert!(deduper.admit("sig-1"));
        assert!(!deduper.admit("sig-1"));
        assert!(deduper.admit("sig-2"));
    }

    #[tokio::test]
    async fn scripted_invoker_pops_in_order_then_fails() {
        let invoker = ScriptedModelInvoker::new();
        invoker.push_json(json!({"confidence": 0.9}));

        let first = invoker
            .invoke(ModelTier::Balanced, "p", 256, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(first.content.contains("0.9"));

        let err = invoker
            .invoke(ModelTier::Balanced, "p", 256, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Provider(_)));
    }
}
