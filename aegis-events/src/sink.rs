//! Durable persistence boundary for the event store.
//!
//! The sink must preserve exactly the bytes appended; hash verification on
//! read depends on byte-for-byte fidelity. Durability-on-success is the
//! sink's contract, not the store's.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink cannot accept more records right now.
    #[error("sink backpressure")]
    Backpressure,

    #[error("unknown stream: {0}")]
    UnknownStream(String),

    #[error("sink i/o error: {0}")]
    Io(String),
}

/// Append-only record storage keyed by logical stream name
/// (`incidents/{id}`). Positions are zero-based and contiguous per stream.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Append one canonical record; durable on success. Returns the
    /// position of the appended record within the stream.
    async fn append(&self, stream: &str, bytes: &[u8]) -> Result<u64, SinkError>;

    /// Read records `[from, to]` (inclusive, `to = None` for the tail).
    async fn read(&self, stream: &str, from: u64, to: Option<u64>)
        -> Result<Vec<Vec<u8>>, SinkError>;

    /// Position of the last record in the stream, if any.
    async fn head(&self, stream: &str) -> Result<Option<u64>, SinkError>;
}

/// In-memory sink for tests and single-process deployments. Streams are
/// bounded; appends past the bound report backpressure.
pub struct MemoryEventSink {
    streams: DashMap<String, Vec<Vec<u8>>>,
    max_stream_len: usize,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::with_capacity(100_000)
    }

    pub fn with_capacity(max_stream_len: usize) -> Self {
        Self {
            streams: DashMap::new(),
            max_stream_len,
        }
    }

    /// Chaos harness: flip one byte of a stored record in place. Exists so
    /// tamper detection can be exercised end to end.
    pub fn corrupt(&self, stream: &str, position: u64, byte_index: usize) -> bool {
        match self.streams.get_mut(stream) {
            Some(mut records) => match records.get_mut(position as usize) {
                Some(record) if byte_index < record.len() => {
                    record[byte_index] ^= 0xFF;
                    true
                }
                _ => false,
            },
            None => false,
        }
    }
}

impl Default for MemoryEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn append(&self, stream: &str, bytes: &[u8]) -> Result<u64, SinkError> {
        let mut records = self.streams.entry(stream.to_string()).or_default();
        if records.len() >= self.max_stream_len {
            return Err(SinkError::Backpressure);
        }
        records.push(bytes.to_vec());
        Ok((records.len() - 1) as u64)
    }

    async fn read(
        &self,
        stream: &str,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<Vec<u8>>, SinkError> {
        let records = self
            .streams
            .get(stream)
            .ok_or_else(|| SinkError::UnknownStream(stream.to_string()))?;

        let from = from as usize;
        let to = to
            .map(|t| (t as usize).min(records.len().saturating_sub(1)))
            .unwrap_or_else(|| records.len().saturating_sub(1));

        if records.is_empty() || from >= records.len() || to < from {
            return Ok(Vec::new());
        }
        Ok(records[from..=to].to_vec())
    }

    async fn head(&self, stream: &str) -> Result<Option<u64>, SinkError> {
        Ok(self
            .streams
            .get(stream)
            .and_then(|r| r.len().checked_sub(1).map(|p| p as u64)))
    }
}
