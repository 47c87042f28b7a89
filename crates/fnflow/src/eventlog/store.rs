//! The event log contract: append-only, per-aggregate streams with optimistic
//! concurrency, plus a live tail for subscribers.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::event::{AggregateRef, Event, EventPayload};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no events found for aggregate {0:?}")]
    NotFound(AggregateRef),

    #[error("concurrency conflict on {aggregate:?}: expected sequence {expected}, actual {actual}")]
    ConcurrencyConflict {
        aggregate: AggregateRef,
        expected: u64,
        actual: u64,
    },

    /// A transient failure a caller may retry — the backing store being
    /// momentarily unreachable, a connection pool exhausted, and so on.
    #[error("event log temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

// Allow `#[error("no events found for aggregate {0:?}")]` to pattern-match
// against a struct-style variant name in `From<StoreError> for EngineError`.
impl StoreError {
    pub fn not_found(aggregate: AggregateRef) -> Self {
        StoreError::NotFound(aggregate)
    }
}

/// Append-only event storage for aggregate streams, with a live tail for
/// the bus to subscribe to.
///
/// Implementations must guarantee that `append` is atomic per aggregate:
/// either all of `events` land at consecutive sequence numbers starting
/// after `expected_sequence`, or none do.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends `events` to `aggregate`'s stream. `expected_sequence` is the
    /// caller's belief about the current tail sequence (0 for a brand new
    /// stream); a mismatch returns `ConcurrencyConflict` so the caller can
    /// reload and retry. Returns the sequence number of the last event
    /// written.
    async fn append(
        &self,
        aggregate: AggregateRef,
        expected_sequence: u64,
        events: Vec<EventPayload>,
        idempotency_key: Option<String>,
    ) -> Result<u64, StoreError>;

    /// Loads the full event stream for `aggregate`, oldest first.
    async fn replay(&self, aggregate: &AggregateRef) -> Result<Vec<Event>, StoreError>;

    /// Subscribes to every event appended from now on, across all
    /// aggregates. Callers filter by aggregate type/id themselves, or hand
    /// the receiver to [`crate::bus::EventBus`] for selector-based routing.
    fn watch(&self) -> broadcast::Receiver<Event>;
}
