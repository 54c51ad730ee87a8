use crate::domain::errors::EngineError;
use crate::domain::events::{Event, EventFilter, EventStatistics};
use crate::domain::types::Timestamp;
use async_trait::async_trait;

/// Append-only event sink with structured queries.
///
/// Writes must be durable before the caller returns a decision; if an append
/// fails the calling operation fails with it. Batches commit atomically so a
/// decision's events are never half-visible.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event, returning its assigned id.
    async fn append(&self, event: Event) -> Result<String, EngineError>;

    /// Append a group of events atomically, returning their ids in order.
    async fn append_batch(&self, events: Vec<Event>) -> Result<Vec<String>, EngineError>;

    /// Events matching the filter, ascending by `at`, optionally limited.
    async fn query(&self, filter: EventFilter, limit: Option<usize>)
    -> Result<Vec<Event>, EngineError>;

    /// Aggregate counts and append latencies over `[from, to]`.
    async fn statistics(&self, from: Timestamp, to: Timestamp)
    -> Result<EventStatistics, EngineError>;

    /// Total events currently retained; used as a checkpoint cursor.
    async fn count(&self) -> Result<usize, EngineError>;
}
