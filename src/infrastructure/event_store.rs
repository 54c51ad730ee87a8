//! In-Memory Event Store
//!
//! Thread-safe, indexed, append-only implementation of the event log.
//! Suitable for backtest sessions, which own their store exclusively; the
//! harness can persist snapshots if it wants durability across restarts.

use crate::domain::errors::EngineError;
use crate::domain::events::{Event, EventCategory, EventFilter, EventStatistics};
use crate::domain::repositories::EventStore;
use crate::domain::types::Timestamp;
use async_trait::async_trait;
use chrono::Duration;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// How often (in appends) the retention sweep runs.
const PRUNE_INTERVAL: u64 = 256;

#[derive(Default)]
struct Indexes {
    by_category: BTreeMap<EventCategory, Vec<usize>>,
    by_asset: BTreeMap<String, Vec<usize>>,
    by_trace: HashMap<Uuid, Vec<usize>>,
}

impl Indexes {
    fn insert(&mut self, idx: usize, event: &Event) {
        self.by_category.entry(event.category).or_default().push(idx);
        if let Some(asset) = &event.asset {
            self.by_asset.entry(asset.clone()).or_default().push(idx);
        }
        if let Some(trace) = event.trace_id {
            self.by_trace.entry(trace).or_default().push(idx);
        }
    }

    fn rebuild(events: &[Event]) -> Self {
        let mut indexes = Indexes::default();
        for (idx, event) in events.iter().enumerate() {
            indexes.insert(idx, event);
        }
        indexes
    }
}

struct Inner {
    events: Vec<Event>,
    indexes: Indexes,
    /// `(event time, append wall-clock millis)` samples for statistics.
    append_latencies: Vec<(Timestamp, f64)>,
    next_seq: u64,
    appends_since_prune: u64,
    closed: bool,
    /// Set when an append failed; flushed as a best-effort error event on
    /// the next successful append.
    pending_failure_note: Option<String>,
}

pub struct InMemoryEventStore {
    retention: Duration,
    inner: RwLock<Inner>,
}

impl InMemoryEventStore {
    pub fn new(retention_days: i64) -> Self {
        Self {
            retention: Duration::days(retention_days),
            inner: RwLock::new(Inner {
                events: Vec::new(),
                indexes: Indexes::default(),
                append_latencies: Vec::new(),
                next_seq: 0,
                appends_since_prune: 0,
                closed: false,
                pending_failure_note: None,
            }),
        }
    }

    /// Simulate losing the backing sink. Appends fail until `reopen`.
    pub async fn close(&self) {
        self.inner.write().await.closed = true;
    }

    pub async fn reopen(&self) {
        self.inner.write().await.closed = false;
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn commit(inner: &mut Inner, mut event: Event, started: Instant) -> String {
        let id = format!(
            "{:013}-{:08}",
            event.at.timestamp_millis().max(0),
            inner.next_seq
        );
        inner.next_seq += 1;
        event.id = id.clone();

        let idx = inner.events.len();
        inner.indexes.insert(idx, &event);
        inner
            .append_latencies
            .push((event.at, started.elapsed().as_secs_f64() * 1000.0));
        inner.events.push(event);
        id
    }

    fn flush_failure_note(inner: &mut Inner, at: Timestamp, session_id: Uuid, started: Instant) {
        if let Some(note) = inner.pending_failure_note.take() {
            let event = Event::new(
                EventCategory::Error,
                "event_log_recovered",
                at,
                session_id,
                note,
            );
            Self::commit(inner, event, started);
        }
    }

    fn maybe_prune(inner: &mut Inner, retention: Duration) {
        inner.appends_since_prune += 1;
        if inner.appends_since_prune < PRUNE_INTERVAL {
            return;
        }
        inner.appends_since_prune = 0;
        let newest = match inner.events.last() {
            Some(event) => event.at,
            None => return,
        };
        let cutoff = newest - retention;
        let before = inner.events.len();
        inner.events.retain(|e| e.at >= cutoff);
        if inner.events.len() != before {
            debug!(
                "EventStore: pruned {} events past retention",
                before - inner.events.len()
            );
            inner.indexes = Indexes::rebuild(&inner.events);
            inner.append_latencies.retain(|(at, _)| *at >= cutoff);
        }
    }

    fn candidate_indices(inner: &Inner, filter: &EventFilter) -> Option<Vec<usize>> {
        if let Some(trace) = filter.trace_id {
            return Some(inner.indexes.by_trace.get(&trace).cloned().unwrap_or_default());
        }
        if let Some(asset) = &filter.asset {
            return Some(inner.indexes.by_asset.get(asset).cloned().unwrap_or_default());
        }
        if let Some(category) = filter.category {
            return Some(
                inner
                    .indexes
                    .by_category
                    .get(&category)
                    .cloned()
                    .unwrap_or_default(),
            );
        }
        None
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: Event) -> Result<String, EngineError> {
        let started = Instant::now();
        let mut inner = self.inner.write().await;
        if inner.closed {
            inner.pending_failure_note = Some(format!(
                "append failed while log unavailable: {} ({})",
                event.event_type, event.reason
            ));
            return Err(EngineError::EventLogUnavailable(
                "event store is closed".to_string(),
            ));
        }
        Self::flush_failure_note(&mut inner, event.at, event.session_id, started);
        let id = Self::commit(&mut inner, event, started);
        Self::maybe_prune(&mut inner, self.retention);
        Ok(id)
    }

    async fn append_batch(&self, events: Vec<Event>) -> Result<Vec<String>, EngineError> {
        let started = Instant::now();
        let mut inner = self.inner.write().await;
        if inner.closed {
            inner.pending_failure_note =
                Some(format!("batch append of {} events failed", events.len()));
            return Err(EngineError::EventLogUnavailable(
                "event store is closed".to_string(),
            ));
        }
        if let Some(first) = events.first() {
            Self::flush_failure_note(&mut inner, first.at, first.session_id, started);
        }
        let ids = events
            .into_iter()
            .map(|event| Self::commit(&mut inner, event, started))
            .collect();
        Self::maybe_prune(&mut inner, self.retention);
        Ok(ids)
    }

    async fn query(
        &self,
        filter: EventFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, EngineError> {
        let inner = self.inner.read().await;
        let mut matched: Vec<&Event> = match Self::candidate_indices(&inner, &filter) {
            Some(indices) => indices
                .into_iter()
                .filter_map(|i| inner.events.get(i))
                .filter(|e| filter.matches(e))
                .collect(),
            None => inner.events.iter().filter(|e| filter.matches(e)).collect(),
        };
        matched.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            matched.truncate(limit);
        }
        Ok(matched.into_iter().cloned().collect())
    }

    async fn count(&self) -> Result<usize, EngineError> {
        Ok(self.inner.read().await.events.len())
    }

    async fn statistics(
        &self,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<EventStatistics, EngineError> {
        let inner = self.inner.read().await;
        let mut stats = EventStatistics::default();
        for event in inner.events.iter().filter(|e| e.at >= from && e.at <= to) {
            stats.total += 1;
            *stats
                .counts_by_category
                .entry(event.category.to_string())
                .or_default() += 1;
            if event.category == EventCategory::Error {
                stats.error_count += 1;
            }
        }
        let mut latencies: Vec<f64> = inner
            .append_latencies
            .iter()
            .filter(|(at, _)| *at >= from && *at <= to)
            .map(|(_, ms)| *ms)
            .collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        stats.append_p50_ms = percentile(&latencies, 0.50);
        stats.append_p99_ms = percentile(&latencies, 0.99);
        Ok(stats)
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
