use crate::domain::types::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Coarse event grouping used for indexing and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventCategory {
    Portfolio,
    Protection,
    Regime,
    Rebalance,
    Error,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCategory::Portfolio => write!(f, "portfolio"),
            EventCategory::Protection => write!(f, "protection"),
            EventCategory::Regime => write!(f, "regime"),
            EventCategory::Rebalance => write!(f, "rebalance"),
            EventCategory::Error => write!(f, "error"),
        }
    }
}

/// One record in the append-only event log.
///
/// `id` is assigned by the store at append time and is lexicographically
/// sortable in append order. `trace_id` links the events of a single
/// protection decision or rebalance run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub category: EventCategory,
    pub event_type: String,
    pub at: Timestamp,
    pub asset: Option<String>,
    pub session_id: Uuid,
    pub trace_id: Option<Uuid>,
    pub action: Option<String>,
    pub reason: String,
    pub payload: Value,
}

impl Event {
    pub fn new(
        category: EventCategory,
        event_type: impl Into<String>,
        at: Timestamp,
        session_id: Uuid,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            category,
            event_type: event_type.into(),
            at,
            asset: None,
            session_id,
            trace_id: None,
            action: None,
            reason: reason.into(),
            payload: Value::Null,
        }
    }

    pub fn with_asset(mut self, asset: impl Into<String>) -> Self {
        self.asset = Some(asset.into());
        self
    }

    pub fn with_trace(mut self, trace_id: Uuid) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Query filter for the event log. All populated fields must match.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub category: Option<EventCategory>,
    pub event_type: Option<String>,
    pub asset: Option<String>,
    pub session_id: Option<Uuid>,
    pub trace_id: Option<Uuid>,
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
}

impl EventFilter {
    pub fn by_category(category: EventCategory) -> Self {
        Self {
            category: Some(category),
            ..Default::default()
        }
    }

    pub fn by_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Default::default()
        }
    }

    pub fn by_asset(asset: impl Into<String>) -> Self {
        Self {
            asset: Some(asset.into()),
            ..Default::default()
        }
    }

    pub fn by_trace(trace_id: Uuid) -> Self {
        Self {
            trace_id: Some(trace_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(category) = self.category {
            if event.category != category {
                return false;
            }
        }
        if let Some(ref event_type) = self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        if let Some(ref asset) = self.asset {
            if event.asset.as_deref() != Some(asset.as_str()) {
                return false;
            }
        }
        if let Some(session_id) = self.session_id {
            if event.session_id != session_id {
                return false;
            }
        }
        if let Some(trace_id) = self.trace_id {
            if event.trace_id != Some(trace_id) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.at > to {
                return false;
            }
        }
        true
    }
}

/// Aggregate log statistics over a time window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStatistics {
    pub total: usize,
    pub counts_by_category: std::collections::BTreeMap<String, usize>,
    pub error_count: usize,
    pub append_p50_ms: f64,
    pub append_p99_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_event() -> Event {
        Event::new(
            EventCategory::Protection,
            "protection_decision_complete",
            Utc::now(),
            Uuid::new_v4(),
            "all checks passed",
        )
        .with_asset("AAPL")
        .with_action("open")
    }

    #[test]
    fn test_filter_matches_category_and_asset() {
        let event = sample_event();
        assert!(EventFilter::by_category(EventCategory::Protection).matches(&event));
        assert!(!EventFilter::by_category(EventCategory::Regime).matches(&event));
        assert!(EventFilter::by_asset("AAPL").matches(&event));
        assert!(!EventFilter::by_asset("MSFT").matches(&event));
    }

    #[test]
    fn test_filter_matches_trace() {
        let trace = Uuid::new_v4();
        let event = sample_event().with_trace(trace);
        assert!(EventFilter::by_trace(trace).matches(&event));
        assert!(!EventFilter::by_trace(Uuid::new_v4()).matches(&event));
    }

    #[test]
    fn test_filter_time_range_is_inclusive() {
        let event = sample_event();
        let filter = EventFilter {
            from: Some(event.at),
            to: Some(event.at),
            ..Default::default()
        };
        assert!(filter.matches(&event));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(EventFilter::default().matches(&sample_event()));
    }
}
