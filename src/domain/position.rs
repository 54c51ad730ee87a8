use crate::domain::types::Timestamp;
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A live position, derived from the ledger's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub asset: String,
    /// Fraction of total portfolio value, in `[0, max_single_position_pct]`.
    pub size_pct: Decimal,
    pub opened_at: Timestamp,
    pub last_adjusted_at: Timestamp,
    pub bucket_tags: Vec<String>,
    pub is_core: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionEventKind {
    Open,
    Close,
    Adjust,
}

impl fmt::Display for PositionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionEventKind::Open => write!(f, "open"),
            PositionEventKind::Close => write!(f, "close"),
            PositionEventKind::Adjust => write!(f, "adjust"),
        }
    }
}

/// One append-only record of a position change.
///
/// Events for any single asset are strictly time-ordered; `event_id` is
/// unique and lexicographically sortable in recording order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEvent {
    pub asset: String,
    pub kind: PositionEventKind,
    pub at: Timestamp,
    pub size_after: Decimal,
    pub event_id: String,
    pub metadata: Value,
}

/// A completed open-to-close pairing for one asset. Created when the close is
/// recorded; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cycle {
    pub asset: String,
    pub opened_at: Timestamp,
    pub closed_at: Timestamp,
    pub open_event_id: String,
    pub close_event_id: String,
}

impl Cycle {
    pub fn duration(&self) -> Duration {
        self.closed_at - self.opened_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_cycle_duration() {
        let opened = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let closed = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let cycle = Cycle {
            asset: "NVDA".to_string(),
            opened_at: opened,
            closed_at: closed,
            open_event_id: "a".to_string(),
            close_event_id: "b".to_string(),
        };
        assert_eq!(cycle.duration(), Duration::days(3));
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(PositionEventKind::Open.to_string(), "open");
        assert_eq!(PositionEventKind::Close.to_string(), "close");
        assert_eq!(PositionEventKind::Adjust.to_string(), "adjust");
    }
}
