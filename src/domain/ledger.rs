//! Position Ledger
//!
//! Canonical store of live positions and their event histories. The ledger is
//! the only component allowed to mutate position state; the lifecycle
//! trackers derive their views from its event stream.

use crate::domain::errors::LedgerError;
use crate::domain::position::{Cycle, Position, PositionEvent, PositionEventKind};
use crate::domain::types::Timestamp;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// A position event before the ledger has assigned it an id.
#[derive(Debug, Clone)]
pub struct NewPositionEvent {
    pub asset: String,
    pub kind: PositionEventKind,
    pub at: Timestamp,
    pub size_after: Decimal,
    pub metadata: Value,
}

impl NewPositionEvent {
    pub fn open(asset: impl Into<String>, at: Timestamp, size: Decimal) -> Self {
        Self {
            asset: asset.into(),
            kind: PositionEventKind::Open,
            at,
            size_after: size,
            metadata: Value::Null,
        }
    }

    pub fn close(asset: impl Into<String>, at: Timestamp) -> Self {
        Self {
            asset: asset.into(),
            kind: PositionEventKind::Close,
            at,
            size_after: Decimal::ZERO,
            metadata: Value::Null,
        }
    }

    pub fn adjust(asset: impl Into<String>, at: Timestamp, size_after: Decimal) -> Self {
        Self {
            asset: asset.into(),
            kind: PositionEventKind::Adjust,
            at,
            size_after,
            metadata: Value::Null,
        }
    }
}

/// Canonical position store. Single-writer per session.
pub struct PositionLedger {
    allocation_cap: Decimal,
    events: BTreeMap<String, Vec<PositionEvent>>,
    cycles: BTreeMap<String, Vec<Cycle>>,
    live: BTreeMap<String, Position>,
    next_seq: u64,
}

impl PositionLedger {
    pub fn new(allocation_cap: Decimal) -> Self {
        Self {
            allocation_cap,
            events: BTreeMap::new(),
            cycles: BTreeMap::new(),
            live: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Append a position event and update the derived live-position map.
    ///
    /// Fails when the event is not strictly after the asset's last event,
    /// when an open overlaps a live position, when a close/adjust has no live
    /// position, or when the total live allocation would exceed the cap.
    pub fn record_event(&mut self, draft: NewPositionEvent) -> Result<PositionEvent, LedgerError> {
        let asset = draft.asset.clone();

        if let Some(last) = self.events.get(&asset).and_then(|v| v.last()) {
            if draft.at <= last.at {
                return Err(LedgerError::OutOfOrderEvent {
                    asset,
                    at: draft.at.to_rfc3339(),
                    last: last.at.to_rfc3339(),
                });
            }
        }

        match draft.kind {
            PositionEventKind::Open => {
                if self.live.contains_key(&asset) {
                    return Err(LedgerError::OverlappingOpen { asset });
                }
                self.check_allocation(&asset, draft.size_after)?;
            }
            PositionEventKind::Close => {
                if !self.live.contains_key(&asset) {
                    return Err(LedgerError::NoLivePosition { asset });
                }
            }
            PositionEventKind::Adjust => {
                if !self.live.contains_key(&asset) {
                    return Err(LedgerError::NoLivePosition { asset });
                }
                self.check_allocation(&asset, draft.size_after)?;
            }
        }

        let event = PositionEvent {
            asset: asset.clone(),
            kind: draft.kind,
            at: draft.at,
            size_after: draft.size_after,
            event_id: self.next_event_id(draft.at),
            metadata: draft.metadata,
        };

        match event.kind {
            PositionEventKind::Open => {
                self.live.insert(
                    asset.clone(),
                    Position {
                        asset: asset.clone(),
                        size_pct: event.size_after,
                        opened_at: event.at,
                        last_adjusted_at: event.at,
                        bucket_tags: Vec::new(),
                        is_core: false,
                    },
                );
            }
            PositionEventKind::Close => {
                self.live.remove(&asset);
                self.complete_cycle(&event);
            }
            PositionEventKind::Adjust => {
                if let Some(position) = self.live.get_mut(&asset) {
                    position.size_pct = event.size_after;
                    position.last_adjusted_at = event.at;
                }
            }
        }

        debug!(
            "Ledger [{}]: {} recorded at {} (size_after={})",
            asset, event.kind, event.at, event.size_after
        );

        self.events.entry(asset).or_default().push(event.clone());
        Ok(event)
    }

    /// Current live positions, keyed by asset.
    pub fn live_positions(&self) -> &BTreeMap<String, Position> {
        &self.live
    }

    pub fn position(&self, asset: &str) -> Option<&Position> {
        self.live.get(asset)
    }

    pub fn current_size(&self, asset: &str) -> Decimal {
        self.live
            .get(asset)
            .map(|p| p.size_pct)
            .unwrap_or(Decimal::ZERO)
    }

    /// Sum of live allocation fractions.
    pub fn total_allocation(&self) -> Decimal {
        self.live.values().map(|p| p.size_pct).sum()
    }

    /// Event history for an asset, optionally windowed (inclusive bounds).
    pub fn history(
        &self,
        asset: &str,
        window: Option<(Timestamp, Timestamp)>,
    ) -> Vec<PositionEvent> {
        let events = match self.events.get(asset) {
            Some(events) => events,
            None => return Vec::new(),
        };
        match window {
            None => events.clone(),
            Some((from, to)) => events
                .iter()
                .filter(|e| e.at >= from && e.at <= to)
                .cloned()
                .collect(),
        }
    }

    /// Completed cycles whose close falls inside `[from, to]`, inclusive of
    /// both ends. An unmatched open is not a cycle.
    pub fn cycles(&self, asset: &str, from: Timestamp, to: Timestamp) -> Vec<Cycle> {
        self.cycles
            .get(asset)
            .map(|cycles| {
                cycles
                    .iter()
                    .filter(|c| c.closed_at >= from && c.closed_at <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All events at or after `cutoff`, across assets, in recording order.
    /// Used for checkpoint snapshots.
    pub fn events_since(&self, cutoff: Timestamp) -> Vec<PositionEvent> {
        let mut events: Vec<PositionEvent> = self
            .events
            .values()
            .flatten()
            .filter(|e| e.at >= cutoff)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        events
    }

    /// Most recent event for an asset, optionally filtered by kind.
    pub fn last_event(&self, asset: &str, kind: Option<PositionEventKind>) -> Option<&PositionEvent> {
        let events = self.events.get(asset)?;
        match kind {
            None => events.last(),
            Some(kind) => events.iter().rev().find(|e| e.kind == kind),
        }
    }

    /// Attach bucket tags to a live position.
    pub fn tag_position(&mut self, asset: &str, bucket_tags: Vec<String>) {
        if let Some(position) = self.live.get_mut(asset) {
            position.bucket_tags = bucket_tags;
        }
    }

    /// Flag or unflag a live position as core.
    pub fn mark_core(&mut self, asset: &str, is_core: bool) {
        if let Some(position) = self.live.get_mut(asset) {
            position.is_core = is_core;
        }
    }

    /// Drop events and cycles older than `cutoff`. Open events backing a live
    /// position are always retained so `opened_at` stays reconstructible.
    pub fn prune(&mut self, cutoff: Timestamp) {
        for (asset, events) in self.events.iter_mut() {
            let live_open = self.live.get(asset).map(|p| p.opened_at);
            events.retain(|e| e.at >= cutoff || Some(e.at) == live_open);
        }
        for cycles in self.cycles.values_mut() {
            cycles.retain(|c| c.closed_at >= cutoff);
        }
    }

    fn check_allocation(&self, asset: &str, size_after: Decimal) -> Result<(), LedgerError> {
        let total_without: Decimal = self
            .live
            .iter()
            .filter(|(a, _)| a.as_str() != asset)
            .map(|(_, p)| p.size_pct)
            .sum();
        let total = total_without + size_after;
        if total > self.allocation_cap {
            return Err(LedgerError::AllocationCapExceeded {
                total: total.to_string(),
                cap: self.allocation_cap.to_string(),
            });
        }
        Ok(())
    }

    /// Pair the close with the most recent prior open that has not already
    /// been consumed by a cycle.
    fn complete_cycle(&mut self, close_event: &PositionEvent) {
        let asset = close_event.asset.as_str();
        let open_event = match self.events.get(asset).and_then(|events| {
            events
                .iter()
                .rev()
                .find(|e| e.kind == PositionEventKind::Open && e.at < close_event.at)
        }) {
            Some(open) => open.clone(),
            None => return,
        };

        let already_used = self
            .cycles
            .get(asset)
            .map(|cycles| cycles.iter().any(|c| c.open_event_id == open_event.event_id))
            .unwrap_or(false);
        if already_used {
            return;
        }

        let cycle = Cycle {
            asset: asset.to_string(),
            opened_at: open_event.at,
            closed_at: close_event.at,
            open_event_id: open_event.event_id,
            close_event_id: close_event.event_id.clone(),
        };
        debug!(
            "Ledger [{}]: cycle completed, {} -> {}",
            asset, cycle.opened_at, cycle.closed_at
        );
        self.cycles.entry(asset.to_string()).or_default().push(cycle);
    }

    /// Fixed-width millis + sequence, so ids sort lexicographically in
    /// recording order.
    fn next_event_id(&mut self, at: Timestamp) -> String {
        let seq = self.next_seq;
        self.next_seq += 1;
        format!("{:013}-{:08}", at.timestamp_millis().max(0), seq)
    }
}
