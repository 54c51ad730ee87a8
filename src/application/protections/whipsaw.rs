//! Whipsaw protection.
//!
//! Prevents rapid open/close cycling by capping completed cycles per rolling
//! window and enforcing a minimum position duration. Cycle counts derive
//! from the ledger's event stream; this tracker never mutates the ledger.

use crate::domain::ledger::PositionLedger;
use crate::domain::position::PositionEvent;
use crate::domain::types::Timestamp;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Count cache entry lifetime. Any new event for the asset invalidates it
/// early.
const CYCLE_CACHE_TTL_HOURS: i64 = 1;

/// Churn counters. Blocked opens, blocked closes and the cycles-prevented
/// estimate are tracked separately; the estimate equals the number of
/// blocked opens, each of which would have started at most one new cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhipsawMetrics {
    pub blocked_opens: u64,
    pub blocked_closes: u64,
    pub allowed_opens: u64,
    pub allowed_closes: u64,
    pub overrides_used: u64,
    per_asset: BTreeMap<String, AssetChurnStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetChurnStats {
    pub blocked: u64,
    pub allowed: u64,
}

impl WhipsawMetrics {
    pub fn estimated_cycles_prevented(&self) -> u64 {
        self.blocked_opens
    }

    pub fn asset_stats(&self, asset: &str) -> AssetChurnStats {
        self.per_asset.get(asset).cloned().unwrap_or_default()
    }

    /// Fraction of decisions blocked, discounted by override churn.
    pub fn effectiveness(&self) -> f64 {
        let total =
            self.blocked_opens + self.blocked_closes + self.allowed_opens + self.allowed_closes;
        if total == 0 {
            return 0.0;
        }
        let protection_rate = (self.blocked_opens + self.blocked_closes) as f64 / total as f64;
        let override_rate = self.overrides_used as f64 / total as f64;
        protection_rate * (1.0 - override_rate * 0.5)
    }

    fn record(&mut self, asset: &str, open: bool, blocked: bool) {
        match (open, blocked) {
            (true, true) => self.blocked_opens += 1,
            (true, false) => self.allowed_opens += 1,
            (false, true) => self.blocked_closes += 1,
            (false, false) => self.allowed_closes += 1,
        }
        let stats = self.per_asset.entry(asset.to_string()).or_default();
        if blocked {
            stats.blocked += 1;
        } else {
            stats.allowed += 1;
        }
    }
}

/// Rolling-window cycle limiter with a per-asset count cache.
pub struct WhipsawTracker {
    max_cycles_per_period: usize,
    protection_period: Duration,
    min_position_duration: Duration,
    cycle_cache: BTreeMap<String, (usize, Timestamp)>,
    metrics: WhipsawMetrics,
}

impl WhipsawTracker {
    pub fn new(
        max_cycles_per_period: usize,
        protection_period_days: i64,
        min_position_duration_hours: i64,
    ) -> Self {
        Self {
            max_cycles_per_period,
            protection_period: Duration::days(protection_period_days),
            min_position_duration: Duration::hours(min_position_duration_hours),
            cycle_cache: BTreeMap::new(),
            metrics: WhipsawMetrics::default(),
        }
    }

    /// Deny an open when the asset's completed cycles inside
    /// `[at - period, at]` have reached the budget.
    pub fn can_open(
        &mut self,
        ledger: &PositionLedger,
        asset: &str,
        at: Timestamp,
    ) -> (bool, String) {
        let cycles = self.recent_cycles(ledger, asset, at);
        let (allowed, reason) = if cycles >= self.max_cycles_per_period {
            (
                false,
                format!(
                    "cycle limit reached: {}/{} in {} days",
                    cycles,
                    self.max_cycles_per_period,
                    self.protection_period.num_days()
                ),
            )
        } else {
            (
                true,
                format!("within cycle limits: {}/{}", cycles, self.max_cycles_per_period),
            )
        };
        self.metrics.record(asset, true, !allowed);
        (allowed, reason)
    }

    /// Deny a close while the position is younger than the minimum duration.
    pub fn can_close(&mut self, asset: &str, opened_at: Timestamp, at: Timestamp) -> (bool, String) {
        let held = at - opened_at;
        let (allowed, reason) = if held < self.min_position_duration {
            (
                false,
                format!(
                    "minimum duration not met: held {}h of {}h",
                    held.num_hours(),
                    self.min_position_duration.num_hours()
                ),
            )
        } else {
            (
                true,
                format!(
                    "duration requirement met: {}h >= {}h",
                    held.num_hours(),
                    self.min_position_duration.num_hours()
                ),
            )
        };
        self.metrics.record(asset, false, !allowed);
        (allowed, reason)
    }

    /// Invalidate the cached cycle count whenever the asset's stream grows.
    pub fn on_event(&mut self, event: &PositionEvent) {
        if self.cycle_cache.remove(&event.asset).is_some() {
            debug!("WhipsawTracker [{}]: cycle cache invalidated", event.asset);
        }
    }

    /// Called by the orchestrator when a regime override bypassed a whipsaw
    /// block.
    pub fn record_override(&mut self) {
        self.metrics.overrides_used += 1;
    }

    pub fn metrics(&self) -> &WhipsawMetrics {
        &self.metrics
    }

    pub fn recent_cycles(&mut self, ledger: &PositionLedger, asset: &str, at: Timestamp) -> usize {
        if let Some((count, cached_at)) = self.cycle_cache.get(asset) {
            if at - *cached_at < Duration::hours(CYCLE_CACHE_TTL_HOURS) {
                return *count;
            }
        }
        let count = ledger.cycles(asset, at - self.protection_period, at).len();
        self.cycle_cache.insert(asset.to_string(), (count, at));
        count
    }
}
