//! Holding-period enforcement.
//!
//! Positions must live at least `min_holding_days` before a routine close and
//! are recommended for closure at `max_holding_days`. Early closes can be
//! unlocked by a sufficiently severe regime transition, rate-limited by a
//! per-asset override cooldown that this manager tracks independently.

use crate::domain::regime::{RegimeTransition, Severity};
use crate::domain::types::Timestamp;
use chrono::Duration;
use std::collections::BTreeMap;
use tracing::debug;

/// Verdict on closing one position.
#[derive(Debug, Clone)]
pub struct HoldingCheck {
    pub allowed: bool,
    pub reason: String,
    /// Position has exceeded `max_holding_days` and should be closed.
    pub force_close: bool,
    /// A regime override could unlock this denial: the transition is severe
    /// enough and the per-asset cooldown has elapsed. Applying it is the
    /// orchestrator's call.
    pub override_available: bool,
}

pub struct HoldingPeriodManager {
    min_holding: Duration,
    max_holding: Duration,
    override_cooldown: Duration,
    severity_threshold: Severity,
    last_override: BTreeMap<String, Timestamp>,
}

impl HoldingPeriodManager {
    pub fn new(
        min_holding_days: i64,
        max_holding_days: i64,
        regime_override_cooldown_days: i64,
        severity_threshold: Severity,
    ) -> Self {
        Self {
            min_holding: Duration::days(min_holding_days),
            max_holding: Duration::days(max_holding_days),
            override_cooldown: Duration::days(regime_override_cooldown_days),
            severity_threshold,
            last_override: BTreeMap::new(),
        }
    }

    /// Judge a close. Denies while the position is younger than the minimum
    /// holding period; flags `override_available` when the supplied regime
    /// transition could unlock it.
    pub fn can_close(
        &self,
        asset: &str,
        opened_at: Timestamp,
        at: Timestamp,
        transition: Option<&RegimeTransition>,
    ) -> HoldingCheck {
        let held = at - opened_at;
        let force_close = held >= self.max_holding;

        if held < self.min_holding {
            let severe_enough = transition
                .map(|t| t.severity >= self.severity_threshold)
                .unwrap_or(false);
            let override_available = severe_enough && self.override_cooldown_elapsed(asset, at);
            return HoldingCheck {
                allowed: false,
                reason: format!(
                    "minimum holding not met: held {}d of {}d",
                    held.num_days(),
                    self.min_holding.num_days()
                ),
                force_close: false,
                override_available,
            };
        }

        let reason = if force_close {
            format!(
                "maximum holding exceeded: held {}d >= {}d",
                held.num_days(),
                self.max_holding.num_days()
            )
        } else {
            format!(
                "holding requirement met: {}d >= {}d",
                held.num_days(),
                self.min_holding.num_days()
            )
        };
        HoldingCheck {
            allowed: true,
            reason,
            force_close,
            override_available: false,
        }
    }

    /// Whether the position has outlived `max_holding_days`.
    pub fn force_close_due(&self, opened_at: Timestamp, at: Timestamp) -> bool {
        at - opened_at >= self.max_holding
    }

    pub fn override_cooldown_elapsed(&self, asset: &str, at: Timestamp) -> bool {
        match self.last_override.get(asset) {
            Some(last) => at - *last >= self.override_cooldown,
            None => true,
        }
    }

    /// Arm the per-asset cooldown after an override was applied.
    pub fn record_override(&mut self, asset: &str, at: Timestamp) {
        debug!(
            "HoldingPeriod [{}]: override recorded, cooldown until {}",
            asset,
            at + self.override_cooldown
        );
        self.last_override.insert(asset.to_string(), at);
    }
}
