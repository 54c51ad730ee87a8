//! Grace periods.
//!
//! An underperforming position is not closed outright: it enters a bounded
//! grace interval during which its size decays daily, giving the score a
//! chance to recover. Expiry produces a close request at the next rebalance.

use crate::domain::types::{RebalanceAction, Timestamp};
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Decay schedule for one asset. At most one active per asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraceState {
    pub asset: String,
    pub started_at: Timestamp,
    pub original_size: Decimal,
    pub current_size: Decimal,
    pub decay_factor: f64,
    pub ends_at: Timestamp,
    pub reason: String,
    last_decay_at: Timestamp,
}

impl GraceState {
    /// Smallest size decay may reach.
    pub fn floor_size(&self, min_decay_factor: f64) -> Decimal {
        self.original_size * Decimal::from_f64_retain(min_decay_factor).unwrap_or(Decimal::ZERO)
    }
}

/// A decay step the session must apply to the ledger.
#[derive(Debug, Clone)]
pub struct GraceDecay {
    pub asset: String,
    pub new_size: Decimal,
    pub decay_factor: f64,
}

/// Lifecycle notification emitted by `on_score`.
#[derive(Debug, Clone)]
pub enum GraceUpdate {
    Started(GraceState),
    Cleared(GraceState),
}

/// Orchestrator-facing verdict on one action against a grace position.
#[derive(Debug, Clone)]
pub struct GraceCheck {
    pub blocked: bool,
    pub reason: String,
    pub size_related: bool,
}

pub struct GracePeriodManager {
    grace_period: Duration,
    decay_rate: f64,
    min_decay_factor: f64,
    min_score_threshold: f64,
    active: BTreeMap<String, GraceState>,
}

impl GracePeriodManager {
    pub fn new(
        grace_period_days: i64,
        decay_rate: f64,
        min_decay_factor: f64,
        min_score_threshold: f64,
    ) -> Self {
        Self {
            grace_period: Duration::days(grace_period_days),
            decay_rate,
            min_decay_factor,
            min_score_threshold,
            active: BTreeMap::new(),
        }
    }

    /// Feed the latest score for a held asset. Scores below the threshold
    /// start a grace period; recovery at or above it clears one. Within a
    /// single rebalance step the final snapshot score wins, which this
    /// naturally implements because the caller submits that score.
    pub fn on_score(
        &mut self,
        asset: &str,
        score: f64,
        at: Timestamp,
        position_size: Decimal,
    ) -> Option<GraceUpdate> {
        if score < self.min_score_threshold {
            if self.active.contains_key(asset) {
                return None;
            }
            let state = GraceState {
                asset: asset.to_string(),
                started_at: at,
                original_size: position_size,
                current_size: position_size,
                decay_factor: 1.0,
                ends_at: at + self.grace_period,
                reason: format!(
                    "score {:.3} below threshold {:.3}",
                    score, self.min_score_threshold
                ),
                last_decay_at: at,
            };
            info!(
                "GracePeriod [{}]: started, ends {} (score {:.3})",
                asset, state.ends_at, score
            );
            self.active.insert(asset.to_string(), state.clone());
            Some(GraceUpdate::Started(state))
        } else if let Some(state) = self.active.remove(asset) {
            info!("GracePeriod [{}]: cleared, score recovered to {:.3}", asset, score);
            Some(GraceUpdate::Cleared(state))
        } else {
            None
        }
    }

    /// Apply decay proportional to the days elapsed since each state's last
    /// tick. Returns the size adjustments the caller must mirror into the
    /// ledger. Sizes never fall below `original_size * min_decay_factor`.
    pub fn tick(&mut self, at: Timestamp) -> Vec<GraceDecay> {
        let mut decays = Vec::new();
        for state in self.active.values_mut() {
            let elapsed_days =
                (at - state.last_decay_at).num_seconds() as f64 / Duration::days(1).num_seconds() as f64;
            if elapsed_days <= 0.0 {
                continue;
            }
            let factor = (state.decay_factor * self.decay_rate.powf(elapsed_days))
                .max(self.min_decay_factor);
            if factor >= state.decay_factor {
                continue;
            }
            state.decay_factor = factor;
            state.last_decay_at = at;
            let new_size = (state.original_size
                * Decimal::from_f64_retain(factor).unwrap_or(Decimal::ONE))
            .round_dp(6);
            state.current_size = new_size;
            debug!(
                "GracePeriod [{}]: decayed to factor {:.4}, size {}",
                state.asset, factor, new_size
            );
            decays.push(GraceDecay {
                asset: state.asset.clone(),
                new_size,
                decay_factor: factor,
            });
        }
        decays
    }

    /// Grace states whose window has expired; each becomes a close request
    /// at the next rebalance.
    pub fn due_closures(&self, at: Timestamp) -> Vec<GraceState> {
        self.active
            .values()
            .filter(|s| at >= s.ends_at)
            .cloned()
            .collect()
    }

    /// Forget a state once its position has been closed.
    pub fn clear(&mut self, asset: &str) -> Option<GraceState> {
        self.active.remove(asset)
    }

    pub fn is_in_grace(&self, asset: &str) -> bool {
        self.active.contains_key(asset)
    }

    pub fn state(&self, asset: &str) -> Option<&GraceState> {
        self.active.get(asset)
    }

    /// Current size multiplier for an asset, 1.0 when not in grace.
    pub fn active_decay(&self, asset: &str) -> f64 {
        self.active.get(asset).map(|s| s.decay_factor).unwrap_or(1.0)
    }

    /// Judge an action against the decayed trajectory. Close and increase
    /// disturb it outright; a decrease is fine down to the decay floor and
    /// size-related below it.
    pub fn evaluate(&self, asset: &str, action: RebalanceAction, target_size: Decimal) -> GraceCheck {
        let state = match self.active.get(asset) {
            Some(state) => state,
            None => {
                return GraceCheck {
                    blocked: false,
                    reason: "not in grace".to_string(),
                    size_related: false,
                };
            }
        };
        match action {
            RebalanceAction::Close => GraceCheck {
                blocked: true,
                reason: format!("grace active until {}", state.ends_at),
                size_related: false,
            },
            RebalanceAction::Increase => GraceCheck {
                blocked: true,
                reason: "increase would disturb decay schedule".to_string(),
                size_related: false,
            },
            RebalanceAction::Decrease => {
                let floor = state.floor_size(self.min_decay_factor);
                if target_size < floor {
                    GraceCheck {
                        blocked: true,
                        reason: format!("decrease below decay floor {}", floor),
                        size_related: true,
                    }
                } else {
                    GraceCheck {
                        blocked: false,
                        reason: "decrease within decay trajectory".to_string(),
                        size_related: false,
                    }
                }
            }
            RebalanceAction::Open | RebalanceAction::Hold => GraceCheck {
                blocked: false,
                reason: "action outside grace scope".to_string(),
                size_related: false,
            },
        }
    }

    /// Smallest allowed decrease target for a grace asset.
    pub fn floor_size(&self, asset: &str) -> Option<Decimal> {
        self.active
            .get(asset)
            .map(|s| s.floor_size(self.min_decay_factor))
    }

    /// Snapshot of active states for checkpointing.
    pub fn snapshot(&self) -> Vec<GraceState> {
        self.active.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 3, 0, 0, 0).unwrap()
    }

    fn manager() -> GracePeriodManager {
        GracePeriodManager::new(5, 0.8, 0.1, 0.6)
    }

    #[test]
    fn test_low_score_starts_grace() {
        let mut manager = manager();
        let update = manager.on_score("B", 0.45, t0(), dec!(0.30));
        assert!(matches!(update, Some(GraceUpdate::Started(_))));
        assert!(manager.is_in_grace("B"));
        let state = manager.state("B").unwrap();
        assert_eq!(state.ends_at, t0() + Duration::days(5));
        assert_eq!(state.current_size, dec!(0.30));
    }

    #[test]
    fn test_second_low_score_does_not_restart() {
        let mut manager = manager();
        manager.on_score("B", 0.45, t0(), dec!(0.30));
        let update = manager.on_score("B", 0.40, t0() + Duration::days(1), dec!(0.30));
        assert!(update.is_none());
        assert_eq!(manager.state("B").unwrap().started_at, t0());
    }

    #[test]
    fn test_recovery_clears_grace() {
        let mut manager = manager();
        manager.on_score("B", 0.45, t0(), dec!(0.30));
        let update = manager.on_score("B", 0.72, t0() + Duration::days(2), dec!(0.30));
        assert!(matches!(update, Some(GraceUpdate::Cleared(_))));
        assert!(!manager.is_in_grace("B"));
    }

    #[test]
    fn test_decay_is_monotonic_and_floored() {
        let mut manager = manager();
        manager.on_score("B", 0.45, t0(), dec!(1.0));

        let mut last = dec!(1.0);
        for day in 1..=20 {
            let decays = manager.tick(t0() + Duration::days(day));
            if let Some(decay) = decays.first() {
                assert!(decay.new_size <= last);
                last = decay.new_size;
            }
        }
        // 0.8^20 would be ~0.0115; the floor holds at 0.1.
        let state = manager.state("B").unwrap();
        assert!((state.decay_factor - 0.1).abs() < 1e-9);
        assert_eq!(state.current_size, dec!(0.1));
    }

    #[test]
    fn test_tick_without_elapsed_time_is_a_noop() {
        let mut manager = manager();
        manager.on_score("B", 0.45, t0(), dec!(0.30));
        assert!(manager.tick(t0()).is_empty());
    }

    #[test]
    fn test_due_closures_after_expiry() {
        let mut manager = manager();
        manager.on_score("B", 0.45, t0(), dec!(0.30));
        assert!(manager.due_closures(t0() + Duration::days(4)).is_empty());
        let due = manager.due_closures(t0() + Duration::days(5));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].asset, "B");
    }

    #[test]
    fn test_evaluate_blocks_close_and_increase() {
        let mut manager = manager();
        manager.on_score("B", 0.45, t0(), dec!(0.30));
        assert!(manager.evaluate("B", RebalanceAction::Close, Decimal::ZERO).blocked);
        assert!(
            manager
                .evaluate("B", RebalanceAction::Increase, dec!(0.40))
                .blocked
        );
        assert!(!manager.evaluate("A", RebalanceAction::Close, Decimal::ZERO).blocked);
    }

    #[test]
    fn test_evaluate_decrease_against_floor() {
        let mut manager = manager();
        manager.on_score("B", 0.45, t0(), dec!(0.30));
        // Floor is 0.30 * 0.1 = 0.03.
        let below = manager.evaluate("B", RebalanceAction::Decrease, dec!(0.01));
        assert!(below.blocked);
        assert!(below.size_related);
        let above = manager.evaluate("B", RebalanceAction::Decrease, dec!(0.10));
        assert!(!above.blocked);
    }
}
