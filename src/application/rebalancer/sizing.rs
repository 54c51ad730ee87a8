//! Dynamic position sizing.
//!
//! Turns an ordered candidate list into target allocation fractions. Three
//! modes (equal weight, score weighted, adaptive) feed a two-stage pass that
//! caps single positions and renormalizes the remainder over uncapped
//! candidates. Whatever the caps strand is placed by the residual strategy
//! or left as cash.

use crate::config::{ResidualStrategy, SizingConfig, SizingMode};
use crate::domain::types::AssetPriority;
use rust_decimal::Decimal;
use tracing::debug;

/// Decimal places targets are rounded to. Fine enough that rounding noise
/// stays far below `min_position_size`.
const SIZE_DP: u32 = 6;

/// A candidate entering the sizing stage.
#[derive(Debug, Clone)]
pub struct SizingCandidate {
    pub asset: String,
    pub score: f64,
    pub priority: AssetPriority,
}

/// A candidate with its computed target.
#[derive(Debug, Clone)]
pub struct SizedPosition {
    pub asset: String,
    pub score: f64,
    pub priority: AssetPriority,
    /// Allocation before residual top-up.
    pub base_pct: Decimal,
    pub target_pct: Decimal,
}

/// Sizing result: per-asset targets plus the fraction left as cash.
#[derive(Debug, Clone)]
pub struct SizingOutcome {
    pub positions: Vec<SizedPosition>,
    pub cash_residual: Decimal,
}

pub struct SizingEngine {
    config: SizingConfig,
    max_single_position_pct: Decimal,
}

impl SizingEngine {
    pub fn new(config: SizingConfig, max_single_position_pct: Decimal) -> Self {
        Self {
            config,
            max_single_position_pct,
        }
    }

    /// Size `candidates` to reach `total_allocation`. The candidate order is
    /// preserved; callers sort by priority and score beforehand.
    pub fn size(&self, candidates: &[SizingCandidate], total_allocation: Decimal) -> SizingOutcome {
        if candidates.is_empty() || total_allocation <= Decimal::ZERO {
            return SizingOutcome {
                positions: Vec::new(),
                cash_residual: total_allocation.max(Decimal::ZERO),
            };
        }

        let weights = self.weights(candidates);
        let allocations = if self.two_stage_enabled() {
            self.allocate_two_stage(&weights, total_allocation)
        } else {
            self.allocate_single_pass(&weights, total_allocation)
        };

        let mut positions: Vec<SizedPosition> = candidates
            .iter()
            .zip(allocations)
            .map(|(candidate, pct)| SizedPosition {
                asset: candidate.asset.clone(),
                score: candidate.score,
                priority: candidate.priority,
                base_pct: pct,
                target_pct: pct,
            })
            .collect();

        let allocated: Decimal = positions.iter().map(|p| p.target_pct).sum();
        let residual = (total_allocation - allocated).max(Decimal::ZERO);
        let cash_residual = if residual > Decimal::ZERO {
            self.place_residual(&mut positions, residual)
        } else {
            Decimal::ZERO
        };

        SizingOutcome {
            positions,
            cash_residual,
        }
    }

    fn two_stage_enabled(&self) -> bool {
        // Adaptive mode always caps and renormalizes.
        self.config.enable_two_stage || self.config.sizing_mode == SizingMode::Adaptive
    }

    fn weights(&self, candidates: &[SizingCandidate]) -> Vec<Decimal> {
        match self.config.sizing_mode {
            SizingMode::EqualWeight => {
                let w = Decimal::ONE / Decimal::from(candidates.len() as u64);
                vec![w; candidates.len()]
            }
            SizingMode::ScoreWeighted | SizingMode::Adaptive => {
                let total: f64 = candidates.iter().map(|c| c.score).sum();
                if total <= 0.0 {
                    let w = Decimal::ONE / Decimal::from(candidates.len() as u64);
                    return vec![w; candidates.len()];
                }
                candidates
                    .iter()
                    .map(|c| Decimal::from_f64_retain(c.score / total).unwrap_or(Decimal::ZERO))
                    .collect()
            }
        }
    }

    fn allocate_single_pass(&self, weights: &[Decimal], total: Decimal) -> Vec<Decimal> {
        weights
            .iter()
            .map(|w| (*w * total).min(self.max_single_position_pct).round_dp(SIZE_DP))
            .collect()
    }

    /// Stage (a) caps each candidate, stage (b) renormalizes the remaining
    /// allocation over uncapped candidates, repeating until no new candidate
    /// hits the cap.
    fn allocate_two_stage(&self, weights: &[Decimal], total: Decimal) -> Vec<Decimal> {
        let cap = self.max_single_position_pct;
        let mut allocations = vec![Decimal::ZERO; weights.len()];
        let mut capped = vec![false; weights.len()];

        loop {
            let capped_total: Decimal = allocations
                .iter()
                .zip(&capped)
                .filter(|(_, c)| **c)
                .map(|(a, _)| *a)
                .sum();
            let remaining = total - capped_total;
            let free_weight: Decimal = weights
                .iter()
                .zip(&capped)
                .filter(|(_, c)| !**c)
                .map(|(w, _)| *w)
                .sum();
            if remaining <= Decimal::ZERO || free_weight <= Decimal::ZERO {
                break;
            }

            let mut newly_capped = false;
            for i in 0..weights.len() {
                if capped[i] {
                    continue;
                }
                let share = weights[i] / free_weight * remaining;
                if share >= cap {
                    allocations[i] = cap;
                    capped[i] = true;
                    newly_capped = true;
                } else {
                    allocations[i] = share;
                }
            }
            if !newly_capped {
                break;
            }
        }

        for allocation in allocations.iter_mut() {
            *allocation = allocation.round_dp(SIZE_DP);
        }
        allocations
    }

    /// Returns the fraction that stays cash after the strategy has placed
    /// what it safely can.
    fn place_residual(&self, positions: &mut [SizedPosition], residual: Decimal) -> Decimal {
        match self.config.residual_strategy {
            ResidualStrategy::CashBucket => residual,
            ResidualStrategy::Proportional => {
                let mut left = residual;
                let n = positions.len();
                if n == 0 {
                    return residual;
                }
                let slice = residual / Decimal::from(n as u64);
                for position in positions.iter_mut() {
                    let headroom = self.max_single_position_pct - position.target_pct;
                    let add = slice.min(headroom).max(Decimal::ZERO).round_dp(SIZE_DP);
                    position.target_pct += add;
                    left -= add;
                }
                left.max(Decimal::ZERO)
            }
            ResidualStrategy::SafeTopSlice => {
                // Top scorers first, bounded per asset and by each
                // position's own base size.
                let mut order: Vec<usize> = (0..positions.len()).collect();
                order.sort_by(|&a, &b| {
                    positions[b]
                        .score
                        .partial_cmp(&positions[a].score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| positions[a].asset.cmp(&positions[b].asset))
                });

                let mut left = residual;
                for idx in order {
                    if left <= Decimal::ZERO {
                        break;
                    }
                    let position = &mut positions[idx];
                    let by_cap = self.max_single_position_pct - position.target_pct;
                    let by_multiple =
                        position.base_pct * self.config.max_residual_multiple - (position.target_pct - position.base_pct);
                    let add = self
                        .config
                        .max_residual_per_asset
                        .min(by_cap)
                        .min(by_multiple)
                        .min(left)
                        .max(Decimal::ZERO)
                        .round_dp(SIZE_DP);
                    if add > Decimal::ZERO {
                        debug!(
                            "SizingEngine [{}]: residual top-slice +{}",
                            position.asset, add
                        );
                        position.target_pct += add;
                        left -= add;
                    }
                }
                left.max(Decimal::ZERO)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candidate(asset: &str, score: f64) -> SizingCandidate {
        SizingCandidate {
            asset: asset.to_string(),
            score,
            priority: AssetPriority::Portfolio,
        }
    }

    fn engine(mode: SizingMode, residual: ResidualStrategy, cap: Decimal) -> SizingEngine {
        let config = SizingConfig {
            sizing_mode: mode,
            residual_strategy: residual,
            ..Default::default()
        };
        SizingEngine::new(config, cap)
    }

    #[test]
    fn test_equal_weight_splits_evenly() {
        let engine = engine(SizingMode::EqualWeight, ResidualStrategy::CashBucket, dec!(0.40));
        let outcome = engine.size(
            &[candidate("A", 0.9), candidate("B", 0.8), candidate("C", 0.7)],
            dec!(0.90),
        );
        for position in &outcome.positions {
            assert_eq!(position.target_pct, dec!(0.30));
        }
        assert_eq!(outcome.cash_residual, Decimal::ZERO);
    }

    #[test]
    fn test_score_weighted_is_proportional() {
        let engine = engine(
            SizingMode::ScoreWeighted,
            ResidualStrategy::CashBucket,
            dec!(0.90),
        );
        let outcome = engine.size(&[candidate("A", 0.6), candidate("B", 0.3)], dec!(0.90));
        // 2:1 split of 0.90.
        assert_eq!(outcome.positions[0].target_pct, dec!(0.600000));
        assert_eq!(outcome.positions[1].target_pct, dec!(0.300000));
    }

    #[test]
    fn test_two_stage_caps_and_renormalizes() {
        let engine = engine(SizingMode::Adaptive, ResidualStrategy::CashBucket, dec!(0.40));
        // Dominant scorer would take 0.6 of 0.9; the cap strands it at 0.40
        // and the rest renormalizes over the other two.
        let outcome = engine.size(
            &[candidate("A", 0.9), candidate("B", 0.3), candidate("C", 0.15)],
            dec!(0.90),
        );
        assert_eq!(outcome.positions[0].target_pct, dec!(0.40));
        let total: Decimal = outcome.positions.iter().map(|p| p.target_pct).sum();
        assert!(total <= dec!(0.90));
        assert!((dec!(0.90) - total - outcome.cash_residual).abs() < dec!(0.000001));
    }

    #[test]
    fn test_all_capped_leaves_residual() {
        let engine = engine(SizingMode::EqualWeight, ResidualStrategy::CashBucket, dec!(0.40));
        let outcome = engine.size(&[candidate("A", 0.9), candidate("B", 0.8)], dec!(0.90));
        assert_eq!(outcome.positions[0].target_pct, dec!(0.40));
        assert_eq!(outcome.positions[1].target_pct, dec!(0.40));
        assert_eq!(outcome.cash_residual, dec!(0.10));
    }

    #[test]
    fn test_safe_top_slice_respects_per_asset_bound() {
        let config = SizingConfig {
            sizing_mode: SizingMode::EqualWeight,
            residual_strategy: ResidualStrategy::SafeTopSlice,
            max_residual_per_asset: dec!(0.05),
            max_residual_multiple: dec!(0.5),
            ..Default::default()
        };
        let engine = SizingEngine::new(config, dec!(0.50));
        let outcome = engine.size(&[candidate("A", 0.9), candidate("B", 0.8)], dec!(0.90));
        // Equal weight allocates 0.45 each; cap 0.50 leaves nothing. But with
        // three-way split the numbers change; here no residual exists.
        assert_eq!(outcome.cash_residual, Decimal::ZERO);

        // Force a residual with a tighter cap.
        let config = SizingConfig {
            sizing_mode: SizingMode::EqualWeight,
            residual_strategy: ResidualStrategy::SafeTopSlice,
            max_residual_per_asset: dec!(0.05),
            max_residual_multiple: dec!(0.5),
            ..Default::default()
        };
        let engine = SizingEngine::new(config, dec!(0.40));
        let outcome = engine.size(&[candidate("A", 0.9), candidate("B", 0.8)], dec!(0.90));
        // Both capped at 0.40; the 0.10 residual cannot be placed because the
        // cap is already reached, so it stays cash.
        assert_eq!(outcome.cash_residual, dec!(0.10));
    }

    #[test]
    fn test_safe_top_slice_tops_up_within_bounds() {
        let config = SizingConfig {
            sizing_mode: SizingMode::ScoreWeighted,
            residual_strategy: ResidualStrategy::SafeTopSlice,
            max_residual_per_asset: dec!(0.05),
            max_residual_multiple: dec!(0.5),
            enable_two_stage: false,
            ..Default::default()
        };
        let engine = SizingEngine::new(config, dec!(0.45));
        // Single-pass sizing over 0.80 with scores 3:1 gives A 0.60 -> cap
        // 0.45, B 0.20; residual 0.15. A has no cap headroom; B absorbs one
        // max_residual_per_asset slice.
        let outcome = engine.size(&[candidate("A", 0.9), candidate("B", 0.3)], dec!(0.80));
        assert_eq!(outcome.positions[0].target_pct, dec!(0.45));
        assert_eq!(outcome.positions[1].target_pct, dec!(0.25));
        assert_eq!(outcome.cash_residual, dec!(0.10));
    }

    #[test]
    fn test_proportional_residual_spreads() {
        let config = SizingConfig {
            sizing_mode: SizingMode::EqualWeight,
            residual_strategy: ResidualStrategy::Proportional,
            ..Default::default()
        };
        let engine = SizingEngine::new(config, dec!(0.50));
        let outcome = engine.size(&[candidate("A", 0.9), candidate("B", 0.8)], dec!(0.90));
        // No residual to spread: equal weight fills 0.45/0.45 under the cap.
        assert_eq!(outcome.cash_residual, Decimal::ZERO);
        let total: Decimal = outcome.positions.iter().map(|p| p.target_pct).sum();
        assert_eq!(total, dec!(0.90));
    }

    #[test]
    fn test_empty_candidates_all_cash() {
        let engine = engine(SizingMode::Adaptive, ResidualStrategy::CashBucket, dec!(0.40));
        let outcome = engine.size(&[], dec!(0.90));
        assert!(outcome.positions.is_empty());
        assert_eq!(outcome.cash_residual, dec!(0.90));
    }
}
