//! Rebalancer engine.
//!
//! Turns a scoring snapshot plus ledger and regime context into an ordered,
//! unvalidated target list: eligibility filter, priority labeling, position
//! budget, sizing, bucket diversification, residual placement and action
//! derivation. Protection validation happens downstream.

use crate::application::rebalancer::buckets::{BucketEnforcer, BucketRegistry};
use crate::application::rebalancer::sizing::{SizingCandidate, SizingEngine};
use crate::application::regime_context::ContextView;
use crate::config::{EngineConfig, SizingMode};
use crate::domain::ledger::PositionLedger;
use crate::domain::types::{
    AnalyticsMap, AssetAnalytics, AssetPriority, RebalanceAction, RebalancingTarget, Score,
    Timestamp,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Score at or above which an asset is labeled trending.
const TRENDING_SCORE: f64 = 0.75;

/// Inputs for one rebalance pass.
pub struct RebalanceInput<'a> {
    pub at: Timestamp,
    pub scores: &'a [Score],
    pub ledger: &'a PositionLedger,
    pub regime_view: &'a ContextView,
    /// Grace periods that expired; closed at this rebalance.
    pub grace_closures: Vec<String>,
    /// Positions past the maximum holding period.
    pub forced_closures: Vec<String>,
    pub core_assets: &'a [String],
}

/// Unvalidated output of the engine.
#[derive(Debug, Clone)]
pub struct TargetPlan {
    pub targets: Vec<RebalancingTarget>,
    pub analytics: AnalyticsMap,
    /// Fraction deliberately left as cash by sizing and diversification.
    pub cash_residual: Decimal,
    pub buckets_represented: usize,
}

pub struct RebalancerEngine {
    config: EngineConfig,
    registry: BucketRegistry,
    last_scores: BTreeMap<String, f64>,
}

impl RebalancerEngine {
    pub fn new(config: EngineConfig, registry: BucketRegistry) -> Self {
        Self {
            config,
            registry,
            last_scores: BTreeMap::new(),
        }
    }

    pub fn registry(&self) -> &BucketRegistry {
        &self.registry
    }

    pub fn rebalance(&mut self, input: &RebalanceInput<'_>) -> TargetPlan {
        // Deduplicate the snapshot; the last score per asset wins.
        let mut scores: BTreeMap<String, f64> = BTreeMap::new();
        for score in input.scores {
            scores.insert(score.asset.clone(), score.combined_score);
        }

        let closing: BTreeSet<String> = input
            .grace_closures
            .iter()
            .chain(input.forced_closures.iter())
            .cloned()
            .collect();

        // 1-2. Eligibility and priority labeling.
        let mut candidates: Vec<(SizingCandidate, bool)> = Vec::new();
        for (asset, &score) in &scores {
            if closing.contains(asset) {
                continue;
            }
            let held = input.ledger.position(asset).is_some();
            let eligible = if held {
                score >= self.config.portfolio.min_score_threshold
            } else {
                score >= self.config.portfolio.min_score_new_position
            };
            if !eligible {
                continue;
            }
            let priority = self.label_priority(asset, score, input);
            candidates.push((
                SizingCandidate {
                    asset: asset.clone(),
                    score,
                    priority,
                },
                !held,
            ));
        }

        // Deterministic ordering: priority rank, then score descending, then
        // asset id.
        candidates.sort_by(|(a, _), (b, _)| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.asset.cmp(&b.asset))
        });

        // 3. Position budget. The sort order already ranks what to drop:
        // lowest priority first, lowest score within a priority.
        let mut kept: Vec<SizingCandidate> = Vec::new();
        let mut new_entries = 0usize;
        for (candidate, is_new) in candidates {
            let at_capacity = kept.len() >= self.config.portfolio.max_total_positions;
            let new_exhausted =
                is_new && new_entries >= self.config.portfolio.max_new_positions_per_rebalance;
            if at_capacity || new_exhausted {
                debug!(
                    "Rebalancer [{}]: dropped by position budget (score {:.3})",
                    candidate.asset, candidate.score
                );
                continue;
            }
            if is_new {
                new_entries += 1;
            }
            kept.push(candidate);
        }

        // 4 + 6. Sizing with residual placement, scaled by regime risk.
        let risk_scaling =
            Decimal::from_f64_retain(input.regime_view.risk_scaling).unwrap_or(Decimal::ONE);
        let effective_total =
            (self.config.portfolio.target_total_allocation * risk_scaling).round_dp(6);
        let sizing = SizingEngine::new(self.effective_sizing_config(), self.config.portfolio.max_single_position_pct);
        let sized = sizing.size(&kept, effective_total);
        let mut cash_residual = sized.cash_residual;

        // 5. Bucket diversification.
        let enforcer = BucketEnforcer::new(&self.config.bucket, &self.registry);
        let diversified = enforcer.enforce(sized.positions);
        for (asset, freed) in &diversified.dropped {
            debug!("Rebalancer [{}]: dropped by bucket limits, freeing {}", asset, freed);
            cash_residual += *freed;
        }

        // 7. Action derivation.
        let kept_assets: BTreeSet<String> =
            diversified.kept.iter().map(|p| p.asset.clone()).collect();
        let mut targets: Vec<RebalancingTarget> = Vec::new();
        let mut analytics: AnalyticsMap = AnalyticsMap::new();

        // Closes: expired grace, max holding, score exits, budget/bucket
        // evictions of held assets.
        for (asset, position) in input.ledger.live_positions() {
            if kept_assets.contains(asset) {
                continue;
            }
            let score = scores.get(asset).copied().unwrap_or(0.0);
            let reason = if input.grace_closures.contains(asset) {
                "grace period expired".to_string()
            } else if input.forced_closures.contains(asset) {
                "maximum holding period reached".to_string()
            } else if score < self.config.portfolio.min_score_threshold {
                format!(
                    "score {:.3} below threshold {:.3}",
                    score, self.config.portfolio.min_score_threshold
                )
            } else {
                "displaced by portfolio budget".to_string()
            };
            self.push_target(
                &mut targets,
                &mut analytics,
                RebalancingTarget {
                    asset: asset.clone(),
                    action: RebalanceAction::Close,
                    target_pct: Decimal::ZERO,
                    current_pct: position.size_pct,
                    score,
                    priority: AssetPriority::Portfolio,
                    reason,
                },
            );
        }

        for position in &diversified.kept {
            let current = input.ledger.current_size(&position.asset);
            let delta = position.target_pct - current;
            let (action, target_pct, reason) = if current == Decimal::ZERO {
                if position.target_pct < self.config.sizing.min_position_size {
                    continue;
                }
                (
                    RebalanceAction::Open,
                    position.target_pct,
                    format!("new entry at score {:.3}", position.score),
                )
            } else if delta.abs() < self.config.sizing.min_position_size {
                (
                    RebalanceAction::Hold,
                    current,
                    "within rebalance threshold".to_string(),
                )
            } else if delta > Decimal::ZERO {
                (
                    RebalanceAction::Increase,
                    position.target_pct,
                    format!("allocation raised by {}", delta.round_dp(6)),
                )
            } else {
                (
                    RebalanceAction::Decrease,
                    position.target_pct,
                    format!("allocation trimmed by {}", delta.abs().round_dp(6)),
                )
            };
            self.push_target(
                &mut targets,
                &mut analytics,
                RebalancingTarget {
                    asset: position.asset.clone(),
                    action,
                    target_pct,
                    current_pct: current,
                    score: position.score,
                    priority: position.priority,
                    reason,
                },
            );
        }

        // Closes first so freed allocation is visible to downstream
        // reconciliation, then priority order.
        targets.sort_by(|a, b| {
            let a_close = a.action != RebalanceAction::Close;
            let b_close = b.action != RebalanceAction::Close;
            a_close
                .cmp(&b_close)
                .then_with(|| a.priority.rank().cmp(&b.priority.rank()))
                .then_with(|| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.asset.cmp(&b.asset))
        });

        for score in input.scores {
            self.last_scores
                .insert(score.asset.clone(), score.combined_score);
        }

        info!(
            "Rebalancer: {} targets at {} ({} cash residual, {} buckets)",
            targets.len(),
            input.at,
            cash_residual,
            diversified.buckets_represented
        );

        TargetPlan {
            targets,
            analytics,
            cash_residual,
            buckets_represented: diversified.buckets_represented,
        }
    }

    fn label_priority(&self, asset: &str, score: f64, input: &RebalanceInput<'_>) -> AssetPriority {
        if input.core_assets.iter().any(|a| a == asset) {
            AssetPriority::Core
        } else if self
            .registry
            .is_in_any(asset, &input.regime_view.preferred_buckets)
        {
            AssetPriority::Regime
        } else if score >= TRENDING_SCORE {
            AssetPriority::Trending
        } else {
            AssetPriority::Portfolio
        }
    }

    fn effective_sizing_config(&self) -> crate::config::SizingConfig {
        let mut sizing = self.config.sizing.clone();
        if !sizing.enable_dynamic {
            sizing.sizing_mode = SizingMode::EqualWeight;
            sizing.enable_two_stage = false;
        }
        sizing
    }

    fn push_target(
        &self,
        targets: &mut Vec<RebalancingTarget>,
        analytics: &mut AnalyticsMap,
        target: RebalancingTarget,
    ) {
        analytics.insert(
            target.asset.clone(),
            AssetAnalytics {
                bucket: self
                    .registry
                    .primary_bucket(&target.asset)
                    .map(|s| s.to_string()),
                reason: target.reason.clone(),
                score_before: self.last_scores.get(&target.asset).copied(),
                score_after: target.score,
            },
        );
        targets.push(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ledger::NewPositionEvent;
    use crate::domain::regime::{Regime, RegimeState, TimeframeScores};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 30, 0).unwrap()
    }

    fn view(risk_scaling: f64) -> ContextView {
        ContextView {
            state: RegimeState {
                regime: Regime::Goldilocks,
                confidence: 0.8,
                stability: 1.0,
                strength: 0.5,
                detected_at: t0(),
                duration_hours: 24,
                per_timeframe_scores: TimeframeScores::uniform(0.8),
            },
            risk_scaling,
            preferred_buckets: vec![],
        }
    }

    fn scores(pairs: &[(&str, f64)]) -> Vec<Score> {
        pairs
            .iter()
            .map(|(asset, s)| Score::new(*asset, *s, t0()))
            .collect()
    }

    fn scenario_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.portfolio.max_total_positions = 3;
        config.portfolio.max_single_position_pct = dec!(0.40);
        config.portfolio.target_total_allocation = dec!(0.90);
        config.sizing.sizing_mode = SizingMode::EqualWeight;
        config
    }

    fn engine(config: EngineConfig) -> RebalancerEngine {
        RebalancerEngine::new(config, BucketRegistry::new())
    }

    #[test]
    fn test_cold_start_opens_top_scorers() {
        let mut engine = engine(scenario_config());
        let ledger = PositionLedger::new(dec!(0.90));
        let scores = scores(&[("A", 0.90), ("B", 0.80), ("C", 0.70), ("D", 0.50)]);
        let view = view(1.0);
        let plan = engine.rebalance(&RebalanceInput {
            at: t0(),
            scores: &scores,
            ledger: &ledger,
            regime_view: &view,
            grace_closures: vec![],
            forced_closures: vec![],
            core_assets: &[],
        });

        assert_eq!(plan.targets.len(), 3);
        for target in &plan.targets {
            assert_eq!(target.action, RebalanceAction::Open);
            assert_eq!(target.target_pct, dec!(0.30));
        }
        let total: Decimal = plan.targets.iter().map(|t| t.target_pct).sum();
        assert_eq!(total, dec!(0.90));
        // D filtered by the new-position threshold.
        assert!(!plan.targets.iter().any(|t| t.asset == "D"));
    }

    #[test]
    fn test_max_new_positions_enforced() {
        let mut config = scenario_config();
        config.portfolio.max_total_positions = 10;
        config.portfolio.max_new_positions_per_rebalance = 2;
        config.portfolio.max_single_position_pct = dec!(0.2);
        config.portfolio.target_total_allocation = dec!(0.95);
        let mut engine = engine(config);
        let ledger = PositionLedger::new(dec!(0.95));
        let scores = scores(&[("A", 0.90), ("B", 0.80), ("C", 0.70)]);
        let view = view(1.0);
        let plan = engine.rebalance(&RebalanceInput {
            at: t0(),
            scores: &scores,
            ledger: &ledger,
            regime_view: &view,
            grace_closures: vec![],
            forced_closures: vec![],
            core_assets: &[],
        });
        // Only the two best scores enter.
        let opens: Vec<&str> = plan.targets.iter().map(|t| t.asset.as_str()).collect();
        assert_eq!(opens, vec!["A", "B"]);
    }

    #[test]
    fn test_below_threshold_position_closed() {
        let mut engine = engine(scenario_config());
        let mut ledger = PositionLedger::new(dec!(0.90));
        ledger
            .record_event(NewPositionEvent::open("A", t0(), dec!(0.30)))
            .unwrap();
        let scores = scores(&[("A", 0.40)]);
        let view = view(1.0);
        let plan = engine.rebalance(&RebalanceInput {
            at: t0() + chrono::Duration::days(7),
            scores: &scores,
            ledger: &ledger,
            regime_view: &view,
            grace_closures: vec![],
            forced_closures: vec![],
            core_assets: &[],
        });
        assert_eq!(plan.targets.len(), 1);
        let target = &plan.targets[0];
        assert_eq!(target.action, RebalanceAction::Close);
        assert_eq!(target.current_pct, dec!(0.30));
        assert!(target.reason.contains("below threshold"));
    }

    #[test]
    fn test_hold_emitted_for_small_delta() {
        let mut config = scenario_config();
        config.sizing.min_position_size = dec!(0.05);
        let mut engine = engine(config);
        let mut ledger = PositionLedger::new(dec!(0.90));
        // Three positions at the equal-weight size already.
        for (i, asset) in ["A", "B", "C"].iter().enumerate() {
            ledger
                .record_event(NewPositionEvent::open(
                    *asset,
                    t0() + chrono::Duration::seconds(i as i64),
                    dec!(0.30),
                ))
                .unwrap();
        }
        let scores = scores(&[("A", 0.90), ("B", 0.80), ("C", 0.70)]);
        let view = view(1.0);
        let plan = engine.rebalance(&RebalanceInput {
            at: t0() + chrono::Duration::days(7),
            scores: &scores,
            ledger: &ledger,
            regime_view: &view,
            grace_closures: vec![],
            forced_closures: vec![],
            core_assets: &[],
        });
        assert!(plan.targets.iter().all(|t| t.action == RebalanceAction::Hold));
    }

    #[test]
    fn test_grace_closure_becomes_close_target() {
        let mut engine = engine(scenario_config());
        let mut ledger = PositionLedger::new(dec!(0.90));
        ledger
            .record_event(NewPositionEvent::open("B", t0(), dec!(0.30)))
            .unwrap();
        let scores = scores(&[("B", 0.70)]);
        let view = view(1.0);
        let plan = engine.rebalance(&RebalanceInput {
            at: t0() + chrono::Duration::days(6),
            scores: &scores,
            ledger: &ledger,
            regime_view: &view,
            grace_closures: vec!["B".to_string()],
            forced_closures: vec![],
            core_assets: &[],
        });
        let close = plan
            .targets
            .iter()
            .find(|t| t.asset == "B" && t.action == RebalanceAction::Close)
            .expect("close target for expired grace");
        assert!(close.reason.contains("grace period expired"));
    }

    #[test]
    fn test_core_priority_sorts_first() {
        let mut config = scenario_config();
        config.portfolio.max_total_positions = 2;
        let mut engine = engine(config);
        let ledger = PositionLedger::new(dec!(0.90));
        let scores = scores(&[("AAA", 0.95), ("ZZZ", 0.66)]);
        let view = view(1.0);
        let core = vec!["ZZZ".to_string()];
        let plan = engine.rebalance(&RebalanceInput {
            at: t0(),
            scores: &scores,
            ledger: &ledger,
            regime_view: &view,
            grace_closures: vec![],
            forced_closures: vec![],
            core_assets: &core,
        });
        // Core priority leads despite the lower score.
        assert_eq!(plan.targets[0].asset, "ZZZ");
        assert_eq!(plan.targets[0].priority, AssetPriority::Core);
    }

    #[test]
    fn test_risk_scaling_shrinks_total() {
        let mut engine = engine(scenario_config());
        let ledger = PositionLedger::new(dec!(0.90));
        let scores = scores(&[("A", 0.90), ("B", 0.80), ("C", 0.70)]);
        let view = view(0.5);
        let plan = engine.rebalance(&RebalanceInput {
            at: t0(),
            scores: &scores,
            ledger: &ledger,
            regime_view: &view,
            grace_closures: vec![],
            forced_closures: vec![],
            core_assets: &[],
        });
        let total: Decimal = plan.targets.iter().map(|t| t.target_pct).sum();
        assert_eq!(total, dec!(0.45));
    }

    #[test]
    fn test_analytics_tracks_score_history() {
        let mut engine = engine(scenario_config());
        let ledger = PositionLedger::new(dec!(0.90));
        let first = scores(&[("A", 0.90)]);
        let view = view(1.0);
        engine.rebalance(&RebalanceInput {
            at: t0(),
            scores: &first,
            ledger: &ledger,
            regime_view: &view,
            grace_closures: vec![],
            forced_closures: vec![],
            core_assets: &[],
        });
        let second = scores(&[("A", 0.70)]);
        let plan = engine.rebalance(&RebalanceInput {
            at: t0() + chrono::Duration::days(7),
            scores: &second,
            ledger: &ledger,
            regime_view: &view,
            grace_closures: vec![],
            forced_closures: vec![],
            core_assets: &[],
        });
        let analytics = plan.analytics.get("A").unwrap();
        assert_eq!(analytics.score_before, Some(0.90));
        assert_eq!(analytics.score_after, 0.70);
    }

    #[test]
    fn test_determinism_ties_break_lexicographically() {
        let mut engine = engine(scenario_config());
        let ledger = PositionLedger::new(dec!(0.90));
        let scores = scores(&[("BBB", 0.80), ("AAA", 0.80), ("CCC", 0.80), ("DDD", 0.80)]);
        let view = view(1.0);
        let plan = engine.rebalance(&RebalanceInput {
            at: t0(),
            scores: &scores,
            ledger: &ledger,
            regime_view: &view,
            grace_closures: vec![],
            forced_closures: vec![],
            core_assets: &[],
        });
        let kept: Vec<&str> = plan.targets.iter().map(|t| t.asset.as_str()).collect();
        assert_eq!(kept, vec!["AAA", "BBB", "CCC"]);
    }
}
