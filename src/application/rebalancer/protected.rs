//! Protection-aware rebalancing.
//!
//! Wraps the rebalancer engine: every non-hold target is submitted to the
//! protection orchestrator, denials are reconciled into safe alternatives,
//! and the total-allocation invariant is re-checked before the plan is
//! released to the caller.

use crate::application::protections::orchestrator::{
    ProtectionOrchestrator, ProtectionSystems, RegimeOverrideContext,
};
use crate::application::rebalancer::engine::{RebalanceInput, RebalancerEngine, TargetPlan};
use crate::domain::errors::EngineError;
use crate::domain::events::{Event, EventCategory};
use crate::domain::protection::{ProtectionDecision, ProtectionRequest};
use crate::domain::repositories::EventStore;
use crate::domain::types::{AnalyticsMap, RebalanceAction, RebalancingTarget, Timestamp};
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Tolerance on the total-allocation invariant.
const ALLOCATION_EPSILON: &str = "0.000000001";

/// A validated plan ready for application to the ledger.
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    pub targets: Vec<RebalancingTarget>,
    pub denied: Vec<(RebalancingTarget, ProtectionDecision)>,
    pub analytics: AnalyticsMap,
    /// Cash fraction reserved by sizing residuals and denial reconciliation.
    pub cash_reserved: Decimal,
    pub approved_count: usize,
    pub denied_count: usize,
    pub override_count: usize,
}

/// Cumulative validation statistics.
#[derive(Debug, Clone, Default)]
pub struct ValidationStats {
    pub targets_validated: u64,
    pub targets_approved: u64,
    pub targets_denied: u64,
}

impl ValidationStats {
    pub fn approval_rate(&self) -> f64 {
        if self.targets_validated == 0 {
            0.0
        } else {
            self.targets_approved as f64 / self.targets_validated as f64
        }
    }
}

pub struct ProtectionAwareRebalancer {
    engine: RebalancerEngine,
    events: Arc<dyn EventStore>,
    session_id: Uuid,
    target_total_allocation: Decimal,
    min_position_size: Decimal,
    stats: ValidationStats,
}

impl ProtectionAwareRebalancer {
    pub fn new(
        engine: RebalancerEngine,
        events: Arc<dyn EventStore>,
        session_id: Uuid,
        target_total_allocation: Decimal,
        min_position_size: Decimal,
    ) -> Self {
        Self {
            engine,
            events,
            session_id,
            target_total_allocation,
            min_position_size,
            stats: ValidationStats::default(),
        }
    }

    pub fn engine(&self) -> &RebalancerEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut RebalancerEngine {
        &mut self.engine
    }

    pub fn stats(&self) -> &ValidationStats {
        &self.stats
    }

    /// Generate targets, validate each through the protection hierarchy and
    /// reconcile denials.
    pub async fn rebalance(
        &mut self,
        input: &RebalanceInput<'_>,
        orchestrator: &mut ProtectionOrchestrator,
        systems: &mut ProtectionSystems<'_>,
        regime: &RegimeOverrideContext,
    ) -> Result<ValidatedPlan, EngineError> {
        let plan: TargetPlan = self.engine.rebalance(input);
        let at = input.at;

        let mut validated: Vec<RebalancingTarget> = Vec::new();
        let mut denied: Vec<(RebalancingTarget, ProtectionDecision)> = Vec::new();
        let mut freed_by_denials = Decimal::ZERO;
        let mut override_count = 0usize;

        for target in plan.targets {
            if !target.action.requires_validation() {
                validated.push(target);
                continue;
            }
            self.stats.targets_validated += 1;

            let request = request_for(&target, at, systems);
            let decision = orchestrator.decide(systems, regime, &request).await?;
            if decision.override_applied {
                override_count += 1;
            }

            if decision.approved {
                self.stats.targets_approved += 1;
                validated.push(target);
                continue;
            }
            self.stats.targets_denied += 1;

            match target.action {
                // A denied close keeps the position; its allocation stays
                // reserved.
                RebalanceAction::Close => {
                    debug!("Reconcile [{}]: denied close held at {}", target.asset, target.current_pct);
                    validated.push(hold_at_current(&target, "close denied, position retained"));
                }
                // A denied open disappears; its allocation returns to cash.
                RebalanceAction::Open => {
                    freed_by_denials += target.target_pct;
                }
                // A denied increase falls back to the current size.
                RebalanceAction::Increase => {
                    freed_by_denials += target.target_pct - target.current_pct;
                    validated.push(hold_at_current(&target, "increase denied, holding current size"));
                }
                // A denied decrease retries at a shallower cut only when the
                // denial was size-related.
                RebalanceAction::Decrease => {
                    let retried = if decision.is_size_related() {
                        self.retry_decrease(&target, at, orchestrator, systems, regime)
                            .await?
                    } else {
                        None
                    };
                    match retried {
                        Some(adjusted) => validated.push(adjusted),
                        None => validated.push(hold_at_current(
                            &target,
                            "decrease denied, holding current size",
                        )),
                    }
                }
                RebalanceAction::Hold => unreachable!("hold targets bypass validation"),
            }
            denied.push((target.clone(), decision));
        }

        // Re-check the total-allocation invariant; protected positions are
        // untouchable, so only fresh entries scale down.
        self.rescale_new_entries(&mut validated);

        let cash_reserved = plan.cash_residual + freed_by_denials;
        if cash_reserved > Decimal::ZERO {
            self.events
                .append(
                    Event::new(
                        EventCategory::Rebalance,
                        "residual_reserved",
                        at,
                        self.session_id,
                        "allocation held back as cash",
                    )
                    .with_payload(json!({
                        "sizing_residual": plan.cash_residual.to_string(),
                        "freed_by_denials": freed_by_denials.to_string(),
                        "total": cash_reserved.to_string(),
                    })),
                )
                .await?;
        }

        let approved_count = validated
            .iter()
            .filter(|t| t.action != RebalanceAction::Hold)
            .count();
        let denied_count = denied.len();

        self.events
            .append(
                Event::new(
                    EventCategory::Rebalance,
                    "rebalance_complete",
                    at,
                    self.session_id,
                    format!("{} approved, {} denied", approved_count, denied_count),
                )
                .with_payload(json!({
                    "approved": approved_count,
                    "denied": denied_count,
                    "overrides": override_count,
                    "buckets_represented": plan.buckets_represented,
                })),
            )
            .await?;

        info!(
            "ProtectionAwareRebalancer: {} approved, {} denied, {} overridden at {}",
            approved_count, denied_count, override_count, at
        );

        Ok(ValidatedPlan {
            targets: validated,
            denied,
            analytics: plan.analytics,
            cash_reserved,
            approved_count,
            denied_count,
            override_count,
        })
    }

    /// Resubmit a denied decrease at the smallest size its blockers accept.
    async fn retry_decrease(
        &mut self,
        target: &RebalancingTarget,
        at: Timestamp,
        orchestrator: &mut ProtectionOrchestrator,
        systems: &mut ProtectionSystems<'_>,
        regime: &RegimeOverrideContext,
    ) -> Result<Option<RebalancingTarget>, EngineError> {
        let floor = match systems.grace.floor_size(&target.asset) {
            Some(floor) if floor < target.current_pct => floor,
            _ => return Ok(None),
        };
        let mut adjusted = target.clone();
        adjusted.target_pct = floor;
        adjusted.reason = format!("{} (retried at decay floor)", target.reason);

        self.stats.targets_validated += 1;
        let request = request_for(&adjusted, at, systems);
        let decision = orchestrator.decide(systems, regime, &request).await?;
        if decision.approved {
            self.stats.targets_approved += 1;
            debug!(
                "Reconcile [{}]: decrease retried at floor {}",
                adjusted.asset, floor
            );
            Ok(Some(adjusted))
        } else {
            self.stats.targets_denied += 1;
            Ok(None)
        }
    }

    /// Scale fresh entries down proportionally when the reconciled plan
    /// exceeds the allocation target.
    fn rescale_new_entries(&self, targets: &mut Vec<RebalancingTarget>) {
        let epsilon: Decimal = ALLOCATION_EPSILON.parse().unwrap_or(Decimal::ZERO);
        let projected: Decimal = targets.iter().map(|t| t.target_pct).sum();
        let excess = projected - self.target_total_allocation;
        if excess <= epsilon {
            return;
        }
        let open_total: Decimal = targets
            .iter()
            .filter(|t| t.action == RebalanceAction::Open)
            .map(|t| t.target_pct)
            .sum();
        if open_total <= Decimal::ZERO {
            return;
        }
        let factor = ((open_total - excess) / open_total).max(Decimal::ZERO);
        info!(
            "ProtectionAwareRebalancer: scaling {} of new entries to restore allocation cap",
            factor.round_dp(4)
        );
        for target in targets.iter_mut() {
            if target.action == RebalanceAction::Open {
                target.target_pct = (target.target_pct * factor).round_dp(6);
            }
        }
        targets.retain(|t| {
            t.action != RebalanceAction::Open || t.target_pct >= self.min_position_size
        });
    }
}

fn request_for(
    target: &RebalancingTarget,
    at: Timestamp,
    systems: &ProtectionSystems<'_>,
) -> ProtectionRequest {
    let mut request = ProtectionRequest::new(target.asset.clone(), target.action, at);
    request.current_size = target.current_pct;
    request.target_size = target.target_pct;
    request.score = Some(target.score);
    request.position_opened_at = systems
        .ledger
        .position(&target.asset)
        .map(|p| p.opened_at);
    request.reason = target.reason.clone();
    request
}

fn hold_at_current(target: &RebalancingTarget, reason: &str) -> RebalancingTarget {
    RebalancingTarget {
        asset: target.asset.clone(),
        action: RebalanceAction::Hold,
        target_pct: target.current_pct,
        current_pct: target.current_pct,
        score: target.score,
        priority: target.priority,
        reason: reason.to_string(),
    }
}
