//! Rebalance session.
//!
//! One session owns one backtest's ledger, lifecycle trackers, regime
//! context and event-log connection, and runs its rebalances strictly
//! sequentially. A rebalance is atomic from the caller's viewpoint: it
//! either commits every ledger change and event, or commits nothing but a
//! single error event.

use crate::application::protections::core_assets::{CoreAssetRegistry, CoreUpdate};
use crate::application::protections::grace::{GracePeriodManager, GraceUpdate};
use crate::application::protections::holding::HoldingPeriodManager;
use crate::application::protections::orchestrator::{
    OrchestratorMetrics, ProtectionOrchestrator, ProtectionSystems, RegimeOverrideContext,
};
use crate::application::protections::whipsaw::WhipsawTracker;
use crate::application::rebalancer::buckets::BucketRegistry;
use crate::application::protections::core_assets::CoreDesignation;
use crate::application::protections::grace::GraceState;
use crate::application::rebalancer::engine::{RebalanceInput, RebalancerEngine};
use crate::application::rebalancer::protected::{ProtectionAwareRebalancer, ValidatedPlan};
use crate::application::regime_context::RegimeContextProvider;
use crate::config::EngineConfig;
use crate::domain::errors::EngineError;
use crate::domain::events::{Event, EventCategory};
use crate::domain::ledger::{NewPositionEvent, PositionLedger};
use crate::domain::ports::{Clock, PriceProvider, RegimeDetector, Scorer};
use crate::domain::position::{Position, PositionEvent};
use crate::domain::protection::ProtectionDecision;
use crate::domain::regime::{RegimeState, RegimeTransition};
use crate::domain::repositories::EventStore;
use crate::domain::types::{AnalyticsMap, RebalanceAction, RebalancingTarget, Timestamp};
use chrono::Duration;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

/// Result of one committed rebalance.
#[derive(Debug, Clone)]
pub struct RebalanceOutcome {
    pub at: Timestamp,
    pub targets: Vec<RebalancingTarget>,
    pub denied: Vec<(RebalancingTarget, ProtectionDecision)>,
    pub analytics: AnalyticsMap,
    pub regime: RegimeState,
    pub cash_reserved: Decimal,
    pub approved_count: usize,
    pub denied_count: usize,
    pub override_count: usize,
}

/// Serializable state the harness may persist between runs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionCheckpoint {
    pub positions: Vec<Position>,
    pub position_events: Vec<PositionEvent>,
    pub grace_states: Vec<GraceState>,
    pub core_designations: Vec<CoreDesignation>,
    pub regime_transitions: Vec<RegimeTransition>,
    pub event_log_cursor: usize,
}

pub struct RebalanceSession {
    config: EngineConfig,
    session_id: Uuid,
    universe: Vec<String>,
    scorer: Arc<dyn Scorer>,
    prices: Option<Arc<dyn PriceProvider>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventStore>,
    regime: RegimeContextProvider,
    ledger: PositionLedger,
    grace: GracePeriodManager,
    holding: HoldingPeriodManager,
    whipsaw: WhipsawTracker,
    core: CoreAssetRegistry,
    orchestrator: ProtectionOrchestrator,
    rebalancer: ProtectionAwareRebalancer,
}

impl RebalanceSession {
    /// Build a session from validated configuration. An invalid config is
    /// fatal at construction.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        universe: Vec<String>,
        session_id: Uuid,
        scorer: Arc<dyn Scorer>,
        regime_detector: Arc<dyn RegimeDetector>,
        prices: Option<Arc<dyn PriceProvider>>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventStore>,
        buckets: BucketRegistry,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let lifecycle = &config.lifecycle;
        let regime = RegimeContextProvider::new(regime_detector, config.regime.clone());
        let ledger = PositionLedger::new(config.portfolio.target_total_allocation);
        let grace = GracePeriodManager::new(
            lifecycle.grace_period_days,
            lifecycle.decay_rate,
            lifecycle.min_decay_factor,
            config.portfolio.min_score_threshold,
        );
        let holding = HoldingPeriodManager::new(
            lifecycle.min_holding_days,
            lifecycle.max_holding_days,
            lifecycle.regime_override_cooldown_days,
            lifecycle.regime_severity_threshold,
        );
        let whipsaw = WhipsawTracker::new(
            lifecycle.max_cycles_per_period,
            lifecycle.whipsaw_protection_days,
            lifecycle.min_position_duration_hours,
        );
        let core = CoreAssetRegistry::new(
            config.core_asset.max_core_assets,
            config.core_asset.override_score_threshold,
            config.core_asset.expiry_days,
            config.core_asset.underperformance_threshold,
            config.core_asset.underperformance_window_days,
            config.core_asset.extension_limit,
            config.core_asset.performance_check_frequency_days,
            config.core_asset.reference_asset.clone(),
        );
        let orchestrator = ProtectionOrchestrator::new(
            events.clone(),
            session_id,
            lifecycle.enable_grace,
            lifecycle.enable_whipsaw,
            lifecycle.enable_regime_overrides,
            lifecycle.regime_severity_threshold,
            lifecycle.override_cooldown_hours,
        );
        let engine = RebalancerEngine::new(config.clone(), buckets);
        let rebalancer = ProtectionAwareRebalancer::new(
            engine,
            events.clone(),
            session_id,
            config.portfolio.target_total_allocation,
            config.sizing.min_position_size,
        );

        info!(
            "RebalanceSession {}: {} assets, grace={}, whipsaw={}, core={}",
            session_id,
            universe.len(),
            lifecycle.enable_grace,
            lifecycle.enable_whipsaw,
            config.core_asset.enable,
        );

        Ok(Self {
            config,
            session_id,
            universe,
            scorer,
            prices,
            clock,
            events,
            regime,
            ledger,
            grace,
            holding,
            whipsaw,
            core,
            orchestrator,
            rebalancer,
        })
    }

    /// Rebalance at the injected clock's current time.
    pub async fn rebalance(&mut self) -> Result<RebalanceOutcome, EngineError> {
        let at = self.clock.now();
        self.rebalance_at(at).await
    }

    /// Run one full rebalance at `at`. On a fatal error the ledger is left
    /// untouched and exactly one error event is committed.
    pub async fn rebalance_at(&mut self, at: Timestamp) -> Result<RebalanceOutcome, EngineError> {
        let started = Instant::now();
        match self.run_pipeline(at, started).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_fatal() => {
                error!("RebalanceSession {}: rebalance failed: {}", self.session_id, err);
                // Best effort; if the log itself is down this is a no-op.
                let _ = self
                    .events
                    .append(Event::new(
                        EventCategory::Error,
                        "error",
                        at,
                        self.session_id,
                        err.to_string(),
                    ))
                    .await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn run_pipeline(
        &mut self,
        at: Timestamp,
        started: Instant,
    ) -> Result<RebalanceOutcome, EngineError> {
        self.events
            .append(Event::new(
                EventCategory::Rebalance,
                "rebalance_start",
                at,
                self.session_id,
                format!("universe of {}", self.universe.len()),
            ))
            .await?;

        // Regime first; without it nothing else is meaningful.
        let regime_state = self.regime.refresh(at).await?;
        if let Some(transition) = self.regime.recent_transition().cloned() {
            self.events
                .append(
                    Event::new(
                        EventCategory::Regime,
                        "regime_transition",
                        at,
                        self.session_id,
                        transition.describe(),
                    )
                    .with_payload(json!({
                        "from": transition.from.to_string(),
                        "to": transition.to.to_string(),
                        "severity": transition.severity.to_string(),
                        "confidence": transition.confidence,
                    })),
                )
                .await?;
        }

        let scores = self
            .scorer
            .score_universe(&self.universe, at)
            .await
            .map_err(|e| EngineError::ScorerUnavailable(e.to_string()))?;

        // Core-asset lifecycle: promotions, expiry, performance review.
        if self.config.core_asset.enable {
            let mut updates = Vec::new();
            for score in &scores {
                if let Some(update) = self.core.on_score(&score.asset, score.combined_score, at) {
                    updates.push(update);
                }
            }
            updates.extend(self.core.expire(at));
            if let Some(prices) = self.prices.clone() {
                updates.extend(self.core.evaluate_performance(at, &prices).await);
            }
            for update in updates {
                self.log_core_update(at, update).await?;
            }
            for asset in self.core.core_assets() {
                self.ledger.mark_core(&asset, true);
            }
        }

        // Grace lifecycle for held assets; the snapshot's final score wins.
        if self.config.lifecycle.enable_grace {
            for score in &scores {
                let size = self.ledger.current_size(&score.asset);
                if size <= Decimal::ZERO {
                    continue;
                }
                if let Some(update) =
                    self.grace.on_score(&score.asset, score.combined_score, at, size)
                {
                    self.log_grace_update(at, update).await?;
                }
            }
        }
        let decays = if self.config.lifecycle.enable_grace {
            self.grace.tick(at)
        } else {
            Vec::new()
        };
        let grace_closures: Vec<String> = self
            .grace
            .due_closures(at)
            .into_iter()
            .filter(|s| self.ledger.position(&s.asset).is_some())
            .map(|s| s.asset)
            .collect();

        let forced_closures: Vec<String> = self
            .ledger
            .live_positions()
            .values()
            .filter(|p| self.holding.force_close_due(p.opened_at, at))
            .map(|p| p.asset.clone())
            .collect();

        let regime_view = self
            .regime
            .context_view(None, at)
            .unwrap_or_else(|| unreachable!("state set by refresh"));
        let override_context = RegimeOverrideContext {
            transition: self.regime.recent_transition().cloned(),
            confidence: regime_state.confidence,
        };
        let core_assets = self.core.core_assets();

        let plan = {
            let input = RebalanceInput {
                at,
                scores: &scores,
                ledger: &self.ledger,
                regime_view: &regime_view,
                grace_closures,
                forced_closures,
                core_assets: &core_assets,
            };
            let mut systems = ProtectionSystems {
                ledger: &self.ledger,
                core: &self.core,
                grace: &self.grace,
                holding: &mut self.holding,
                whipsaw: &mut self.whipsaw,
            };
            self.rebalancer
                .rebalance(&input, &mut self.orchestrator, &mut systems, &override_context)
                .await?
        };

        // No partial application: nothing has touched the ledger yet, and a
        // blown budget stops the whole batch here.
        let budget_ms = self.config.rebalance_timeout_secs * 1000;
        let elapsed_ms = started.elapsed().as_millis() as i64;
        if elapsed_ms > budget_ms {
            return Err(EngineError::Timeout {
                elapsed_ms,
                budget_ms,
            });
        }

        self.commit(at, &plan, decays).await?;

        Ok(RebalanceOutcome {
            at,
            targets: plan.targets,
            denied: plan.denied,
            analytics: plan.analytics,
            regime: regime_state,
            cash_reserved: plan.cash_reserved,
            approved_count: plan.approved_count,
            denied_count: plan.denied_count,
            override_count: plan.override_count,
        })
    }

    /// Apply grace decay and approved targets to the ledger, mirroring each
    /// position event into the log as one atomic batch.
    async fn commit(
        &mut self,
        at: Timestamp,
        plan: &ValidatedPlan,
        decays: Vec<crate::application::protections::grace::GraceDecay>,
    ) -> Result<(), EngineError> {
        let mut log_batch: Vec<Event> = Vec::new();

        // Decay adjustments, unless a stronger action supersedes them.
        for decay in decays {
            let superseded = plan.targets.iter().any(|t| {
                t.asset == decay.asset && t.action != RebalanceAction::Hold
            });
            if superseded || self.ledger.position(&decay.asset).is_none() {
                continue;
            }
            let event = self
                .ledger
                .record_event(NewPositionEvent::adjust(
                    decay.asset.clone(),
                    at,
                    decay.new_size,
                ))?;
            self.whipsaw.on_event(&event);
            log_batch.push(self.position_event_record(&event, "grace decay applied"));
        }

        for target in &plan.targets {
            let draft = match target.action {
                RebalanceAction::Open => {
                    NewPositionEvent::open(target.asset.clone(), at, target.target_pct)
                }
                RebalanceAction::Close => NewPositionEvent::close(target.asset.clone(), at),
                RebalanceAction::Increase | RebalanceAction::Decrease => {
                    NewPositionEvent::adjust(target.asset.clone(), at, target.target_pct)
                }
                RebalanceAction::Hold => continue,
            };
            let event = self.ledger.record_event(draft)?;
            self.whipsaw.on_event(&event);

            match target.action {
                RebalanceAction::Open => {
                    let tags: Vec<String> = self
                        .rebalancer
                        .engine()
                        .registry()
                        .buckets_of(&target.asset)
                        .to_vec();
                    if !tags.is_empty() {
                        self.ledger.tag_position(&target.asset, tags);
                    }
                    if self.core.is_core(&target.asset) {
                        self.ledger.mark_core(&target.asset, true);
                    }
                }
                RebalanceAction::Close => {
                    if self.grace.clear(&target.asset).is_some() {
                        log_batch.push(
                            Event::new(
                                EventCategory::Protection,
                                "grace_closed",
                                at,
                                self.session_id,
                                "position closed while in grace",
                            )
                            .with_asset(target.asset.clone()),
                        );
                    }
                }
                _ => {}
            }
            log_batch.push(self.position_event_record(&event, &target.reason));
        }

        self.events.append_batch(log_batch).await?;
        self.ledger
            .prune(at - Duration::days(self.config.lifecycle.whipsaw_protection_days * 2));
        Ok(())
    }

    fn position_event_record(&self, event: &PositionEvent, reason: &str) -> Event {
        Event::new(
            EventCategory::Portfolio,
            "position_event",
            event.at,
            self.session_id,
            reason.to_string(),
        )
        .with_asset(event.asset.clone())
        .with_action(event.kind.to_string())
        .with_payload(json!({
            "kind": event.kind.to_string(),
            "size_after": event.size_after.to_string(),
            "event_id": event.event_id,
        }))
    }

    async fn log_grace_update(&self, at: Timestamp, update: GraceUpdate) -> Result<(), EngineError> {
        let event = match update {
            GraceUpdate::Started(state) => Event::new(
                EventCategory::Protection,
                "grace_started",
                at,
                self.session_id,
                state.reason.clone(),
            )
            .with_asset(state.asset.clone())
            .with_payload(json!({
                "ends_at": state.ends_at.to_rfc3339(),
                "original_size": state.original_size.to_string(),
            })),
            GraceUpdate::Cleared(state) => Event::new(
                EventCategory::Protection,
                "grace_cleared",
                at,
                self.session_id,
                "score recovered above threshold",
            )
            .with_asset(state.asset.clone()),
        };
        self.events.append(event).await?;
        Ok(())
    }

    async fn log_core_update(&self, at: Timestamp, update: CoreUpdate) -> Result<(), EngineError> {
        let event = match update {
            CoreUpdate::Promoted(designation) => Event::new(
                EventCategory::Protection,
                "core_asset_promoted",
                at,
                self.session_id,
                format!("score {:.3} crossed promotion threshold", designation.performance_baseline),
            )
            .with_asset(designation.asset.clone())
            .with_payload(json!({ "expires_at": designation.expires_at.to_rfc3339() })),
            CoreUpdate::Expired { asset } => Event::new(
                EventCategory::Protection,
                "core_asset_expired",
                at,
                self.session_id,
                "designation reached scheduled expiry",
            )
            .with_asset(asset),
            CoreUpdate::HealthDecremented {
                asset,
                health_remaining,
                shortfall,
            } => Event::new(
                EventCategory::Protection,
                "core_asset_underperformed",
                at,
                self.session_id,
                format!("shortfall {:.3} vs reference", shortfall),
            )
            .with_asset(asset)
            .with_payload(json!({ "health_remaining": health_remaining })),
            CoreUpdate::ExtensionConsumed {
                asset,
                extensions_used,
            } => Event::new(
                EventCategory::Protection,
                "core_asset_extension",
                at,
                self.session_id,
                format!("extension {} consumed", extensions_used),
            )
            .with_asset(asset),
            CoreUpdate::Dropped { asset, reason } => Event::new(
                EventCategory::Protection,
                "core_asset_dropped",
                at,
                self.session_id,
                reason,
            )
            .with_asset(asset),
            CoreUpdate::CheckSkipped { asset, reason } => Event::new(
                EventCategory::Error,
                "core_performance_check_skipped",
                at,
                self.session_id,
                reason,
            )
            .with_asset(asset),
        };
        self.events.append(event).await?;
        Ok(())
    }

    /// Read access for observers.
    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn orchestrator_metrics(&self) -> OrchestratorMetrics {
        self.orchestrator.performance_metrics()
    }

    pub fn whipsaw_metrics(&self) -> &crate::application::protections::whipsaw::WhipsawMetrics {
        self.whipsaw.metrics()
    }

    /// Snapshot of serializable state for the harness to persist.
    pub async fn checkpoint(&self, at: Timestamp) -> Result<SessionCheckpoint, EngineError> {
        let cutoff = at - Duration::days(self.config.lifecycle.whipsaw_protection_days * 2);
        Ok(SessionCheckpoint {
            positions: self.ledger.live_positions().values().cloned().collect(),
            position_events: self.ledger.events_since(cutoff),
            grace_states: self.grace.snapshot(),
            core_designations: self.core.snapshot(),
            regime_transitions: self.regime.transition_history().to_vec(),
            event_log_cursor: self.events.count().await?,
        })
    }
}
