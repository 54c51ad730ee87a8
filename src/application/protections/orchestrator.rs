//! Protection orchestrator.
//!
//! Resolves each rebalancing action against the protection hierarchy:
//!
//! 1. core-asset immunity (absolute),
//! 2. regime override authority (the only layer that can un-block),
//! 3. grace period,
//! 4. holding period,
//! 5. whipsaw protection.
//!
//! Layers 3-5 are evaluated independently and every result is recorded in
//! the decision for audit, even when an earlier one already blocked. A check
//! failure denies conservatively; nothing is ever open-approved on error.

use crate::application::protections::core_assets::CoreAssetRegistry;
use crate::application::protections::grace::GracePeriodManager;
use crate::application::protections::holding::HoldingPeriodManager;
use crate::application::protections::whipsaw::WhipsawTracker;
use crate::domain::errors::EngineError;
use crate::domain::events::{Event, EventCategory};
use crate::domain::ledger::PositionLedger;
use crate::domain::protection::{
    ProtectionDecision, ProtectionRequest, SystemCheckResult, system,
};
use crate::domain::regime::{RegimeTransition, Severity};
use crate::domain::repositories::EventStore;
use crate::domain::types::{RebalanceAction, Timestamp};
use chrono::Duration;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Mutable views over the protection managers for the duration of one
/// decision. The orchestrator consults them; it never owns them.
pub struct ProtectionSystems<'a> {
    pub ledger: &'a PositionLedger,
    pub core: &'a CoreAssetRegistry,
    pub grace: &'a GracePeriodManager,
    pub holding: &'a mut HoldingPeriodManager,
    pub whipsaw: &'a mut WhipsawTracker,
}

/// Regime facts the override authority consults.
#[derive(Debug, Clone, Default)]
pub struct RegimeOverrideContext {
    pub transition: Option<RegimeTransition>,
    pub confidence: f64,
}

/// Running totals exposed for monitoring.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorMetrics {
    pub decisions_processed: u64,
    pub decisions_approved: u64,
    pub decisions_denied: u64,
    pub overrides_applied: u64,
    pub avg_decision_ms: f64,
}

pub struct ProtectionOrchestrator {
    events: Arc<dyn EventStore>,
    session_id: Uuid,
    enable_grace: bool,
    enable_whipsaw: bool,
    enable_regime_overrides: bool,
    severity_threshold: Severity,
    override_cooldown: Duration,
    last_override: BTreeMap<String, Timestamp>,
    trace_seq: u64,
    processed: u64,
    approved: u64,
    denied: u64,
    overridden: u64,
    total_decision_ms: f64,
    #[cfg(test)]
    fault_system: Option<&'static str>,
}

impl ProtectionOrchestrator {
    pub fn new(
        events: Arc<dyn EventStore>,
        session_id: Uuid,
        enable_grace: bool,
        enable_whipsaw: bool,
        enable_regime_overrides: bool,
        severity_threshold: Severity,
        override_cooldown_hours: i64,
    ) -> Self {
        Self {
            events,
            session_id,
            enable_grace,
            enable_whipsaw,
            enable_regime_overrides,
            severity_threshold,
            override_cooldown: Duration::hours(override_cooldown_hours),
            last_override: BTreeMap::new(),
            trace_seq: 0,
            processed: 0,
            approved: 0,
            denied: 0,
            overridden: 0,
            total_decision_ms: 0.0,
            #[cfg(test)]
            fault_system: None,
        }
    }

    /// Judge one request. Emits exactly one `protection_decision_start` and
    /// one `protection_decision_complete` with the same trace id; if either
    /// append fails, the whole call fails and no decision is returned.
    pub async fn decide(
        &mut self,
        systems: &mut ProtectionSystems<'_>,
        regime: &RegimeOverrideContext,
        request: &ProtectionRequest,
    ) -> Result<ProtectionDecision, EngineError> {
        let started = Instant::now();
        let trace_id = self.next_trace_id();

        self.events
            .append(
                Event::new(
                    EventCategory::Protection,
                    "protection_decision_start",
                    request.at,
                    self.session_id,
                    request.reason.clone(),
                )
                .with_asset(request.asset.clone())
                .with_action(request.action.to_string())
                .with_trace(trace_id),
            )
            .await?;

        let outcome = self.evaluate(systems, regime, request);
        let (approved, results, override_applied, override_reason) = match outcome {
            Ok(parts) => parts,
            Err(check_error) => {
                // Deny-by-default: the failing system is recorded as
                // "error" and the batch continues.
                error!(
                    "ProtectionOrchestrator [{}]: check failed, denying: {}",
                    request.asset, check_error
                );
                self.events
                    .append(
                        Event::new(
                            EventCategory::Error,
                            "error",
                            request.at,
                            self.session_id,
                            check_error.to_string(),
                        )
                        .with_asset(request.asset.clone())
                        .with_trace(trace_id),
                    )
                    .await?;
                (
                    false,
                    vec![SystemCheckResult::block(system::ERROR, 0, check_error.to_string())],
                    false,
                    None,
                )
            }
        };

        let blocking_systems: Vec<String> = results
            .iter()
            .filter(|r| r.blocked)
            .map(|r| r.system.clone())
            .collect();

        let decision = ProtectionDecision {
            approved,
            blocking_systems: blocking_systems.clone(),
            override_applied,
            override_reason: override_reason.clone(),
            per_system_results: results,
            decided_in_ms: started.elapsed().as_secs_f64() * 1000.0,
            trace_id,
        };

        self.events
            .append(
                Event::new(
                    EventCategory::Protection,
                    "protection_decision_complete",
                    request.at,
                    self.session_id,
                    if approved { "approved" } else { "denied" },
                )
                .with_asset(request.asset.clone())
                .with_action(request.action.to_string())
                .with_trace(trace_id)
                .with_payload(json!({
                    "approved": approved,
                    "blocking_systems": blocking_systems,
                    "override_applied": override_applied,
                    "override_reason": override_reason,
                })),
            )
            .await?;

        self.processed += 1;
        if decision.approved {
            self.approved += 1;
        } else {
            self.denied += 1;
        }
        if decision.override_applied {
            self.overridden += 1;
        }
        self.total_decision_ms += decision.decided_in_ms;

        if !decision.approved {
            warn!(
                "ProtectionOrchestrator [{}]: {} denied by [{}]",
                request.asset,
                request.action,
                decision.blocking_systems.join(", ")
            );
        } else if decision.override_applied {
            info!(
                "ProtectionOrchestrator [{}]: {} approved via override: {}",
                request.asset,
                request.action,
                decision.override_reason.as_deref().unwrap_or("")
            );
        }

        Ok(decision)
    }

    pub fn performance_metrics(&self) -> OrchestratorMetrics {
        OrchestratorMetrics {
            decisions_processed: self.processed,
            decisions_approved: self.approved,
            decisions_denied: self.denied,
            overrides_applied: self.overridden,
            avg_decision_ms: if self.processed == 0 {
                0.0
            } else {
                self.total_decision_ms / self.processed as f64
            },
        }
    }

    /// Whether the per-asset override cooldown has lapsed.
    pub fn override_cooldown_elapsed(&self, asset: &str, at: Timestamp) -> bool {
        match self.last_override.get(asset) {
            Some(last) => at - *last >= self.override_cooldown,
            None => true,
        }
    }

    #[allow(clippy::type_complexity)]
    fn evaluate(
        &mut self,
        systems: &mut ProtectionSystems<'_>,
        regime: &RegimeOverrideContext,
        request: &ProtectionRequest,
    ) -> Result<(bool, Vec<SystemCheckResult>, bool, Option<String>), EngineError> {
        // Hold never enters the hierarchy.
        if request.action == RebalanceAction::Hold {
            return Ok((true, Vec::new(), false, None));
        }

        #[cfg(test)]
        if let Some(fault) = self.fault_system {
            return Err(EngineError::ProtectionCheck {
                system: fault.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        // Priority 1: core immunity is absolute. Nothing below it runs.
        if systems.core.blocks_action(&request.asset, request.action) {
            let result = SystemCheckResult::block(
                system::CORE_ASSET_IMMUNITY,
                1,
                format!("{} is a core asset, {} denied", request.asset, request.action),
            );
            return Ok((false, vec![result], false, None));
        }
        let mut results = vec![SystemCheckResult::pass(
            system::CORE_ASSET_IMMUNITY,
            1,
            "not a core asset or action permitted",
        )];

        let opened_at = request
            .position_opened_at
            .or_else(|| systems.ledger.position(&request.asset).map(|p| p.opened_at));

        // Priority 3: grace period.
        if self.enable_grace {
            let check = systems
                .grace
                .evaluate(&request.asset, request.action, request.target_size);
            let mut result = if check.blocked {
                SystemCheckResult::block(system::GRACE_PERIOD, 3, check.reason)
            } else {
                SystemCheckResult::pass(system::GRACE_PERIOD, 3, check.reason)
            };
            result.size_related = check.size_related;
            results.push(result);
        } else {
            results.push(SystemCheckResult::pass(system::GRACE_PERIOD, 3, "disabled"));
        }

        // Priority 4: holding period, close actions only.
        if request.action == RebalanceAction::Close {
            match opened_at {
                Some(opened_at) => {
                    let check = systems.holding.can_close(
                        &request.asset,
                        opened_at,
                        request.at,
                        regime.transition.as_ref(),
                    );
                    results.push(if check.allowed {
                        SystemCheckResult::pass(system::HOLDING_PERIOD, 4, check.reason)
                    } else {
                        SystemCheckResult::block(system::HOLDING_PERIOD, 4, check.reason)
                    });
                }
                None => results.push(SystemCheckResult::pass(
                    system::HOLDING_PERIOD,
                    4,
                    "no live position",
                )),
            }
        } else {
            results.push(SystemCheckResult::pass(
                system::HOLDING_PERIOD,
                4,
                "not a close action",
            ));
        }

        // Priority 5: whipsaw.
        if self.enable_whipsaw {
            match request.action {
                RebalanceAction::Open => {
                    let (allowed, reason) =
                        systems
                            .whipsaw
                            .can_open(systems.ledger, &request.asset, request.at);
                    results.push(if allowed {
                        SystemCheckResult::pass(system::WHIPSAW_PROTECTION, 5, reason)
                    } else {
                        SystemCheckResult::block(system::WHIPSAW_PROTECTION, 5, reason)
                    });
                }
                RebalanceAction::Close => match opened_at {
                    Some(opened_at) => {
                        let (allowed, reason) =
                            systems.whipsaw.can_close(&request.asset, opened_at, request.at);
                        results.push(if allowed {
                            SystemCheckResult::pass(system::WHIPSAW_PROTECTION, 5, reason)
                        } else {
                            SystemCheckResult::block(system::WHIPSAW_PROTECTION, 5, reason)
                        });
                    }
                    None => results.push(SystemCheckResult::pass(
                        system::WHIPSAW_PROTECTION,
                        5,
                        "no live position",
                    )),
                },
                _ => results.push(SystemCheckResult::pass(
                    system::WHIPSAW_PROTECTION,
                    5,
                    "not an open or close action",
                )),
            }
        } else {
            results.push(SystemCheckResult::pass(system::WHIPSAW_PROTECTION, 5, "disabled"));
        }

        let blocked: Vec<String> = results
            .iter()
            .filter(|r| r.blocked)
            .map(|r| r.system.clone())
            .collect();
        if blocked.is_empty() {
            return Ok((true, results, false, None));
        }

        // Priority 2: regime override, consulted only because something
        // below it blocked. It must cover every blocking system.
        match self.override_authority(systems, regime, request, &blocked) {
            Some(reason) => {
                self.last_override.insert(request.asset.clone(), request.at);
                if blocked.iter().any(|s| s == system::HOLDING_PERIOD) {
                    systems.holding.record_override(&request.asset, request.at);
                }
                if blocked.iter().any(|s| s == system::WHIPSAW_PROTECTION) {
                    systems.whipsaw.record_override();
                }
                // The blocked results stay in the record for audit; the
                // override flips the outcome, not the history.
                results.insert(
                    1,
                    SystemCheckResult::pass(
                        "regime_override",
                        2,
                        format!("override granted: {}", reason),
                    ),
                );
                Ok((true, results, true, Some(reason)))
            }
            None => {
                results.insert(
                    1,
                    SystemCheckResult::pass("regime_override", 2, "no override authority"),
                );
                Ok((false, results, false, None))
            }
        }
    }

    /// The authority table. Returns the override reason when the regime
    /// context can bypass every blocking system for this asset.
    fn override_authority(
        &self,
        systems: &ProtectionSystems<'_>,
        regime: &RegimeOverrideContext,
        request: &ProtectionRequest,
        blocked: &[String],
    ) -> Option<String> {
        if !self.enable_regime_overrides {
            return None;
        }
        if !self.override_cooldown_elapsed(&request.asset, request.at) {
            return None;
        }

        let severity = regime
            .transition
            .as_ref()
            .map(|t| t.severity)
            .unwrap_or(Severity::Normal);

        for system_name in blocked {
            let authorized = match system_name.as_str() {
                system::GRACE_PERIOD => severity >= Severity::High || regime.confidence < 0.4,
                system::HOLDING_PERIOD => {
                    severity >= self.severity_threshold
                        && systems.holding.override_cooldown_elapsed(&request.asset, request.at)
                }
                system::WHIPSAW_PROTECTION => severity == Severity::Critical || request.emergency,
                _ => false,
            };
            if !authorized {
                return None;
            }
        }

        let basis = match &regime.transition {
            Some(transition) => transition.describe(),
            None if regime.confidence < 0.4 => {
                format!("low regime confidence: {:.3} < 0.4", regime.confidence)
            }
            None => "emergency condition signaled".to_string(),
        };
        Some(format!("{} bypassed {}", basis, blocked.join(", ")))
    }

    /// Deterministic per-session trace ids so identical runs produce
    /// identical event streams.
    fn next_trace_id(&mut self) -> Uuid {
        let (high, _) = self.session_id.as_u64_pair();
        let trace = Uuid::from_u64_pair(high, self.trace_seq);
        self.trace_seq += 1;
        trace
    }

    #[cfg(test)]
    pub(crate) fn inject_fault(&mut self, system: &'static str) {
        self.fault_system = Some(system);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventFilter;
    use crate::domain::ledger::NewPositionEvent;
    use crate::domain::regime::Regime;
    use crate::infrastructure::event_store::InMemoryEventStore;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 3, 9, 30, 0).unwrap()
    }

    struct Fixture {
        ledger: PositionLedger,
        core: CoreAssetRegistry,
        grace: GracePeriodManager,
        holding: HoldingPeriodManager,
        whipsaw: WhipsawTracker,
        store: Arc<InMemoryEventStore>,
        orchestrator: ProtectionOrchestrator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryEventStore::new(365));
        let orchestrator = ProtectionOrchestrator::new(
            store.clone(),
            Uuid::from_u128(7),
            true,
            true,
            true,
            Severity::High,
            24,
        );
        Fixture {
            ledger: PositionLedger::new(dec!(0.95)),
            core: CoreAssetRegistry::new(3, 0.95, 90, 0.15, 30, 2, 7, None),
            grace: GracePeriodManager::new(5, 0.8, 0.1, 0.6),
            holding: HoldingPeriodManager::new(3, 90, 30, Severity::High),
            whipsaw: WhipsawTracker::new(1, 14, 4),
            store,
            orchestrator,
        }
    }

    impl Fixture {
        async fn decide(
            &mut self,
            regime: &RegimeOverrideContext,
            request: &ProtectionRequest,
        ) -> ProtectionDecision {
            let mut systems = ProtectionSystems {
                ledger: &self.ledger,
                core: &self.core,
                grace: &self.grace,
                holding: &mut self.holding,
                whipsaw: &mut self.whipsaw,
            };
            self.orchestrator
                .decide(&mut systems, regime, request)
                .await
                .unwrap()
        }
    }

    fn critical_transition(at: Timestamp) -> RegimeOverrideContext {
        RegimeOverrideContext {
            transition: Some(RegimeTransition {
                from: Regime::Goldilocks,
                to: Regime::Deflation,
                at,
                severity: Severity::Critical,
                confidence: 0.9,
                trigger_indicators: vec![],
            }),
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn test_core_immunity_blocks_close_absolutely() {
        let mut fx = fixture();
        fx.core.on_score("A", 0.96, t0());
        fx.ledger
            .record_event(NewPositionEvent::open("A", t0(), dec!(0.30)))
            .unwrap();

        let request = ProtectionRequest::new("A", RebalanceAction::Close, t0() + chrono::Duration::days(5));
        // Even a critical transition cannot override priority 1.
        let decision = fx.decide(&critical_transition(t0()), &request).await;

        assert!(!decision.approved);
        assert_eq!(decision.blocking_systems, vec![system::CORE_ASSET_IMMUNITY]);
        assert!(!decision.override_applied);
        // No lower-priority checks executed.
        assert_eq!(decision.per_system_results.len(), 1);
    }

    #[tokio::test]
    async fn test_open_on_core_asset_passes_core_layer() {
        let mut fx = fixture();
        fx.core.on_score("A", 0.96, t0());
        let request = ProtectionRequest::new("A", RebalanceAction::Open, t0());
        let decision = fx.decide(&RegimeOverrideContext::default(), &request).await;
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn test_all_system_results_recorded_when_core_passes() {
        let mut fx = fixture();
        let request = ProtectionRequest::new("B", RebalanceAction::Open, t0());
        let decision = fx.decide(&RegimeOverrideContext::default(), &request).await;
        assert!(decision.approved);
        let names: Vec<&str> = decision
            .per_system_results
            .iter()
            .map(|r| r.system.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                system::CORE_ASSET_IMMUNITY,
                system::GRACE_PERIOD,
                system::HOLDING_PERIOD,
                system::WHIPSAW_PROTECTION
            ]
        );
    }

    #[tokio::test]
    async fn test_whipsaw_blocks_reopen_within_window() {
        let mut fx = fixture();
        fx.ledger
            .record_event(NewPositionEvent::open("C", t0(), dec!(0.30)))
            .unwrap();
        fx.ledger
            .record_event(NewPositionEvent::close("C", t0() + chrono::Duration::hours(1)))
            .unwrap();

        let request =
            ProtectionRequest::new("C", RebalanceAction::Open, t0() + chrono::Duration::hours(6));
        let decision = fx.decide(&RegimeOverrideContext::default(), &request).await;

        assert!(!decision.approved);
        assert_eq!(decision.blocking_systems, vec![system::WHIPSAW_PROTECTION]);
    }

    #[tokio::test]
    async fn test_critical_transition_overrides_grace_block() {
        let mut fx = fixture();
        fx.ledger
            .record_event(NewPositionEvent::open("B", t0(), dec!(0.30)))
            .unwrap();
        fx.grace.on_score("B", 0.45, t0() + chrono::Duration::days(1), dec!(0.30));

        let at = t0() + chrono::Duration::days(3);
        let mut request = ProtectionRequest::new("B", RebalanceAction::Close, at);
        request.position_opened_at = Some(t0());

        let decision = fx.decide(&critical_transition(at), &request).await;
        assert!(decision.approved);
        assert!(decision.override_applied);
        let reason = decision.override_reason.unwrap();
        assert!(reason.contains("critical regime transition"));
        // Cooldown armed: the same override is not granted again within 24h.
        assert!(!fx.orchestrator.override_cooldown_elapsed("B", at + chrono::Duration::hours(23)));
        assert!(fx.orchestrator.override_cooldown_elapsed("B", at + chrono::Duration::hours(24)));
    }

    #[tokio::test]
    async fn test_denied_unchanged_resubmission_stays_denied() {
        let mut fx = fixture();
        fx.ledger
            .record_event(NewPositionEvent::open("X", t0(), dec!(0.30)))
            .unwrap();

        // Close after 1 day: holding period blocks, regime normal.
        let at = t0() + chrono::Duration::days(1);
        let mut request = ProtectionRequest::new("X", RebalanceAction::Close, at);
        request.position_opened_at = Some(t0());

        let first = fx.decide(&RegimeOverrideContext::default(), &request).await;
        assert!(!first.approved);
        let second = fx.decide(&RegimeOverrideContext::default(), &request).await;
        assert!(!second.approved);
        assert_eq!(first.blocking_systems, second.blocking_systems);
    }

    #[tokio::test]
    async fn test_hold_bypasses_hierarchy() {
        let mut fx = fixture();
        fx.core.on_score("A", 0.96, t0());
        let request = ProtectionRequest::new("A", RebalanceAction::Hold, t0());
        let decision = fx.decide(&RegimeOverrideContext::default(), &request).await;
        assert!(decision.approved);
        assert!(decision.per_system_results.is_empty());
    }

    #[tokio::test]
    async fn test_check_error_denies_with_error_system() {
        let mut fx = fixture();
        fx.orchestrator.inject_fault("grace_period");
        let request = ProtectionRequest::new("B", RebalanceAction::Open, t0());
        let decision = fx.decide(&RegimeOverrideContext::default(), &request).await;

        assert!(!decision.approved);
        assert_eq!(decision.blocking_systems, vec![system::ERROR]);

        let errors = fx
            .store
            .query(EventFilter::by_category(EventCategory::Error), None)
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_start_and_complete_share_trace_id() {
        let mut fx = fixture();
        let request = ProtectionRequest::new("B", RebalanceAction::Open, t0());
        let decision = fx.decide(&RegimeOverrideContext::default(), &request).await;

        let events = fx
            .store
            .query(EventFilter::by_trace(decision.trace_id), None)
            .await
            .unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["protection_decision_start", "protection_decision_complete"]
        );
    }

    #[tokio::test]
    async fn test_holding_override_requires_holding_cooldown() {
        let mut fx = fixture();
        fx.ledger
            .record_event(NewPositionEvent::open("X", t0(), dec!(0.30)))
            .unwrap();
        // Burn the holding-period override cooldown for X.
        fx.holding.record_override("X", t0());

        let at = t0() + chrono::Duration::days(1);
        let mut request = ProtectionRequest::new("X", RebalanceAction::Close, at);
        request.position_opened_at = Some(t0());

        let decision = fx.decide(&critical_transition(at), &request).await;
        assert!(!decision.approved);
        assert!(decision.blocked_by(system::HOLDING_PERIOD));
    }

    #[tokio::test]
    async fn test_mixed_blocks_need_authority_over_all() {
        let mut fx = fixture();
        fx.ledger
            .record_event(NewPositionEvent::open("Y", t0(), dec!(0.30)))
            .unwrap();
        // Close 1h after open: holding blocks (min 3d) and whipsaw blocks
        // (min 4h). A high-severity (not critical) transition covers holding
        // but not whipsaw, so the decision stays denied.
        let at = t0() + chrono::Duration::hours(1);
        let mut request = ProtectionRequest::new("Y", RebalanceAction::Close, at);
        request.position_opened_at = Some(t0());

        let regime = RegimeOverrideContext {
            transition: Some(RegimeTransition {
                from: Regime::Goldilocks,
                to: Regime::Inflation,
                at,
                severity: Severity::High,
                confidence: 0.75,
                trigger_indicators: vec![],
            }),
            confidence: 0.75,
        };
        let decision = fx.decide(&regime, &request).await;
        assert!(!decision.approved);
        assert!(!decision.override_applied);
    }

    #[tokio::test]
    async fn test_metrics_accumulate() {
        let mut fx = fixture();
        let request = ProtectionRequest::new("B", RebalanceAction::Open, t0());
        fx.decide(&RegimeOverrideContext::default(), &request).await;
        fx.decide(&RegimeOverrideContext::default(), &request).await;
        let metrics = fx.orchestrator.performance_metrics();
        assert_eq!(metrics.decisions_processed, 2);
        assert_eq!(metrics.decisions_approved, 2);
        assert!(metrics.avg_decision_ms >= 0.0);
    }
}
