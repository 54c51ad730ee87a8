use crate::domain::types::{RebalanceAction, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known protection system names, as they appear in decision records
/// and the event log.
pub mod system {
    pub const CORE_ASSET_IMMUNITY: &str = "core_asset_immunity";
    pub const GRACE_PERIOD: &str = "grace_period";
    pub const HOLDING_PERIOD: &str = "holding_period";
    pub const WHIPSAW_PROTECTION: &str = "whipsaw_protection";
    pub const ERROR: &str = "error";
}

/// Everything the orchestrator needs to judge one action.
#[derive(Debug, Clone)]
pub struct ProtectionRequest {
    pub asset: String,
    pub action: RebalanceAction,
    pub at: Timestamp,
    pub current_size: Decimal,
    pub target_size: Decimal,
    pub score: Option<f64>,
    pub position_opened_at: Option<Timestamp>,
    /// Emergency condition signaled by the caller; grants whipsaw override
    /// authority on its own.
    pub emergency: bool,
    pub reason: String,
}

impl ProtectionRequest {
    pub fn new(asset: impl Into<String>, action: RebalanceAction, at: Timestamp) -> Self {
        Self {
            asset: asset.into(),
            action,
            at,
            current_size: Decimal::ZERO,
            target_size: Decimal::ZERO,
            score: None,
            position_opened_at: None,
            emergency: false,
            reason: String::new(),
        }
    }
}

/// Result of one protection system's check, recorded for audit regardless of
/// whether it decided the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCheckResult {
    pub system: String,
    pub blocked: bool,
    pub reason: String,
    /// Hierarchy slot, 1 (core immunity) through 5 (whipsaw).
    pub priority: u8,
    /// Marks a denial that a smaller delta could satisfy; drives the
    /// decrease-retry path in reconciliation.
    pub size_related: bool,
}

impl SystemCheckResult {
    pub fn pass(system: &str, priority: u8, reason: impl Into<String>) -> Self {
        Self {
            system: system.to_string(),
            blocked: false,
            reason: reason.into(),
            priority,
            size_related: false,
        }
    }

    pub fn block(system: &str, priority: u8, reason: impl Into<String>) -> Self {
        Self {
            system: system.to_string(),
            blocked: true,
            reason: reason.into(),
            priority,
            size_related: false,
        }
    }
}

/// The orchestrator's verdict on one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionDecision {
    pub approved: bool,
    pub blocking_systems: Vec<String>,
    pub override_applied: bool,
    pub override_reason: Option<String>,
    pub per_system_results: Vec<SystemCheckResult>,
    pub decided_in_ms: f64,
    pub trace_id: Uuid,
}

impl ProtectionDecision {
    pub fn blocked_by(&self, system: &str) -> bool {
        self.blocking_systems.iter().any(|s| s == system)
    }

    /// True when every blocking result is one a smaller delta could satisfy.
    pub fn is_size_related(&self) -> bool {
        let blocking: Vec<_> = self
            .per_system_results
            .iter()
            .filter(|r| r.blocked)
            .collect();
        !blocking.is_empty() && blocking.iter().all(|r| r.size_related)
    }
}
