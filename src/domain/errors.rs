use thiserror::Error;

/// Errors surfaced by the rebalancing engine.
///
/// Fatal kinds abort the current rebalance and leave the ledger unchanged.
/// `ProtectionCheck` is the one non-fatal kind: the affected check defaults
/// to deny and the batch continues.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Scorer unavailable: {0}")]
    ScorerUnavailable(String),

    #[error("Regime detector unavailable: {0}")]
    RegimeUnavailable(String),

    #[error("Ledger invariant violated: {0}")]
    LedgerInvariantViolation(String),

    #[error("Protection check failed in {system}: {reason}")]
    ProtectionCheck { system: String, reason: String },

    #[error("Event log unavailable: {0}")]
    EventLogUnavailable(String),

    #[error("Rebalance timed out after {elapsed_ms}ms (budget {budget_ms}ms)")]
    Timeout { elapsed_ms: i64, budget_ms: i64 },
}

impl EngineError {
    /// Fatal errors abort the rebalance; non-fatal ones deny the affected
    /// target and continue.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, EngineError::ProtectionCheck { .. })
    }
}

/// Errors raised by the position ledger when an event cannot be recorded.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Out-of-order event for {asset}: {at} is not after {last}")]
    OutOfOrderEvent {
        asset: String,
        at: String,
        last: String,
    },

    #[error("No live position for {asset}")]
    NoLivePosition { asset: String },

    #[error("Overlapping open for {asset}: position already live")]
    OverlappingOpen { asset: String },

    #[error("Allocation cap exceeded: total {total} > cap {cap}")]
    AllocationCapExceeded { total: String, cap: String },
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        EngineError::LedgerInvariantViolation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_check_is_non_fatal() {
        let e = EngineError::ProtectionCheck {
            system: "whipsaw_protection".to_string(),
            reason: "cache poisoned".to_string(),
        };
        assert!(!e.is_fatal());
    }

    #[test]
    fn test_other_kinds_are_fatal() {
        assert!(EngineError::ConfigInvalid("bad".into()).is_fatal());
        assert!(EngineError::RegimeUnavailable("down".into()).is_fatal());
        assert!(EngineError::EventLogUnavailable("closed".into()).is_fatal());
    }

    #[test]
    fn test_ledger_error_formatting() {
        let e = LedgerError::OutOfOrderEvent {
            asset: "AAPL".to_string(),
            at: "2024-01-01".to_string(),
            last: "2024-01-02".to_string(),
        };
        let msg = e.to_string();
        assert!(msg.contains("AAPL"));
        assert!(msg.contains("not after"));
    }
}
