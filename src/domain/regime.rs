use crate::domain::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discrete macro-market regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Goldilocks,
    Reflation,
    Inflation,
    Deflation,
    /// Missing or unclassifiable data. Never participates in transitions.
    Unknown,
}

/// Broad risk stance implied by a regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegimeClass {
    RiskOn,
    RiskOff,
    Indeterminate,
}

impl Regime {
    pub fn class(&self) -> RegimeClass {
        match self {
            Regime::Goldilocks | Regime::Reflation => RegimeClass::RiskOn,
            Regime::Inflation | Regime::Deflation => RegimeClass::RiskOff,
            Regime::Unknown => RegimeClass::Indeterminate,
        }
    }

    /// Diagonally opposed regime pairs (growth and inflation both flip).
    pub fn is_opposing(&self, other: &Regime) -> bool {
        matches!(
            (self, other),
            (Regime::Goldilocks, Regime::Deflation)
                | (Regime::Deflation, Regime::Goldilocks)
                | (Regime::Reflation, Regime::Inflation)
                | (Regime::Inflation, Regime::Reflation)
        )
    }

    /// True when the two labels sit on different sides of the risk divide.
    pub fn is_cross_class(&self, other: &Regime) -> bool {
        let (a, b) = (self.class(), other.class());
        a != b && a != RegimeClass::Indeterminate && b != RegimeClass::Indeterminate
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regime::Goldilocks => write!(f, "Goldilocks"),
            Regime::Reflation => write!(f, "Reflation"),
            Regime::Inflation => write!(f, "Inflation"),
            Regime::Deflation => write!(f, "Deflation"),
            Regime::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Ordinal severity of a regime transition. `Ord` gives the total
/// threshold comparison the override authority table relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Normal,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Normal => write!(f, "normal"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Per-timeframe regime agreement scores in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimeframeScores {
    pub h1: f64,
    pub h4: f64,
    pub d1: f64,
}

impl TimeframeScores {
    pub fn uniform(score: f64) -> Self {
        Self {
            h1: score,
            h4: score,
            d1: score,
        }
    }

    /// Weighted blend of the three timeframes; weights are normalized in
    /// case the configuration does not sum to one.
    pub fn weighted(&self, w_1d: f64, w_4h: f64, w_1h: f64) -> f64 {
        let total = w_1d + w_4h + w_1h;
        if total <= 0.0 {
            return 0.0;
        }
        (self.d1 * w_1d + self.h4 * w_4h + self.h1 * w_1h) / total
    }
}

/// Raw reading from the external regime detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub regime: Regime,
    pub per_timeframe_scores: TimeframeScores,
    pub trigger_indicators: Vec<String>,
    pub as_of: Timestamp,
}

/// Aggregated regime state with derived stability and strength.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    pub confidence: f64,
    /// 1.0 when recent readings all agree on the label, 0.0 when they are
    /// evenly split.
    pub stability: f64,
    /// Margin by which the dominant timeframe score beats the weakest.
    pub strength: f64,
    pub detected_at: Timestamp,
    pub duration_hours: i64,
    pub per_timeframe_scores: TimeframeScores,
}

impl RegimeState {
    pub fn unknown(at: Timestamp) -> Self {
        Self {
            regime: Regime::Unknown,
            confidence: 0.0,
            stability: 0.0,
            strength: 0.0,
            detected_at: at,
            duration_hours: 0,
            per_timeframe_scores: TimeframeScores::default(),
        }
    }
}

/// A validated change of regime label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeTransition {
    pub from: Regime,
    pub to: Regime,
    pub at: Timestamp,
    pub severity: Severity,
    pub confidence: f64,
    pub trigger_indicators: Vec<String>,
}

impl RegimeTransition {
    pub fn describe(&self) -> String {
        format!("{} regime transition: {} -> {}", self.severity, self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_total_order() {
        assert!(Severity::Normal < Severity::High);
        assert!(Severity::High < Severity::Critical);
        assert!(Severity::Critical >= Severity::High);
    }

    #[test]
    fn test_opposing_pairs() {
        assert!(Regime::Goldilocks.is_opposing(&Regime::Deflation));
        assert!(Regime::Inflation.is_opposing(&Regime::Reflation));
        assert!(!Regime::Goldilocks.is_opposing(&Regime::Reflation));
        assert!(!Regime::Unknown.is_opposing(&Regime::Deflation));
    }

    #[test]
    fn test_cross_class() {
        assert!(Regime::Goldilocks.is_cross_class(&Regime::Inflation));
        assert!(Regime::Reflation.is_cross_class(&Regime::Deflation));
        assert!(!Regime::Goldilocks.is_cross_class(&Regime::Reflation));
        assert!(!Regime::Unknown.is_cross_class(&Regime::Deflation));
    }

    #[test]
    fn test_weighted_scores_normalize() {
        let scores = TimeframeScores {
            h1: 1.0,
            h4: 1.0,
            d1: 1.0,
        };
        let blended = scores.weighted(0.5, 0.3, 0.2);
        assert!((blended - 1.0).abs() < 1e-12);
        // Degenerate weights fall back to zero rather than dividing by zero.
        assert_eq!(scores.weighted(0.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_transition_describe_names_severity() {
        let transition = RegimeTransition {
            from: Regime::Goldilocks,
            to: Regime::Deflation,
            at: chrono::Utc::now(),
            severity: Severity::Critical,
            confidence: 0.9,
            trigger_indicators: vec![],
        };
        let text = transition.describe();
        assert!(text.contains("critical regime transition"));
        assert!(text.contains("Goldilocks"));
        assert!(text.contains("Deflation"));
    }
}
