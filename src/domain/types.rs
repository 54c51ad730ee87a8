use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The single time type used throughout the engine. Conversions to and from
/// naive dates or unix epochs happen only at collaborator boundaries.
pub type Timestamp = DateTime<Utc>;

/// Normalized asset score produced by an external scorer.
///
/// `combined_score` is authoritative; the technical/fundamental split is kept
/// for analytics only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub asset: String,
    pub combined_score: f64,
    pub technical: f64,
    pub fundamental: f64,
    pub as_of: Timestamp,
}

impl Score {
    pub fn new(asset: impl Into<String>, combined_score: f64, as_of: Timestamp) -> Self {
        let clamped = combined_score.clamp(0.0, 1.0);
        Self {
            asset: asset.into(),
            combined_score: clamped,
            technical: clamped,
            fundamental: clamped,
            as_of,
        }
    }
}

/// Desired per-asset change produced by the rebalancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceAction {
    Open,
    Close,
    Increase,
    Decrease,
    Hold,
}

impl RebalanceAction {
    /// Actions that change ledger state and therefore pass through the
    /// protection hierarchy. `Hold` bypasses it entirely.
    pub fn requires_validation(&self) -> bool {
        !matches!(self, RebalanceAction::Hold)
    }
}

impl fmt::Display for RebalanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceAction::Open => write!(f, "open"),
            RebalanceAction::Close => write!(f, "close"),
            RebalanceAction::Increase => write!(f, "increase"),
            RebalanceAction::Decrease => write!(f, "decrease"),
            RebalanceAction::Hold => write!(f, "hold"),
        }
    }
}

/// Selection priority assigned to a target. Lower rank wins when the position
/// budget forces truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetPriority {
    Core,
    Regime,
    Trending,
    Portfolio,
}

impl AssetPriority {
    /// Ordering rank, lower is more important.
    pub fn rank(&self) -> u8 {
        match self {
            AssetPriority::Core => 0,
            AssetPriority::Regime => 1,
            AssetPriority::Trending => 2,
            AssetPriority::Portfolio => 3,
        }
    }

    /// Priorities allowed to temporarily break a bucket limit when overflow
    /// is enabled.
    pub fn may_overflow_bucket(&self) -> bool {
        matches!(self, AssetPriority::Core | AssetPriority::Regime)
    }
}

impl fmt::Display for AssetPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetPriority::Core => write!(f, "core"),
            AssetPriority::Regime => write!(f, "regime"),
            AssetPriority::Trending => write!(f, "trending"),
            AssetPriority::Portfolio => write!(f, "portfolio"),
        }
    }
}

/// One per-asset instruction describing the desired post-rebalance state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancingTarget {
    pub asset: String,
    pub action: RebalanceAction,
    pub target_pct: Decimal,
    pub current_pct: Decimal,
    pub score: f64,
    pub priority: AssetPriority,
    pub reason: String,
}

impl RebalancingTarget {
    /// Allocation delta this target asks for (positive when buying).
    pub fn delta(&self) -> Decimal {
        self.target_pct - self.current_pct
    }
}

/// Explicit per-asset analytics emitted alongside targets, keyed by asset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetAnalytics {
    pub bucket: Option<String>,
    pub reason: String,
    pub score_before: Option<f64>,
    pub score_after: f64,
}

pub type AnalyticsMap = BTreeMap<String, AssetAnalytics>;
