use crate::domain::regime::RegimeSnapshot;
use crate::domain::types::{Score, Timestamp};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// External scorer. Pure from the engine's point of view.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, asset: &str, at: Timestamp) -> Result<Score>;

    /// Score a whole universe at once. The default loops over `score`;
    /// implementations with batch endpoints should override it.
    async fn score_universe(&self, assets: &[String], at: Timestamp) -> Result<Vec<Score>> {
        let mut scores = Vec::with_capacity(assets.len());
        for asset in assets {
            scores.push(self.score(asset, at).await?);
        }
        Ok(scores)
    }
}

/// One close observation of a price series.
#[derive(Debug, Clone)]
pub struct PricePoint {
    pub at: Timestamp,
    pub close: Decimal,
}

/// Historical close prices, used by core-asset performance checks. A failed
/// fetch skips the check with a warning event rather than failing the
/// rebalance.
#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn closes(&self, asset: &str, from: Timestamp, to: Timestamp) -> Result<Vec<PricePoint>>;
}

/// External macro-regime classifier. Required; failure is fatal for the
/// current rebalance.
#[async_trait]
pub trait RegimeDetector: Send + Sync {
    async fn current(&self, at: Timestamp) -> Result<RegimeSnapshot>;
}

/// Injectable time source so backtests stay deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation for live use.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now()
    }
}
