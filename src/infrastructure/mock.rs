//! Mock collaborators for tests and offline development.
//!
//! Deterministic, scriptable stand-ins for the external scorer, regime
//! detector, price provider and clock.

use crate::domain::ports::{Clock, PricePoint, PriceProvider, RegimeDetector, Scorer};
use crate::domain::regime::{Regime, RegimeSnapshot, TimeframeScores};
use crate::domain::types::{Score, Timestamp};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Clock pinned to a settable instant.
pub struct FixedClock {
    now: RwLock<Timestamp>,
}

impl FixedClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        *self.now.write().expect("clock lock poisoned") = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write().expect("clock lock poisoned");
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        *self.now.read().expect("clock lock poisoned")
    }
}

/// Scorer backed by a settable score table. Unknown assets score 0.
pub struct StaticScorer {
    scores: RwLock<BTreeMap<String, f64>>,
    failing: AtomicBool,
}

impl StaticScorer {
    pub fn new() -> Self {
        Self {
            scores: RwLock::new(BTreeMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn with_scores(pairs: &[(&str, f64)]) -> Self {
        let scorer = Self::new();
        for (asset, score) in pairs {
            scorer.set(asset, *score);
        }
        scorer
    }

    pub fn set(&self, asset: &str, score: f64) {
        self.scores
            .write()
            .expect("score lock poisoned")
            .insert(asset.to_string(), score);
    }

    /// Make subsequent calls fail, as a down scoring service would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Default for StaticScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scorer for StaticScorer {
    async fn score(&self, asset: &str, at: Timestamp) -> Result<Score> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("scoring service unavailable");
        }
        let score = self
            .scores
            .read()
            .expect("score lock poisoned")
            .get(asset)
            .copied()
            .unwrap_or(0.0);
        Ok(Score::new(asset, score, at))
    }
}

/// Regime detector that reports a settable label and timeframe score.
pub struct StaticRegimeDetector {
    state: RwLock<(Regime, TimeframeScores)>,
    failing: AtomicBool,
}

impl StaticRegimeDetector {
    pub fn new(regime: Regime, score: f64) -> Self {
        Self {
            state: RwLock::new((regime, TimeframeScores::uniform(score))),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set(&self, regime: Regime, score: f64) {
        *self.state.write().expect("regime lock poisoned") =
            (regime, TimeframeScores::uniform(score));
    }

    pub fn set_scores(&self, regime: Regime, scores: TimeframeScores) {
        *self.state.write().expect("regime lock poisoned") = (regime, scores);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegimeDetector for StaticRegimeDetector {
    async fn current(&self, at: Timestamp) -> Result<RegimeSnapshot> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("regime detector offline");
        }
        let (regime, scores) = *self.state.read().expect("regime lock poisoned");
        Ok(RegimeSnapshot {
            regime,
            per_timeframe_scores: scores,
            trigger_indicators: vec!["scripted".to_string()],
            as_of: at,
        })
    }
}

/// Price provider with fixed per-asset series.
pub struct StaticPriceProvider {
    series: RwLock<BTreeMap<String, Vec<PricePoint>>>,
}

impl StaticPriceProvider {
    pub fn new() -> Self {
        Self {
            series: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn set_series(&self, asset: &str, points: Vec<(Timestamp, Decimal)>) {
        self.series.write().expect("price lock poisoned").insert(
            asset.to_string(),
            points
                .into_iter()
                .map(|(at, close)| PricePoint { at, close })
                .collect(),
        );
    }
}

impl Default for StaticPriceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceProvider for StaticPriceProvider {
    async fn closes(&self, asset: &str, from: Timestamp, to: Timestamp) -> Result<Vec<PricePoint>> {
        let series = self.series.read().expect("price lock poisoned");
        let points: Vec<PricePoint> = series
            .get(asset)
            .ok_or_else(|| anyhow::anyhow!("no price series for {}", asset))?
            .iter()
            .filter(|p| p.at >= from && p.at <= to)
            .cloned()
            .collect();
        Ok(points)
    }
}
