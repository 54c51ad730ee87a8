//! Regime context.
//!
//! Aggregates raw detector readings into a single validated regime state,
//! emits transitions when a label change survives the confidence and
//! momentum checks, and serves module-specific projections (risk scaling for
//! sizing, preferred buckets for diversification) from a short-lived cache.

use crate::config::RegimeConfig;
use crate::domain::errors::EngineError;
use crate::domain::ports::RegimeDetector;
use crate::domain::regime::{Regime, RegimeState, RegimeTransition, Severity};
use crate::domain::types::Timestamp;
use chrono::{Duration, Timelike};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Bounded transition history kept for checkpointing and diagnostics.
const TRANSITION_HISTORY_CAP: usize = 100;

/// Projection handed to sizing and diversification.
#[derive(Debug, Clone)]
pub struct ContextView {
    pub state: RegimeState,
    /// Multiplier applied to position sizes, in (0, 1].
    pub risk_scaling: f64,
    /// Buckets the current regime favors, best first.
    pub preferred_buckets: Vec<String>,
}

pub struct RegimeContextProvider {
    detector: Arc<dyn RegimeDetector>,
    config: RegimeConfig,
    state: Option<RegimeState>,
    /// When the current validated label was first seen.
    label_since: Option<Timestamp>,
    recent_labels: VecDeque<Regime>,
    last_transition: Option<RegimeTransition>,
    transition_history: Vec<RegimeTransition>,
    view_cache: BTreeMap<(Option<String>, i64), (Timestamp, ContextView)>,
}

impl RegimeContextProvider {
    pub fn new(detector: Arc<dyn RegimeDetector>, config: RegimeConfig) -> Self {
        Self {
            detector,
            config,
            state: None,
            label_since: None,
            recent_labels: VecDeque::new(),
            last_transition: None,
            transition_history: Vec::new(),
            view_cache: BTreeMap::new(),
        }
    }

    /// Pull a fresh reading and fold it into the aggregated state. Emits at
    /// most one transition per refresh; an invalid or unchanged label keeps
    /// the previous validated state's label history.
    pub async fn refresh(&mut self, at: Timestamp) -> Result<RegimeState, EngineError> {
        let snapshot = self
            .detector
            .current(at)
            .await
            .map_err(|e| EngineError::RegimeUnavailable(e.to_string()))?;

        let confidence = snapshot.per_timeframe_scores.weighted(
            self.config.weight_1d,
            self.config.weight_4h,
            self.config.weight_1h,
        );

        self.recent_labels.push_back(snapshot.regime);
        while self.recent_labels.len() > self.config.stability_window {
            self.recent_labels.pop_front();
        }
        let stability = self
            .recent_labels
            .iter()
            .filter(|r| **r == snapshot.regime)
            .count() as f64
            / self.recent_labels.len() as f64;

        let scores = snapshot.per_timeframe_scores;
        let top = scores.d1.max(scores.h4).max(scores.h1);
        let rest = scores.d1 + scores.h4 + scores.h1 - top;
        let strength = (top - rest / 2.0).max(0.0);

        let previous = self.state.clone();
        let transition = self.validate_transition(&snapshot.regime, confidence, at, &snapshot.trigger_indicators, previous.as_ref());

        if transition.is_some() || previous.is_none() {
            self.label_since = Some(at);
        }
        let label_since = self.label_since.unwrap_or(at);

        // An unvalidated label change keeps the previous validated label.
        let regime = match (&transition, &previous) {
            (Some(t), _) => t.to,
            (None, Some(prev)) if prev.regime != snapshot.regime => prev.regime,
            _ => snapshot.regime,
        };

        let state = RegimeState {
            regime,
            confidence,
            stability,
            strength,
            detected_at: at,
            duration_hours: (at - label_since).num_hours(),
            per_timeframe_scores: scores,
        };

        if let Some(t) = transition {
            info!("RegimeContext: {}", t.describe());
            self.last_transition = Some(t.clone());
            self.transition_history.push(t);
            if self.transition_history.len() > TRANSITION_HISTORY_CAP {
                self.transition_history.remove(0);
            }
            // Any projection computed under the old regime is stale.
            self.view_cache.clear();
        } else {
            self.last_transition = None;
        }

        self.state = Some(state.clone());
        Ok(state)
    }

    fn validate_transition(
        &self,
        new_label: &Regime,
        confidence: f64,
        at: Timestamp,
        indicators: &[String],
        previous: Option<&RegimeState>,
    ) -> Option<RegimeTransition> {
        let previous = previous?;
        if previous.regime == *new_label || *new_label == Regime::Unknown {
            return None;
        }
        if confidence < self.config.min_transition_confidence {
            debug!(
                "RegimeContext: label change to {} rejected, confidence {:.3} below {:.3}",
                new_label, confidence, self.config.min_transition_confidence
            );
            return None;
        }
        if confidence <= previous.confidence + self.config.momentum_margin {
            debug!(
                "RegimeContext: label change to {} rejected, momentum margin not met",
                new_label
            );
            return None;
        }

        let severity = if confidence >= 0.85 && previous.regime.is_opposing(new_label) {
            Severity::Critical
        } else if confidence >= 0.7 && previous.regime.is_cross_class(new_label) {
            Severity::High
        } else {
            Severity::Normal
        };

        Some(RegimeTransition {
            from: previous.regime,
            to: *new_label,
            at,
            severity,
            confidence,
            trigger_indicators: indicators.to_vec(),
        })
    }

    /// State as of the last refresh.
    pub fn current_state(&self) -> Option<&RegimeState> {
        self.state.as_ref()
    }

    /// Transition produced by the latest refresh, if any. Cleared by the
    /// next refresh that produces none.
    pub fn recent_transition(&self) -> Option<&RegimeTransition> {
        self.last_transition.as_ref()
    }

    pub fn transition_history(&self) -> &[RegimeTransition] {
        &self.transition_history
    }

    /// Module-specific projection, cached by `(asset, hour)` until the TTL
    /// lapses or a transition invalidates everything.
    pub fn context_view(&mut self, asset: Option<&str>, at: Timestamp) -> Option<ContextView> {
        let state = self.state.clone()?;
        let key = (asset.map(|s| s.to_string()), rounded_hour(at));
        if let Some((cached_at, view)) = self.view_cache.get(&key) {
            if at - *cached_at < Duration::hours(self.config.context_cache_ttl_hours) {
                return Some(view.clone());
            }
        }

        let view = ContextView {
            risk_scaling: risk_scaling(&state),
            preferred_buckets: preferred_buckets(state.regime),
            state,
        };
        self.view_cache.insert(key, (at, view.clone()));
        Some(view)
    }
}

fn rounded_hour(at: Timestamp) -> i64 {
    at.timestamp() - i64::from(at.minute()) * 60 - i64::from(at.second())
}

/// Sizing multiplier by regime. Risk-off and unknown regimes scale down.
fn risk_scaling(state: &RegimeState) -> f64 {
    let base = match state.regime {
        Regime::Goldilocks => 1.0,
        Regime::Reflation => 0.9,
        Regime::Inflation => 0.6,
        Regime::Deflation => 0.5,
        Regime::Unknown => 0.3,
    };
    // Low-confidence readings pull sizing toward the floor.
    if state.confidence < 0.4 { base * 0.7 } else { base }
}

/// Buckets each regime favors, in preference order.
fn preferred_buckets(regime: Regime) -> Vec<String> {
    let names: &[&str] = match regime {
        Regime::Goldilocks => &["Growth", "Risk Assets", "Large Caps"],
        Regime::Reflation => &["Cyclicals", "Value", "SMID Caps"],
        Regime::Inflation => &["Gold", "Energy Commodities", "Industrial Commodities"],
        Regime::Deflation => &["Treasurys", "Defensives", "Low Beta"],
        Regime::Unknown => &[],
    };
    names.iter().map(|s| s.to_string()).collect()
}
