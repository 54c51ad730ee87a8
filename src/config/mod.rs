//! Engine configuration.
//!
//! Grouped the way operators think about the engine: portfolio limits,
//! scoring weights, bucket diversification, dynamic sizing, position
//! lifecycle, and core-asset management. File parsing (YAML/JSON) belongs to
//! the harness; everything here is serde-ready and validated at
//! construction.

use crate::domain::errors::EngineError;
use crate::domain::regime::Severity;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Position sizing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    EqualWeight,
    ScoreWeighted,
    Adaptive,
}

/// Where the unallocated fraction goes after capping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualStrategy {
    SafeTopSlice,
    Proportional,
    CashBucket,
}

/// Portfolio-wide position limits and score thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    pub max_total_positions: usize,
    pub max_new_positions_per_rebalance: usize,
    pub min_score_threshold: f64,
    pub min_score_new_position: f64,
    pub max_single_position_pct: Decimal,
    pub target_total_allocation: Decimal,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            max_total_positions: 10,
            max_new_positions_per_rebalance: 3,
            min_score_threshold: 0.6,
            min_score_new_position: 0.65,
            max_single_position_pct: dec!(0.2),
            target_total_allocation: dec!(0.95),
        }
    }
}

impl PortfolioConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_total_positions == 0 || self.max_total_positions > 50 {
            errors.push(format!(
                "max_total_positions must be in 1..=50, got {}",
                self.max_total_positions
            ));
        }
        if self.max_single_position_pct < dec!(0.01) || self.max_single_position_pct > Decimal::ONE
        {
            errors.push(format!(
                "max_single_position_pct must be in [0.01, 1.0], got {}",
                self.max_single_position_pct
            ));
        }
        if self.target_total_allocation < dec!(0.5) || self.target_total_allocation > Decimal::ONE {
            errors.push(format!(
                "target_total_allocation must be in [0.5, 1.0], got {}",
                self.target_total_allocation
            ));
        }
        if !(0.0..=1.0).contains(&self.min_score_threshold) {
            errors.push("min_score_threshold must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_score_new_position) {
            errors.push("min_score_new_position must be in [0, 1]".to_string());
        }
        errors
    }
}

/// Technical vs. fundamental blend. The scorer applies the weights; the
/// engine only validates that they describe a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeightsConfig {
    pub technical_weight: f64,
    pub fundamental_weight: f64,
}

impl Default for ScoringWeightsConfig {
    fn default() -> Self {
        Self {
            technical_weight: 0.6,
            fundamental_weight: 0.4,
        }
    }
}

impl ScoringWeightsConfig {
    fn validate(&self) -> Vec<String> {
        let sum = self.technical_weight + self.fundamental_weight;
        if (sum - 1.0).abs() > 0.05 {
            vec![format!(
                "technical_weight + fundamental_weight must be 1.0 +/- 0.05, got {:.3}",
                sum
            )]
        } else {
            Vec::new()
        }
    }
}

/// Bucket diversification limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    pub enable: bool,
    pub max_positions_per_bucket: usize,
    pub max_allocation_per_bucket: Decimal,
    pub min_buckets_represented: usize,
    /// Core/regime priority targets may break a bucket limit temporarily.
    pub allow_bucket_overflow: bool,
    pub correlation_limit: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            enable: false,
            max_positions_per_bucket: 4,
            max_allocation_per_bucket: dec!(0.4),
            min_buckets_represented: 2,
            allow_bucket_overflow: false,
            correlation_limit: 0.8,
        }
    }
}

impl BucketConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.enable {
            if self.max_allocation_per_bucket < dec!(0.1) {
                errors.push("max_allocation_per_bucket should be at least 0.1".to_string());
            }
            if self.min_buckets_represented == 0 {
                errors.push("min_buckets_represented must be at least 1".to_string());
            }
            if self.max_positions_per_bucket == 0 {
                errors.push("max_positions_per_bucket must be at least 1".to_string());
            }
        }
        errors
    }
}

/// Dynamic position sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    pub enable_dynamic: bool,
    pub sizing_mode: SizingMode,
    pub min_position_size: Decimal,
    pub enable_two_stage: bool,
    pub residual_strategy: ResidualStrategy,
    pub max_residual_per_asset: Decimal,
    /// Cap on residual added to one position, as a multiple of its base size.
    pub max_residual_multiple: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            enable_dynamic: true,
            sizing_mode: SizingMode::Adaptive,
            min_position_size: dec!(0.01),
            enable_two_stage: true,
            residual_strategy: ResidualStrategy::SafeTopSlice,
            max_residual_per_asset: dec!(0.05),
            max_residual_multiple: dec!(0.5),
        }
    }
}

impl SizingConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.min_position_size <= Decimal::ZERO {
            errors.push("min_position_size must be positive".to_string());
        }
        if self.max_residual_per_asset < Decimal::ZERO {
            errors.push("max_residual_per_asset cannot be negative".to_string());
        }
        if self.max_residual_multiple < Decimal::ZERO {
            errors.push("max_residual_multiple cannot be negative".to_string());
        }
        errors
    }
}

/// Grace periods, holding periods, whipsaw protection and regime overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub enable_grace: bool,
    pub grace_period_days: i64,
    /// Daily multiplicative decay applied to a grace position, in (0, 1].
    pub decay_rate: f64,
    pub min_decay_factor: f64,

    pub min_holding_days: i64,
    pub max_holding_days: i64,

    pub enable_regime_overrides: bool,
    pub regime_override_cooldown_days: i64,
    pub regime_severity_threshold: Severity,
    /// Orchestrator-level per-asset override cooldown.
    pub override_cooldown_hours: i64,

    pub enable_whipsaw: bool,
    pub max_cycles_per_period: usize,
    pub whipsaw_protection_days: i64,
    pub min_position_duration_hours: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            enable_grace: true,
            grace_period_days: 5,
            decay_rate: 0.8,
            min_decay_factor: 0.1,
            min_holding_days: 3,
            max_holding_days: 90,
            enable_regime_overrides: true,
            regime_override_cooldown_days: 30,
            regime_severity_threshold: Severity::High,
            override_cooldown_hours: 24,
            enable_whipsaw: true,
            max_cycles_per_period: 1,
            whipsaw_protection_days: 14,
            min_position_duration_hours: 4,
        }
    }
}

impl LifecycleConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.grace_period_days < 1 {
            errors.push("grace_period_days must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.decay_rate) || self.decay_rate == 0.0 {
            errors.push("decay_rate must be in (0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.min_decay_factor) {
            errors.push("min_decay_factor must be in [0, 1]".to_string());
        }
        if self.min_holding_days >= self.max_holding_days {
            errors.push("min_holding_days must be less than max_holding_days".to_string());
        }
        if self.min_position_duration_hours < 0 {
            errors.push("min_position_duration_hours cannot be negative".to_string());
        }
        if self.enable_whipsaw && self.max_cycles_per_period == 0 {
            errors.push("max_cycles_per_period must be at least 1".to_string());
        }
        errors
    }
}

/// Core-asset designation and performance review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreAssetConfig {
    pub enable: bool,
    pub max_core_assets: usize,
    pub override_score_threshold: f64,
    pub expiry_days: i64,
    /// Relative return shortfall vs. the reference that counts as a failed
    /// performance check.
    pub underperformance_threshold: f64,
    pub underperformance_window_days: i64,
    pub extension_limit: u32,
    pub performance_check_frequency_days: i64,
    /// Benchmark series used for the shortfall comparison. `None` skips the
    /// relative check entirely.
    pub reference_asset: Option<String>,
}

impl Default for CoreAssetConfig {
    fn default() -> Self {
        Self {
            enable: false,
            max_core_assets: 3,
            override_score_threshold: 0.95,
            expiry_days: 90,
            underperformance_threshold: 0.15,
            underperformance_window_days: 30,
            extension_limit: 2,
            performance_check_frequency_days: 7,
            reference_asset: Some("SPY".to_string()),
        }
    }
}

impl CoreAssetConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.enable {
            if self.max_core_assets == 0 {
                errors.push("max_core_assets must be at least 1 when enabled".to_string());
            }
            if self.override_score_threshold < 0.8 {
                errors.push(
                    "override_score_threshold should be at least 0.8 for meaningful promotions"
                        .to_string(),
                );
            }
            if self.expiry_days < 1 {
                errors.push("expiry_days must be at least 1".to_string());
            }
        }
        errors
    }
}

/// Regime aggregation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    pub weight_1d: f64,
    pub weight_4h: f64,
    pub weight_1h: f64,
    /// Minimum confidence for a label change to count as a transition.
    pub min_transition_confidence: f64,
    /// New score must beat the old one by this margin for the transition to
    /// validate.
    pub momentum_margin: f64,
    pub context_cache_ttl_hours: i64,
    /// How many recent readings feed the stability estimate.
    pub stability_window: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            weight_1d: 0.5,
            weight_4h: 0.3,
            weight_1h: 0.2,
            min_transition_confidence: 0.5,
            momentum_margin: 0.05,
            context_cache_ttl_hours: 1,
            stability_window: 10,
        }
    }
}

impl RegimeConfig {
    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let sum = self.weight_1d + self.weight_4h + self.weight_1h;
        if sum <= 0.0 {
            errors.push("timeframe weights must sum to a positive value".to_string());
        }
        if self.stability_window == 0 {
            errors.push("stability_window must be at least 1".to_string());
        }
        errors
    }
}

/// Top-level engine configuration. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub portfolio: PortfolioConfig,
    pub scoring: ScoringWeightsConfig,
    pub bucket: BucketConfig,
    pub sizing: SizingConfig,
    pub lifecycle: LifecycleConfig,
    pub core_asset: CoreAssetConfig,
    pub regime: RegimeConfig,
    /// Per-rebalance wall-clock budget.
    pub rebalance_timeout_secs: i64,
    /// Event-log retention.
    pub event_retention_days: i64,
}

impl EngineConfig {
    /// Validate every group plus the cross-field constraints. All problems
    /// are reported at once.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut errors = Vec::new();
        errors.extend(self.portfolio.validate());
        errors.extend(self.scoring.validate());
        errors.extend(self.bucket.validate());
        errors.extend(self.sizing.validate());
        errors.extend(self.lifecycle.validate());
        errors.extend(self.core_asset.validate());
        errors.extend(self.regime.validate());

        if self.portfolio.max_new_positions_per_rebalance > self.portfolio.max_total_positions {
            errors.push(
                "max_new_positions_per_rebalance cannot exceed max_total_positions".to_string(),
            );
        }
        let reachable = self.portfolio.max_single_position_pct
            * Decimal::from(self.portfolio.max_total_positions as u64);
        if reachable < self.portfolio.target_total_allocation {
            errors.push(format!(
                "max_total_positions x max_single_position_pct = {} cannot reach target_total_allocation {}",
                reachable, self.portfolio.target_total_allocation
            ));
        }
        if self.core_asset.enable && self.bucket.allow_bucket_overflow && !self.bucket.enable {
            errors.push(
                "bucket overflow for core assets requires bucket diversification to be enabled"
                    .to_string(),
            );
        }
        if self.rebalance_timeout_secs <= 0 {
            errors.push("rebalance_timeout_secs must be positive".to_string());
        }
        if self.event_retention_days < 1 {
            errors.push("event_retention_days must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::ConfigInvalid(errors.join("; ")))
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            portfolio: PortfolioConfig::default(),
            scoring: ScoringWeightsConfig::default(),
            bucket: BucketConfig::default(),
            sizing: SizingConfig::default(),
            lifecycle: LifecycleConfig::default(),
            core_asset: CoreAssetConfig::default(),
            regime: RegimeConfig::default(),
            rebalance_timeout_secs: 30,
            event_retention_days: 365,
        }
    }
}
