//! Core-asset registry.
//!
//! High-conviction assets, promoted when their score crosses a high
//! threshold, are exempt from routine closure. Designations expire on
//! schedule and are reviewed against a reference series: persistent
//! underperformance burns health, then extensions, then the designation.

use crate::domain::ports::PriceProvider;
use crate::domain::types::{RebalanceAction, Timestamp};
use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Failed performance checks a designation survives before an extension (or
/// the drop) is due.
const HEALTH_CHECKS: u8 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreDesignation {
    pub asset: String,
    pub designated_at: Timestamp,
    pub expires_at: Timestamp,
    pub extensions_used: u32,
    /// Combined score at designation time.
    pub performance_baseline: f64,
    pub health_remaining: u8,
}

/// Registry change surfaced to the session for event logging.
#[derive(Debug, Clone)]
pub enum CoreUpdate {
    Promoted(CoreDesignation),
    Expired { asset: String },
    HealthDecremented {
        asset: String,
        health_remaining: u8,
        shortfall: f64,
    },
    ExtensionConsumed { asset: String, extensions_used: u32 },
    Dropped { asset: String, reason: String },
    CheckSkipped { asset: String, reason: String },
}

pub struct CoreAssetRegistry {
    max_core_assets: usize,
    override_score_threshold: f64,
    expiry: Duration,
    underperformance_threshold: f64,
    underperformance_window: Duration,
    extension_limit: u32,
    check_frequency: Duration,
    reference_asset: Option<String>,
    designations: BTreeMap<String, CoreDesignation>,
    last_check: BTreeMap<String, Timestamp>,
}

impl CoreAssetRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        max_core_assets: usize,
        override_score_threshold: f64,
        expiry_days: i64,
        underperformance_threshold: f64,
        underperformance_window_days: i64,
        extension_limit: u32,
        performance_check_frequency_days: i64,
        reference_asset: Option<String>,
    ) -> Self {
        Self {
            max_core_assets,
            override_score_threshold,
            expiry: Duration::days(expiry_days),
            underperformance_threshold,
            underperformance_window: Duration::days(underperformance_window_days),
            extension_limit,
            check_frequency: Duration::days(performance_check_frequency_days),
            reference_asset,
            designations: BTreeMap::new(),
            last_check: BTreeMap::new(),
        }
    }

    pub fn is_core(&self, asset: &str) -> bool {
        self.designations.contains_key(asset)
    }

    pub fn designation(&self, asset: &str) -> Option<&CoreDesignation> {
        self.designations.get(asset)
    }

    pub fn core_assets(&self) -> Vec<String> {
        self.designations.keys().cloned().collect()
    }

    /// Promote on a score at or above the threshold, capacity permitting.
    /// Already-core assets and scores below the bar are ignored.
    pub fn on_score(&mut self, asset: &str, score: f64, at: Timestamp) -> Option<CoreUpdate> {
        if score < self.override_score_threshold
            || self.designations.contains_key(asset)
            || self.designations.len() >= self.max_core_assets
        {
            return None;
        }
        let designation = CoreDesignation {
            asset: asset.to_string(),
            designated_at: at,
            expires_at: at + self.expiry,
            extensions_used: 0,
            performance_baseline: score,
            health_remaining: HEALTH_CHECKS,
        };
        info!(
            "CoreAssets [{}]: promoted at score {:.3}, expires {}",
            asset, score, designation.expires_at
        );
        self.designations.insert(asset.to_string(), designation.clone());
        Some(CoreUpdate::Promoted(designation))
    }

    /// Drop designations past their scheduled expiry.
    pub fn expire(&mut self, at: Timestamp) -> Vec<CoreUpdate> {
        let expired: Vec<String> = self
            .designations
            .values()
            .filter(|d| at >= d.expires_at)
            .map(|d| d.asset.clone())
            .collect();
        expired
            .into_iter()
            .map(|asset| {
                self.designations.remove(&asset);
                self.last_check.remove(&asset);
                info!("CoreAssets [{}]: designation expired", asset);
                CoreUpdate::Expired { asset }
            })
            .collect()
    }

    /// Review each core asset's trailing return against the reference. A
    /// failed price fetch skips that asset's check with a warning; it does
    /// not fail the rebalance.
    pub async fn evaluate_performance(
        &mut self,
        at: Timestamp,
        prices: &Arc<dyn PriceProvider>,
    ) -> Vec<CoreUpdate> {
        let mut updates = Vec::new();
        let due: Vec<String> = self
            .designations
            .keys()
            .filter(|asset| {
                self.last_check
                    .get(*asset)
                    .map(|last| at - *last >= self.check_frequency)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        for asset in due {
            let reference = match self.reference_asset.clone() {
                Some(reference) => reference,
                None => continue,
            };
            self.last_check.insert(asset.clone(), at);

            let from = at - self.underperformance_window;
            let asset_return = match trailing_return(prices, &asset, from, at).await {
                Ok(r) => r,
                Err(reason) => {
                    warn!("CoreAssets [{}]: performance check skipped: {}", asset, reason);
                    updates.push(CoreUpdate::CheckSkipped { asset, reason });
                    continue;
                }
            };
            let reference_return = match trailing_return(prices, &reference, from, at).await {
                Ok(r) => r,
                Err(reason) => {
                    warn!("CoreAssets [{}]: performance check skipped: {}", asset, reason);
                    updates.push(CoreUpdate::CheckSkipped { asset, reason });
                    continue;
                }
            };

            let shortfall = reference_return - asset_return;
            if shortfall < self.underperformance_threshold {
                continue;
            }

            let designation = match self.designations.get_mut(&asset) {
                Some(d) => d,
                None => continue,
            };
            designation.health_remaining = designation.health_remaining.saturating_sub(1);
            info!(
                "CoreAssets [{}]: underperformed reference by {:.3}, health {}",
                asset, shortfall, designation.health_remaining
            );
            updates.push(CoreUpdate::HealthDecremented {
                asset: asset.clone(),
                health_remaining: designation.health_remaining,
                shortfall,
            });

            if designation.health_remaining == 0 {
                if designation.extensions_used < self.extension_limit {
                    designation.extensions_used += 1;
                    designation.health_remaining = HEALTH_CHECKS;
                    info!(
                        "CoreAssets [{}]: extension {} consumed",
                        asset, designation.extensions_used
                    );
                    updates.push(CoreUpdate::ExtensionConsumed {
                        asset: asset.clone(),
                        extensions_used: designation.extensions_used,
                    });
                } else {
                    self.designations.remove(&asset);
                    self.last_check.remove(&asset);
                    info!("CoreAssets [{}]: designation dropped after exhausting extensions", asset);
                    updates.push(CoreUpdate::Dropped {
                        asset,
                        reason: "health exhausted with no extensions left".to_string(),
                    });
                }
            }
        }
        updates
    }

    /// Core immunity: close and decrease are denied; open and increase pass
    /// at this layer.
    pub fn blocks_action(&self, asset: &str, action: RebalanceAction) -> bool {
        self.is_core(asset)
            && matches!(action, RebalanceAction::Close | RebalanceAction::Decrease)
    }

    /// Snapshot for checkpointing.
    pub fn snapshot(&self) -> Vec<CoreDesignation> {
        self.designations.values().cloned().collect()
    }
}

/// Simple first-to-last return over the window.
async fn trailing_return(
    prices: &Arc<dyn PriceProvider>,
    asset: &str,
    from: Timestamp,
    to: Timestamp,
) -> Result<f64, String> {
    let series = prices
        .closes(asset, from, to)
        .await
        .map_err(|e| format!("price fetch failed for {}: {}", asset, e))?;
    let first = series.first().ok_or_else(|| format!("empty series for {}", asset))?;
    let last = series.last().ok_or_else(|| format!("empty series for {}", asset))?;
    if first.close <= Decimal::ZERO {
        return Err(format!("non-positive base price for {}", asset));
    }
    let ratio = (last.close / first.close)
        .to_f64()
        .ok_or_else(|| format!("return overflow for {}", asset))?;
    Ok(ratio - 1.0)
}
