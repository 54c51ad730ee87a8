//! Bucket diversification.
//!
//! Assets carry category tags (risk-on equities, defensives, commodities,
//! ...). Diversification bounds how many positions and how much allocation a
//! single bucket may take; core and regime priority targets may overflow a
//! bucket when the configuration allows it.

use crate::application::rebalancer::sizing::SizedPosition;
use crate::config::BucketConfig;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Static asset -> buckets mapping supplied by the harness. An asset may
/// belong to several buckets; its first tag is the primary one used for
/// limit accounting.
#[derive(Debug, Clone, Default)]
pub struct BucketRegistry {
    by_asset: BTreeMap<String, Vec<String>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, asset: impl Into<String>, buckets: Vec<String>) {
        self.by_asset.insert(asset.into(), buckets);
    }

    pub fn buckets_of(&self, asset: &str) -> &[String] {
        self.by_asset
            .get(asset)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn primary_bucket(&self, asset: &str) -> Option<&str> {
        self.buckets_of(asset).first().map(|s| s.as_str())
    }

    pub fn is_in_any(&self, asset: &str, buckets: &[String]) -> bool {
        self.buckets_of(asset).iter().any(|b| buckets.contains(b))
    }
}

/// Outcome of the diversification pass.
#[derive(Debug, Clone)]
pub struct DiversificationOutcome {
    pub kept: Vec<SizedPosition>,
    /// Assets dropped over bucket limits, with the freed allocation.
    pub dropped: Vec<(String, Decimal)>,
    /// Distinct primary buckets represented after enforcement.
    pub buckets_represented: usize,
    /// Set when fewer buckets are represented than the configured minimum.
    pub below_min_buckets: bool,
}

pub struct BucketEnforcer<'a> {
    config: &'a BucketConfig,
    registry: &'a BucketRegistry,
}

impl<'a> BucketEnforcer<'a> {
    pub fn new(config: &'a BucketConfig, registry: &'a BucketRegistry) -> Self {
        Self { config, registry }
    }

    /// Enforce per-bucket position counts and allocation caps. Excess
    /// positions are dropped lowest score first; core/regime targets may
    /// overflow when permitted. Over-allocated buckets shed size from their
    /// weakest members.
    pub fn enforce(&self, positions: Vec<SizedPosition>) -> DiversificationOutcome {
        if !self.config.enable {
            let buckets = self.count_buckets(&positions);
            return DiversificationOutcome {
                kept: positions,
                dropped: Vec::new(),
                buckets_represented: buckets,
                below_min_buckets: false,
            };
        }

        // Pass 1: position counts per primary bucket.
        let mut kept: Vec<SizedPosition> = Vec::new();
        let mut dropped: Vec<(String, Decimal)> = Vec::new();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();

        let mut by_score = positions;
        by_score.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.asset.cmp(&b.asset))
        });

        for position in by_score {
            let bucket = self
                .registry
                .primary_bucket(&position.asset)
                .unwrap_or("unbucketed")
                .to_string();
            let count = counts.entry(bucket.clone()).or_default();
            let overflow_allowed =
                self.config.allow_bucket_overflow && position.priority.may_overflow_bucket();
            if *count >= self.config.max_positions_per_bucket && !overflow_allowed {
                debug!(
                    "BucketEnforcer [{}]: dropped over {} position limit in '{}'",
                    position.asset, self.config.max_positions_per_bucket, bucket
                );
                dropped.push((position.asset.clone(), position.target_pct));
                continue;
            }
            *count += 1;
            kept.push(position);
        }

        // Pass 2: allocation caps per primary bucket, trimming weakest first.
        let mut allocations: BTreeMap<String, Decimal> = BTreeMap::new();
        for position in &kept {
            let bucket = self
                .registry
                .primary_bucket(&position.asset)
                .unwrap_or("unbucketed")
                .to_string();
            *allocations.entry(bucket).or_default() += position.target_pct;
        }
        for (bucket, allocated) in allocations {
            let mut excess = allocated - self.config.max_allocation_per_bucket;
            if excess <= Decimal::ZERO {
                continue;
            }
            debug!(
                "BucketEnforcer: bucket '{}' over allocation cap by {}",
                bucket, excess
            );
            // kept is sorted by descending score; walk from the weakest.
            for position in kept.iter_mut().rev() {
                if excess <= Decimal::ZERO {
                    break;
                }
                let in_bucket = self
                    .registry
                    .primary_bucket(&position.asset)
                    .unwrap_or("unbucketed")
                    == bucket;
                if !in_bucket {
                    continue;
                }
                if self.config.allow_bucket_overflow && position.priority.may_overflow_bucket() {
                    continue;
                }
                let cut = position.target_pct.min(excess);
                position.target_pct -= cut;
                excess -= cut;
            }
        }
        kept.retain(|p| {
            if p.target_pct > Decimal::ZERO {
                true
            } else {
                dropped.push((p.asset.clone(), Decimal::ZERO));
                false
            }
        });

        let buckets_represented = self.count_buckets(&kept);
        let below_min_buckets = buckets_represented < self.config.min_buckets_represented;
        if below_min_buckets {
            warn!(
                "BucketEnforcer: only {} buckets represented, minimum is {}",
                buckets_represented, self.config.min_buckets_represented
            );
        }

        DiversificationOutcome {
            kept,
            dropped,
            buckets_represented,
            below_min_buckets,
        }
    }

    fn count_buckets(&self, positions: &[SizedPosition]) -> usize {
        positions
            .iter()
            .filter_map(|p| self.registry.primary_bucket(&p.asset))
            .collect::<BTreeSet<_>>()
            .len()
    }
}
