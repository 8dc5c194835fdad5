//! Fee-Tier Table
//!
//! Static ordered set of volume bands, each mapped to a routing-fee
//! percentage. A band covers `min <= a < max + 1` with
//! `max = next.min - 1`: inclusive at both integral bounds, while
//! fractional amounts between `max` and the next band's `min` still
//! classify into the lower band. Every non-negative amount classifies
//! into exactly one band.
//!
//! All monetary comparisons use `rust_decimal::Decimal`; an amount
//! sitting exactly on a band boundary classifies identically on every
//! call.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{RouterError, RouterResult};

/// Parts-per-million units per percent (1% == 10_000 ppm).
pub const PPM_PER_PERCENT: u32 = 10_000;

/// A single fee-tier band: a contiguous volume range mapped to a fee
/// percentage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeTier {
    /// Lower bound of the band (inclusive), in whole fiat units
    pub min: u64,
    /// Upper bound of the band (inclusive), in whole fiat units
    pub max: u64,
    /// Routing fee percentage applied within the band
    pub fee_percent: Decimal,
}

impl FeeTier {
    /// Create a band.
    pub fn new(min: u64, max: u64, fee_percent: Decimal) -> Self {
        Self {
            min,
            max,
            fee_percent,
        }
    }

    /// Whether `amount` falls inside this band.
    ///
    /// The upper bound is `max + 1` exclusive so that fractional
    /// amounts above `max` but below the next band's `min` do not fall
    /// into a coverage gap.
    pub fn contains(&self, amount: Decimal) -> bool {
        amount >= Decimal::from(self.min) && amount < Decimal::from(self.max) + Decimal::ONE
    }

    /// The band's fee rate in ppm, for the node's fee-update API.
    ///
    /// `None` if the percentage is not representable in whole ppm;
    /// table validation rejects such bands up front.
    pub fn ppm_fee_rate(&self) -> Option<u32> {
        percent_to_ppm(self.fee_percent)
    }
}

/// Convert a fee percentage to parts-per-million.
///
/// Exact inverse of [`ppm_to_percent`] over ppm-representable values;
/// `None` when the scaled value is fractional, negative or does not
/// fit in `u32`.
pub fn percent_to_ppm(percent: Decimal) -> Option<u32> {
    let scaled = percent * Decimal::from(PPM_PER_PERCENT);
    if scaled.fract() != Decimal::ZERO {
        return None;
    }
    scaled.to_u32()
}

/// Convert a ppm fee rate back to a percentage.
pub fn ppm_to_percent(ppm: u32) -> Decimal {
    Decimal::from(ppm) / Decimal::from(PPM_PER_PERCENT)
}

/// The ordered fee-tier table. Immutable process-wide configuration,
/// validated at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeTierTable {
    tiers: Vec<FeeTier>,
}

impl Default for FeeTierTable {
    fn default() -> Self {
        // Cumulative forwarded volume in USD.
        Self {
            tiers: vec![
                FeeTier::new(0, 4_999, Decimal::new(1, 0)),
                FeeTier::new(5_000, 249_999, Decimal::new(8, 1)),
                FeeTier::new(250_000, 499_999, Decimal::new(6, 1)),
                FeeTier::new(500_000, 749_999, Decimal::new(4, 1)),
                FeeTier::new(750_000, 999_999, Decimal::new(2, 1)),
                FeeTier::new(1_000_000, u64::MAX, Decimal::new(1, 2)),
            ],
        }
    }
}

impl FeeTierTable {
    /// Build a table from explicit bands, validating coverage.
    pub fn new(tiers: Vec<FeeTier>) -> RouterResult<Self> {
        let table = Self { tiers };
        table.validate()?;
        Ok(table)
    }

    /// Validate contiguity and full coverage of `[0, u64::MAX]`.
    pub fn validate(&self) -> RouterResult<()> {
        if self.tiers.is_empty() {
            return Err(RouterError::InvalidTierTable("empty table".to_string()));
        }
        if self.tiers[0].min != 0 {
            return Err(RouterError::InvalidTierTable(format!(
                "first band starts at {}, expected 0",
                self.tiers[0].min
            )));
        }
        for pair in self.tiers.windows(2) {
            if pair[0].max.checked_add(1) != Some(pair[1].min) {
                return Err(RouterError::InvalidTierTable(format!(
                    "gap or overlap between bands ending {} and starting {}",
                    pair[0].max, pair[1].min
                )));
            }
        }
        let last = &self.tiers[self.tiers.len() - 1];
        if last.max != u64::MAX {
            return Err(RouterError::InvalidTierTable(format!(
                "last band ends at {}, expected u64::MAX",
                last.max
            )));
        }
        for tier in &self.tiers {
            if tier.fee_percent < Decimal::ZERO {
                return Err(RouterError::InvalidTierTable(format!(
                    "negative fee percent {}",
                    tier.fee_percent
                )));
            }
            if tier.ppm_fee_rate().is_none() {
                return Err(RouterError::InvalidTierTable(format!(
                    "fee percent {} not representable in whole ppm",
                    tier.fee_percent
                )));
            }
        }
        Ok(())
    }

    /// The ordered bands.
    pub fn tiers(&self) -> &[FeeTier] {
        &self.tiers
    }

    /// The lowest band; new peer groups are seeded here.
    pub fn first(&self) -> &FeeTier {
        &self.tiers[0]
    }

    /// The unique band containing `amount`.
    ///
    /// `RouterError::Classification` means a broken invariant (negative
    /// amount or malformed table), not a user error.
    pub fn classify(&self, amount: Decimal) -> RouterResult<&FeeTier> {
        self.tiers
            .iter()
            .find(|tier| tier.contains(amount))
            .ok_or_else(|| RouterError::Classification(amount.to_string()))
    }

    /// Position of `tier` in the ordered table.
    pub fn index_of(&self, tier: &FeeTier) -> Option<usize> {
        self.tiers.iter().position(|t| t == tier)
    }

    /// Smallest volume strictly greater than `amount` that classifies
    /// into the next band; `None` when `amount` is already in the last
    /// band.
    pub fn next_tier_amount(&self, amount: Decimal) -> RouterResult<Option<u64>> {
        let current = self.classify(amount)?;
        let index = self
            .index_of(current)
            .ok_or_else(|| RouterError::Classification(amount.to_string()))?;
        Ok(self.tiers.get(index + 1).map(|next| next.min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_is_valid() {
        let table = FeeTierTable::default();
        assert!(table.validate().is_ok());
        assert_eq!(table.tiers().len(), 6);
    }

    #[test]
    fn test_classify_boundaries() {
        let table = FeeTierTable::default();

        let t0 = table.classify(Decimal::ZERO).unwrap();
        assert_eq!(table.index_of(t0), Some(0));

        let t0 = table.classify(Decimal::from(4_999u64)).unwrap();
        assert_eq!(table.index_of(t0), Some(0));

        let t1 = table.classify(Decimal::from(5_000u64)).unwrap();
        assert_eq!(table.index_of(t1), Some(1));

        let t1 = table.classify(Decimal::from(249_999u64)).unwrap();
        assert_eq!(table.index_of(t1), Some(1));

        let t5 = table.classify(Decimal::from(u64::MAX)).unwrap();
        assert_eq!(table.index_of(t5), Some(5));
    }

    #[test]
    fn test_classify_fractional_amount() {
        let table = FeeTierTable::default();
        // 4999.5 sits between band 0's max and band 1's min; it stays
        // in band 0, while 5000.0 exactly moves to band 1.
        let tier = table.classify(Decimal::new(49_995, 1)).unwrap();
        assert_eq!(table.index_of(tier), Some(0));
        let tier = table.classify(Decimal::new(50_000, 1)).unwrap();
        assert_eq!(table.index_of(tier), Some(1));
    }

    #[test]
    fn test_classify_negative_fails() {
        let table = FeeTierTable::default();
        assert!(table.classify(Decimal::from(-1)).is_err());
    }

    #[test]
    fn test_same_band_is_structural_equality() {
        let table = FeeTierTable::default();
        assert_eq!(table.tiers()[0], table.tiers()[0].clone());
        assert_ne!(table.tiers()[0], table.tiers()[1]);
    }

    #[test]
    fn test_next_tier_amount() {
        let table = FeeTierTable::default();
        assert_eq!(
            table.next_tier_amount(Decimal::from(4_999u64)).unwrap(),
            Some(5_000)
        );
        assert_eq!(
            table.next_tier_amount(Decimal::from(5_000u64)).unwrap(),
            Some(250_000)
        );
        assert_eq!(
            table
                .next_tier_amount(Decimal::from(10_000_000_000u64))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_ppm_round_trip() {
        let table = FeeTierTable::default();
        for tier in table.tiers() {
            let ppm = tier.ppm_fee_rate().unwrap();
            assert_eq!(ppm_to_percent(ppm), tier.fee_percent.normalize());
            assert_eq!(percent_to_ppm(ppm_to_percent(ppm)), Some(ppm));
        }
    }

    #[test]
    fn test_ppm_conversions() {
        assert_eq!(percent_to_ppm(Decimal::new(1, 0)), Some(10_000));
        assert_eq!(ppm_to_percent(1), Decimal::new(1, 4));
        assert_eq!(
            FeeTierTable::default().tiers()[0].ppm_fee_rate(),
            Some(10_000)
        );
        // Sub-ppm percentages are rejected.
        assert_eq!(percent_to_ppm(Decimal::new(1, 5)), None);
    }

    #[test]
    fn test_table_with_gap_rejected() {
        let result = FeeTierTable::new(vec![
            FeeTier::new(0, 4_999, Decimal::new(1, 0)),
            FeeTier::new(5_001, u64::MAX, Decimal::new(8, 1)),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_table_not_starting_at_zero_rejected() {
        let result = FeeTierTable::new(vec![FeeTier::new(1, u64::MAX, Decimal::new(1, 0))]);
        assert!(result.is_err());
    }

    #[test]
    fn test_table_not_covering_max_rejected() {
        let result = FeeTierTable::new(vec![FeeTier::new(0, 1_000, Decimal::new(1, 0))]);
        assert!(result.is_err());
    }
}
