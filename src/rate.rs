//! Fiat Exchange-Rate Source
//!
//! Current or historical BTC/fiat rate lookup, consumed when pricing
//! forwarded amounts. Sats-to-BTC conversion is exact decimal
//! arithmetic; no floating point touches a monetary value.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{RouterError, RouterResult};

/// Satoshis per bitcoin.
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Convert a satoshi amount to BTC.
pub fn sats_to_btc(sats: u64) -> Decimal {
    Decimal::from(sats) / Decimal::from(SATS_PER_BTC)
}

/// A fiat price point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiatRate {
    /// Fiat price of one BTC
    pub price: Decimal,
    /// Timestamp the price refers to
    pub at: DateTime<Utc>,
}

/// Exchange-rate lookup trait
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Rate as of `at`, or the current rate when `None`.
    async fn fiat_rate(&self, at: Option<DateTime<Utc>>) -> RouterResult<FiatRate>;
}

/// In-memory rate source for testing: fixed price, optional injected
/// failures.
pub struct MockRateSource {
    price: std::sync::RwLock<Decimal>,
    fail_remaining: AtomicU32,
    fail_at: AtomicU32,
    lookups: AtomicU32,
}

impl MockRateSource {
    /// Create with a fixed BTC price.
    pub fn new(price: Decimal) -> Self {
        Self {
            price: std::sync::RwLock::new(price),
            fail_remaining: AtomicU32::new(0),
            fail_at: AtomicU32::new(0),
            lookups: AtomicU32::new(0),
        }
    }

    /// Replace the fixed price.
    pub fn set_price(&self, price: Decimal) {
        *self.price.write().expect("rate lock poisoned") = price;
    }

    /// Fail the next `n` lookups, then recover.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail the `n`th lookup overall (1-based), counting every lookup
    /// since construction. Lets a test break one specific event in the
    /// middle of a page.
    pub fn fail_at(&self, n: u32) {
        self.fail_at.store(n, Ordering::SeqCst);
    }

    /// Number of lookups performed.
    pub fn lookup_count(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateSource for MockRateSource {
    async fn fiat_rate(&self, at: Option<DateTime<Utc>>) -> RouterResult<FiatRate> {
        let lookup_no = self.lookups.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(RouterError::RateLookup(
                "mock rate source unavailable".to_string(),
            ));
        }
        if self.fail_at.load(Ordering::SeqCst) == lookup_no {
            return Err(RouterError::RateLookup(
                "mock rate source unavailable".to_string(),
            ));
        }
        Ok(FiatRate {
            price: *self.price.read().expect("rate lock poisoned"),
            at: at.unwrap_or_else(Utc::now),
        })
    }
}
