use std::sync::Arc;

use tracing::debug;

use super::{CacheError, CacheOperations, StockError};
use crate::model::CouponId;

/// Counter value seeded for coupons without a total quantity.
pub const UNLIMITED_STOCK: i64 = i32::MAX as i64;

/// Cache-resident remaining stock per coupon.
///
/// A successful decrement is necessary but not sufficient for issuance: the
/// counter may be stale, and the repository's conditional update decides.
#[derive(Clone)]
pub struct StockAccelerator {
    cache: Arc<dyn CacheOperations>,
}

impl StockAccelerator {
    pub fn new(cache: Arc<dyn CacheOperations>) -> Self {
        Self { cache }
    }

    /// Take one unit. An underflow is undone before returning
    /// [`StockError::Exhausted`], so the counter never stays negative.
    pub async fn decrease_stock(&self, coupon: CouponId) -> Result<i64, StockError> {
        let key = Self::key(coupon);
        let remaining = self.cache.decrement(&key, 1).await?;
        if remaining < 0 {
            self.cache.increment(&key, 1).await?;
            debug!(coupon, "cached stock exhausted");
            return Err(StockError::Exhausted(coupon));
        }
        Ok(remaining)
    }

    /// Give back one unit taken by [`decrease_stock`](Self::decrease_stock).
    pub async fn increase_stock(&self, coupon: CouponId) -> Result<i64, CacheError> {
        self.cache.increment(&Self::key(coupon), 1).await
    }

    /// Overwrite the counter.
    pub async fn set_stock(&self, coupon: CouponId, quantity: i64) -> Result<(), CacheError> {
        self.cache
            .set(&Self::key(coupon), &quantity.to_string(), None)
            .await
    }

    /// Seed the counter at coupon creation; `None` seeds [`UNLIMITED_STOCK`].
    pub async fn initialize_stock(
        &self,
        coupon: CouponId,
        quantity: Option<u32>,
    ) -> Result<(), CacheError> {
        self.set_stock(coupon, quantity.map_or(UNLIMITED_STOCK, i64::from))
            .await
    }

    pub async fn get_stock(&self, coupon: CouponId) -> Result<Option<i64>, CacheError> {
        let key = Self::key(coupon);
        match self.cache.get(&key).await? {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| CacheError::NotAnInteger { key }),
            None => Ok(None),
        }
    }

    fn key(coupon: CouponId) -> String {
        format!("coupon:stock:{coupon}")
    }
}
