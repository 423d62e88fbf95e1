//! Cache-resident admission control.
//!
//! [`CacheOperations`] is the ledger of atomic key-value primitives shared by
//! every service instance. [`DuplicateGuard`] and [`StockAccelerator`] build the
//! fast admission check on top of it. Nothing here is authoritative: the
//! repository's conditional update and unique constraint have the final word.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::model::{CouponId, MemberId};

mod duplicate;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
mod stock;

pub use duplicate::{DEFAULT_DUPLICATE_TTL, DuplicateGuard};
pub use memory::MemoryCache;
pub use stock::{StockAccelerator, UNLIMITED_STOCK};

/// Failure of the cache store itself. Never reported as an absent key.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("value at '{key}' is not an integer")]
    NotAnInteger { key: String },

    /// The counter would leave the signed 64-bit range. The stored value is unchanged.
    #[error("counter at '{key}' would overflow")]
    Overflow { key: String },
}

/// Error from [`StockAccelerator::decrease_stock`].
#[derive(Debug, Error)]
pub enum StockError {
    #[error("coupon {0} has no stock left")]
    Exhausted(CouponId),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Atomic primitives over a shared key-value store.
///
/// Every operation is atomic with respect to concurrent callers on the same key.
/// `increment` and `decrement` treat a missing key as zero.
#[async_trait]
pub trait CacheOperations: Send + Sync {
    async fn increment(&self, key: &str, delta: i64) -> Result<i64, CacheError>;

    async fn decrement(&self, key: &str, delta: i64) -> Result<i64, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Store `value` only if `key` is absent. Returns whether the value was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, CacheError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
}

/// The duplicate guard and stock accelerator used together on the admission path.
#[derive(Clone)]
pub struct AdmissionCache {
    pub guard: DuplicateGuard,
    pub stock: StockAccelerator,
}

impl AdmissionCache {
    pub fn new(cache: Arc<dyn CacheOperations>, duplicate_ttl: Duration) -> Self {
        Self {
            guard: DuplicateGuard::new(Arc::clone(&cache), duplicate_ttl),
            stock: StockAccelerator::new(cache),
        }
    }

    /// Undo admission side effects after a later step failed.
    ///
    /// Failures are logged and swallowed: a stale mark expires with its TTL and
    /// stock drift is healed by reconciliation.
    pub async fn compensate(
        &self,
        coupon: CouponId,
        member: MemberId,
        clear_mark: bool,
        restore_stock: bool,
    ) {
        if clear_mark {
            if let Err(e) = self.guard.clear_mark(coupon, member).await {
                warn!(coupon, member, reason = %e, "failed to clear duplicate mark");
            }
        }
        if restore_stock {
            if let Err(e) = self.stock.increase_stock(coupon).await {
                warn!(coupon, member, reason = %e, "failed to restore cached stock");
            }
        }
    }
}
