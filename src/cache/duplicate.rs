use std::sync::Arc;
use std::time::Duration;

use super::{CacheError, CacheOperations};
use crate::model::{CouponId, MemberId};

/// Marks kept this long unless compensation clears them first.
pub const DEFAULT_DUPLICATE_TTL: Duration = Duration::from_secs(86_400);

/// Answers "has this member already claimed this coupon" with one atomic
/// `set_if_absent`.
///
/// A mark only means the member passed admission once; the repository's unique
/// constraint is what actually prevents a second ownership row. If compensation
/// never runs (crash between admission and outcome), the mark expires after the
/// TTL rather than blocking the member forever.
#[derive(Clone)]
pub struct DuplicateGuard {
    cache: Arc<dyn CacheOperations>,
    ttl: Duration,
}

impl DuplicateGuard {
    pub fn new(cache: Arc<dyn CacheOperations>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// Mark `(coupon, member)` as claimed. Only the first caller gets `true`.
    pub async fn check_and_mark(
        &self,
        coupon: CouponId,
        member: MemberId,
    ) -> Result<bool, CacheError> {
        self.cache
            .set_if_absent(&Self::key(coupon, member), "1", self.ttl)
            .await
    }

    /// Remove the mark so a legitimate retry can pass admission again.
    pub async fn clear_mark(&self, coupon: CouponId, member: MemberId) -> Result<bool, CacheError> {
        self.cache.delete(&Self::key(coupon, member)).await
    }

    pub async fn is_already_issued(
        &self,
        coupon: CouponId,
        member: MemberId,
    ) -> Result<bool, CacheError> {
        self.cache.exists(&Self::key(coupon, member)).await
    }

    fn key(coupon: CouponId, member: MemberId) -> String {
        format!("coupon:issue:{coupon}:member:{member}")
    }
}
