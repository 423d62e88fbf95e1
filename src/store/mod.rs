//! Authoritative bookkeeping collaborators.
//!
//! [`CouponRepository`] is the relational store: the single source of truth for
//! issued quantities and ownership. [`MemberDirectory`] answers member existence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    Coupon, CouponId, MemberCoupon, MemberCouponId, MemberCouponUseHistory, MemberId, NewCoupon,
};

pub mod memory;

pub use memory::{MemoryCouponStore, MemoryMemberDirectory};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coupon {0} not found")]
    CouponNotFound(CouponId),

    /// The conditional increment matched zero rows.
    #[error("coupon {0} is sold out")]
    SoldOut(CouponId),

    #[error("member {member} already owns coupon {coupon}")]
    UniqueViolation { coupon: CouponId, member: MemberId },

    #[error("coupon {coupon} version is {actual}, expected {expected}")]
    VersionConflict {
        coupon: CouponId,
        expected: u64,
        actual: u64,
    },

    #[error("member {0} does not exist")]
    UnknownMember(MemberId),

    #[error("member coupon {0} not found")]
    MemberCouponNotFound(MemberCouponId),

    #[error("member coupon {id} does not belong to member {member}")]
    NotOwner { id: MemberCouponId, member: MemberId },

    #[error("member coupon {0} has already been used")]
    AlreadyUsed(MemberCouponId),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One authoritative issuance write.
#[derive(Debug, Clone, Copy)]
pub struct IssueCommand {
    pub coupon_id: CouponId,
    pub member_id: MemberId,
    /// When set, the increment also requires the coupon to still be at this version.
    pub expected_version: Option<u64>,
    pub issued_at: DateTime<Utc>,
}

#[async_trait]
pub trait CouponRepository: Send + Sync {
    async fn save_coupon(&self, coupon: NewCoupon) -> Result<Coupon, StoreError>;

    async fn find_coupon(&self, id: CouponId) -> Result<Option<Coupon>, StoreError>;

    /// Every coupon, ordered by id.
    async fn find_all_coupons(&self) -> Result<Vec<Coupon>, StoreError>;

    /// Coupons whose validity window contains `now`.
    async fn find_active_coupons(&self, now: DateTime<Utc>) -> Result<Vec<Coupon>, StoreError>;

    /// Run the issuance transaction:
    ///
    /// 1. `issued_quantity += 1 WHERE issued_quantity < total_quantity`
    ///    (zero rows: [`StoreError::SoldOut`]);
    /// 2. insert the ownership row (duplicate pair: [`StoreError::UniqueViolation`]).
    ///
    /// Either both steps commit or neither does.
    async fn issue(&self, command: IssueCommand) -> Result<MemberCoupon, StoreError>;

    async fn find_member_coupon(
        &self,
        coupon: CouponId,
        member: MemberId,
    ) -> Result<Option<MemberCoupon>, StoreError>;

    async fn find_member_coupons(&self, member: MemberId) -> Result<Vec<MemberCoupon>, StoreError>;

    /// Redeem an owned coupon and record its use history in the same transaction.
    /// Succeeds at most once per ownership row.
    async fn use_member_coupon(
        &self,
        member: MemberId,
        id: MemberCouponId,
        now: DateTime<Utc>,
    ) -> Result<MemberCoupon, StoreError>;

    async fn find_use_history(
        &self,
        member_coupon: MemberCouponId,
    ) -> Result<Option<MemberCouponUseHistory>, StoreError>;
}

#[async_trait]
pub trait MemberDirectory: Send + Sync {
    /// Fails with [`StoreError::UnknownMember`] when the member does not exist.
    async fn validate_exist_member(&self, member: MemberId) -> Result<(), StoreError>;
}
