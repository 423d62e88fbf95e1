//! Core domain types for coupon issuance.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Coupon identifier.
pub type CouponId = u64;

/// Member identifier.
pub type MemberId = u64;

/// Identifier of an issued coupon ownership row.
pub type MemberCouponId = u64;

/// Identifier of a redemption record.
pub type UseHistoryId = u64;

/// Per-attempt identifier used to match an asynchronous outcome back to its waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A coupon as stored by the authoritative repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: CouponId,
    pub title: String,
    pub discount_amount: u32,
    pub minimum_order_price: u32,
    /// `None` means the coupon can be issued without limit.
    pub total_quantity: Option<u32>,
    pub issued_quantity: u32,
    pub valid_started_at: DateTime<Utc>,
    pub valid_ended_at: DateTime<Utc>,
    /// Bumped on every authoritative write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Coupon {
    /// Whether `now` falls inside the validity window (both ends inclusive).
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_started_at <= now && now <= self.valid_ended_at
    }

    /// Units left to issue, `None` for unlimited coupons.
    pub fn remaining(&self) -> Option<u32> {
        self.total_quantity
            .map(|total| total.saturating_sub(self.issued_quantity))
    }
}

/// Input for creating a coupon; the repository assigns identity and bookkeeping fields.
#[derive(Debug, Clone)]
pub struct NewCoupon {
    pub title: String,
    pub discount_amount: u32,
    pub minimum_order_price: u32,
    pub total_quantity: Option<u32>,
    pub valid_started_at: DateTime<Utc>,
    pub valid_ended_at: DateTime<Utc>,
}

impl NewCoupon {
    /// A coupon valid from now for one year, with no minimum order price.
    pub fn new(title: impl Into<String>, discount_amount: u32, total_quantity: Option<u32>) -> Self {
        let now = Utc::now();
        Self {
            title: title.into(),
            discount_amount,
            minimum_order_price: 0,
            total_quantity,
            valid_started_at: now,
            valid_ended_at: now + Duration::days(365),
        }
    }

    pub fn valid_between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.valid_started_at = start;
        self.valid_ended_at = end;
        self
    }
}

/// Ownership of one unit of a coupon by a member. Unique on `(coupon_id, member_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCoupon {
    pub id: MemberCouponId,
    pub member_id: MemberId,
    pub coupon_id: CouponId,
    /// Set once, when the coupon is redeemed.
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl MemberCoupon {
    pub fn is_same_member(&self, member: MemberId) -> bool {
        self.member_id == member
    }

    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }
}

/// Redemption record of one ownership row. Unique on `member_coupon_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCouponUseHistory {
    pub id: UseHistoryId,
    pub member_coupon_id: MemberCouponId,
    pub member_id: MemberId,
    pub used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Issuance intent carried on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceEvent {
    pub correlation_id: CorrelationId,
    pub coupon_id: CouponId,
    pub member_id: MemberId,
    pub enqueued_at: DateTime<Utc>,
    /// The admission path already took one unit from the cached stock counter.
    pub stock_reserved: bool,
}

/// Terminal status of a processed issuance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// Why an issuance attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[error("unknown member")]
    UnknownMember,
    #[error("coupon already issued to member")]
    DuplicateIssuance,
    #[error("coupon out of stock")]
    StockExhausted,
    #[error("coupon not found")]
    CouponNotFound,
    #[error("coupon outside its validity window")]
    CouponNotActive,
    #[error("store unavailable")]
    StoreUnavailable,
}

impl FailureReason {
    /// Short machine-readable name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnknownMember => "unknown_member",
            FailureReason::DuplicateIssuance => "duplicate_issuance",
            FailureReason::StockExhausted => "stock_exhausted",
            FailureReason::CouponNotFound => "coupon_not_found",
            FailureReason::CouponNotActive => "coupon_not_active",
            FailureReason::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Data attached to an outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomePayload {
    Issued { member_coupon_id: MemberCouponId },
    Rejected { reason: FailureReason },
}

/// Result of processing one [`IssuanceEvent`], broadcast once per event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub correlation_id: CorrelationId,
    pub status: OutcomeStatus,
    pub payload: OutcomePayload,
}

impl OutcomeEvent {
    pub fn success(correlation_id: CorrelationId, member_coupon_id: MemberCouponId) -> Self {
        Self {
            correlation_id,
            status: OutcomeStatus::Success,
            payload: OutcomePayload::Issued { member_coupon_id },
        }
    }

    pub fn failure(correlation_id: CorrelationId, reason: FailureReason) -> Self {
        Self {
            correlation_id,
            status: OutcomeStatus::Failure,
            payload: OutcomePayload::Rejected { reason },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// The issued ownership id, or the rejection reason.
    pub fn into_result(self) -> Result<MemberCouponId, FailureReason> {
        match self.payload {
            OutcomePayload::Issued { member_coupon_id } => Ok(member_coupon_id),
            OutcomePayload::Rejected { reason } => Err(reason),
        }
    }
}
