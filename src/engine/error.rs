//! Error types for coupon issuance.

use thiserror::Error;

use crate::cache::{CacheError, StockError};
use crate::model::{CorrelationId, CouponId, FailureReason, MemberCouponId, MemberId};
use crate::pipeline::PublishError;
use crate::store::StoreError;

/// Top-level error returned by [`IssuanceEngine`](super::IssuanceEngine).
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("member {0} does not exist")]
    UnknownMember(MemberId),

    /// Do not retry: the member already holds, or is being issued, this coupon.
    #[error("member {member} already claimed coupon {coupon}")]
    DuplicateIssuance { coupon: CouponId, member: MemberId },

    /// Do not retry: no units left.
    #[error("coupon {0} is out of stock")]
    StockExhausted(CouponId),

    #[error("coupon {0} was modified concurrently")]
    OptimisticConflict(CouponId),

    /// The outcome is unknown, not failed. Retrying is safe: admission is idempotent.
    #[error("timed out waiting for outcome {0}")]
    Timeout(CorrelationId),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("coupon {0} not found")]
    CouponNotFound(CouponId),

    #[error("coupon {0} is outside its validity window")]
    CouponNotActive(CouponId),

    #[error("outcome {0} is already being awaited")]
    AlreadyAwaited(CorrelationId),

    #[error("member coupon {0} not found")]
    MemberCouponNotFound(MemberCouponId),

    #[error("member coupon {id} does not belong to member {member}")]
    NotOwner { id: MemberCouponId, member: MemberId },

    #[error("member coupon {0} has already been used")]
    AlreadyUsed(MemberCouponId),

    /// The queue refused the event; nothing was published.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl IssueError {
    /// Rebuild the error reported by a failure outcome for `(coupon, member)`.
    pub fn rejected(reason: FailureReason, coupon: CouponId, member: MemberId) -> Self {
        match reason {
            FailureReason::UnknownMember => IssueError::UnknownMember(member),
            FailureReason::DuplicateIssuance => IssueError::DuplicateIssuance { coupon, member },
            FailureReason::StockExhausted => IssueError::StockExhausted(coupon),
            FailureReason::CouponNotFound => IssueError::CouponNotFound(coupon),
            FailureReason::CouponNotActive => IssueError::CouponNotActive(coupon),
            FailureReason::StoreUnavailable => {
                IssueError::StoreUnavailable("issuance failed in the pipeline".to_string())
            }
        }
    }

    /// How this error is reported in a failure [`OutcomeEvent`](crate::model::OutcomeEvent).
    pub fn reason(&self) -> FailureReason {
        match self {
            IssueError::UnknownMember(_) => FailureReason::UnknownMember,
            IssueError::DuplicateIssuance { .. } => FailureReason::DuplicateIssuance,
            IssueError::StockExhausted(_) | IssueError::OptimisticConflict(_) => {
                FailureReason::StockExhausted
            }
            IssueError::CouponNotFound(_) => FailureReason::CouponNotFound,
            IssueError::CouponNotActive(_) => FailureReason::CouponNotActive,
            IssueError::Timeout(_)
            | IssueError::StoreUnavailable(_)
            | IssueError::Publish(_)
            | IssueError::AlreadyAwaited(_)
            | IssueError::MemberCouponNotFound(_)
            | IssueError::NotOwner { .. }
            | IssueError::AlreadyUsed(_) => FailureReason::StoreUnavailable,
        }
    }
}

impl From<CacheError> for IssueError {
    fn from(e: CacheError) -> Self {
        IssueError::StoreUnavailable(e.to_string())
    }
}

impl From<StockError> for IssueError {
    fn from(e: StockError) -> Self {
        match e {
            StockError::Exhausted(coupon) => IssueError::StockExhausted(coupon),
            StockError::Cache(e) => e.into(),
        }
    }
}

impl From<StoreError> for IssueError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CouponNotFound(coupon) => IssueError::CouponNotFound(coupon),
            StoreError::SoldOut(coupon) => IssueError::StockExhausted(coupon),
            StoreError::UniqueViolation { coupon, member } => {
                IssueError::DuplicateIssuance { coupon, member }
            }
            StoreError::VersionConflict { coupon, .. } => IssueError::OptimisticConflict(coupon),
            StoreError::UnknownMember(member) => IssueError::UnknownMember(member),
            StoreError::MemberCouponNotFound(id) => IssueError::MemberCouponNotFound(id),
            StoreError::NotOwner { id, member } => IssueError::NotOwner { id, member },
            StoreError::AlreadyUsed(id) => IssueError::AlreadyUsed(id),
            StoreError::Unavailable(message) => IssueError::StoreUnavailable(message),
        }
    }
}
