pub mod cache;
pub mod config;
pub mod csv;
pub mod dispatcher;
pub mod engine;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod store;

pub use config::{ConcurrencyControl, EngineConfig, IssuanceMode};
pub use engine::{IssuanceEngine, IssuanceService, IssueError};
pub use model::{
    Coupon, CorrelationId, CouponId, FailureReason, MemberCoupon, MemberCouponId,
    MemberCouponUseHistory, MemberId, NewCoupon, OutcomeEvent,
};
