//! In-memory repository with relational semantics.
//!
//! A single lock plays the role of row locks and transactions: the conditional
//! increment, the version check and the unique `(coupon_id, member_id)` index are
//! all enforced under it, as is the unique `member_coupon_id` of the use history.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CouponRepository, IssueCommand, MemberDirectory, StoreError};
use crate::model::{
    Coupon, CouponId, MemberCoupon, MemberCouponId, MemberCouponUseHistory, MemberId, NewCoupon,
    UseHistoryId,
};

#[derive(Default)]
struct Tables {
    coupons: HashMap<CouponId, Coupon>,
    member_coupons: HashMap<MemberCouponId, MemberCoupon>,
    /// Unique index on `(coupon_id, member_id)`.
    ownership: HashMap<(CouponId, MemberId), MemberCouponId>,
    /// Keyed by `member_coupon_id`, which doubles as its unique index.
    use_history: HashMap<MemberCouponId, MemberCouponUseHistory>,
    next_coupon_id: CouponId,
    next_member_coupon_id: MemberCouponId,
    next_use_history_id: UseHistoryId,
}

/// Coupon and ownership tables. Identifiers are assigned from 1 in insertion order.
#[derive(Default)]
pub struct MemoryCouponStore {
    tables: Mutex<Tables>,
}

impl MemoryCouponStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CouponRepository for MemoryCouponStore {
    async fn save_coupon(&self, new: NewCoupon) -> Result<Coupon, StoreError> {
        let mut tables = self.tables();
        tables.next_coupon_id += 1;
        let coupon = Coupon {
            id: tables.next_coupon_id,
            title: new.title,
            discount_amount: new.discount_amount,
            minimum_order_price: new.minimum_order_price,
            total_quantity: new.total_quantity,
            issued_quantity: 0,
            valid_started_at: new.valid_started_at,
            valid_ended_at: new.valid_ended_at,
            version: 0,
            created_at: Utc::now(),
        };
        tables.coupons.insert(coupon.id, coupon.clone());
        Ok(coupon)
    }

    async fn find_coupon(&self, id: CouponId) -> Result<Option<Coupon>, StoreError> {
        Ok(self.tables().coupons.get(&id).cloned())
    }

    async fn find_all_coupons(&self) -> Result<Vec<Coupon>, StoreError> {
        let mut coupons: Vec<_> = self.tables().coupons.values().cloned().collect();
        coupons.sort_by_key(|coupon| coupon.id);
        Ok(coupons)
    }

    async fn find_active_coupons(&self, now: DateTime<Utc>) -> Result<Vec<Coupon>, StoreError> {
        let mut coupons: Vec<_> = self
            .tables()
            .coupons
            .values()
            .filter(|coupon| coupon.is_active_at(now))
            .cloned()
            .collect();
        coupons.sort_by_key(|coupon| coupon.id);
        Ok(coupons)
    }

    async fn issue(&self, command: IssueCommand) -> Result<MemberCoupon, StoreError> {
        let IssueCommand {
            coupon_id,
            member_id,
            expected_version,
            issued_at,
        } = command;

        let mut guard = self.tables();
        let tables = &mut *guard;

        let coupon = tables
            .coupons
            .get_mut(&coupon_id)
            .ok_or(StoreError::CouponNotFound(coupon_id))?;

        if let Some(expected) = expected_version {
            if coupon.version != expected {
                return Err(StoreError::VersionConflict {
                    coupon: coupon_id,
                    expected,
                    actual: coupon.version,
                });
            }
        }

        // UPDATE ... WHERE issued_quantity < total_quantity
        let has_room = coupon
            .total_quantity
            .is_none_or(|total| coupon.issued_quantity < total);
        if !has_room || coupon.issued_quantity == u32::MAX {
            return Err(StoreError::SoldOut(coupon_id));
        }
        coupon.issued_quantity += 1;
        coupon.version += 1;

        // INSERT member_coupon, rolling the increment back on a unique violation
        if tables.ownership.contains_key(&(coupon_id, member_id)) {
            coupon.issued_quantity -= 1;
            coupon.version -= 1;
            return Err(StoreError::UniqueViolation {
                coupon: coupon_id,
                member: member_id,
            });
        }

        tables.next_member_coupon_id += 1;
        let member_coupon = MemberCoupon {
            id: tables.next_member_coupon_id,
            member_id,
            coupon_id,
            used_at: None,
            created_at: issued_at,
            modified_at: issued_at,
        };
        tables
            .ownership
            .insert((coupon_id, member_id), member_coupon.id);
        tables
            .member_coupons
            .insert(member_coupon.id, member_coupon.clone());
        Ok(member_coupon)
    }

    async fn find_member_coupon(
        &self,
        coupon: CouponId,
        member: MemberId,
    ) -> Result<Option<MemberCoupon>, StoreError> {
        let tables = self.tables();
        Ok(tables
            .ownership
            .get(&(coupon, member))
            .and_then(|id| tables.member_coupons.get(id))
            .cloned())
    }

    async fn find_member_coupons(&self, member: MemberId) -> Result<Vec<MemberCoupon>, StoreError> {
        let mut owned: Vec<_> = self
            .tables()
            .member_coupons
            .values()
            .filter(|mc| mc.is_same_member(member))
            .cloned()
            .collect();
        owned.sort_by_key(|mc| mc.id);
        Ok(owned)
    }

    async fn use_member_coupon(
        &self,
        member: MemberId,
        id: MemberCouponId,
        now: DateTime<Utc>,
    ) -> Result<MemberCoupon, StoreError> {
        let mut guard = self.tables();
        let tables = &mut *guard;
        let member_coupon = tables
            .member_coupons
            .get_mut(&id)
            .ok_or(StoreError::MemberCouponNotFound(id))?;

        if !member_coupon.is_same_member(member) {
            return Err(StoreError::NotOwner { id, member });
        }
        if member_coupon.is_used() || tables.use_history.contains_key(&id) {
            return Err(StoreError::AlreadyUsed(id));
        }

        tables.next_use_history_id += 1;
        tables.use_history.insert(
            id,
            MemberCouponUseHistory {
                id: tables.next_use_history_id,
                member_coupon_id: id,
                member_id: member,
                used_at: now,
                created_at: now,
            },
        );
        member_coupon.used_at = Some(now);
        member_coupon.modified_at = now;
        Ok(member_coupon.clone())
    }

    async fn find_use_history(
        &self,
        member_coupon: MemberCouponId,
    ) -> Result<Option<MemberCouponUseHistory>, StoreError> {
        Ok(self.tables().use_history.get(&member_coupon).cloned())
    }
}

/// Set of known members.
#[derive(Default)]
pub struct MemoryMemberDirectory {
    members: Mutex<HashSet<MemberId>>,
}

impl MemoryMemberDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members(members: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            members: Mutex::new(members.into_iter().collect()),
        }
    }

    pub fn register(&self, member: MemberId) {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(member);
    }
}

#[async_trait]
impl MemberDirectory for MemoryMemberDirectory {
    async fn validate_exist_member(&self, member: MemberId) -> Result<(), StoreError> {
        let known = self
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&member);
        if known {
            Ok(())
        } else {
            Err(StoreError::UnknownMember(member))
        }
    }
}
