//! Periodic convergence of cached stock to repository truth.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{StockAccelerator, UNLIMITED_STOCK};
use crate::store::{CouponRepository, StoreError};

/// Counts of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reconciled: usize,
    pub failed: usize,
}

/// Rewrites the cached remaining stock of every active coupon from the
/// repository, healing drift left by failed compensations or lost events.
pub struct ReconciliationScheduler {
    repository: Arc<dyn CouponRepository>,
    stock: StockAccelerator,
    interval: Duration,
}

impl ReconciliationScheduler {
    pub fn new(
        repository: Arc<dyn CouponRepository>,
        stock: StockAccelerator,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            stock,
            interval,
        }
    }

    /// One pass over the coupons active at `now`.
    ///
    /// A cache failure on one coupon is counted and the pass continues; only a
    /// failure to list coupons aborts it.
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::default();
        for coupon in self.repository.find_active_coupons(now).await? {
            let remaining = coupon.remaining().map_or(UNLIMITED_STOCK, i64::from);
            match self.stock.set_stock(coupon.id, remaining).await {
                Ok(()) => report.reconciled += 1,
                Err(e) => {
                    warn!(coupon = coupon.id, reason = %e, "failed to reconcile cached stock");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Run a pass every interval until `shutdown` flips to `true` or its sender
    /// is dropped. Coupons are seeded at creation, so the first pass waits one
    /// interval.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                match self.reconcile_once(Utc::now()).await {
                    Ok(report) if report.failed > 0 => {
                        info!(reconciled = report.reconciled, failed = report.failed, "stock reconciled with failures");
                    }
                    Ok(report) => debug!(reconciled = report.reconciled, "stock reconciled"),
                    Err(e) => warn!(reason = %e, "stock reconciliation skipped"),
                }
            }
            debug!("reconciliation stopped");
        })
    }
}
