use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::{IssuanceReceiver, OutcomeBus};
use crate::cache::AdmissionCache;
use crate::config::ConcurrencyControl;
use crate::engine::{AttemptState, IssueError};
use crate::model::{IssuanceEvent, MemberCoupon, OutcomeEvent};
use crate::store::{CouponRepository, IssueCommand, StoreError};

/// Performs the authoritative write for one [`IssuanceEvent`] and reports it.
#[derive(Clone)]
pub struct IssuanceConsumer {
    repository: Arc<dyn CouponRepository>,
    /// `None` in database-only mode: nothing to compensate.
    cache: Option<AdmissionCache>,
    outcomes: OutcomeBus,
    concurrency: ConcurrencyControl,
    max_conflict_retries: u32,
}

impl IssuanceConsumer {
    pub fn new(
        repository: Arc<dyn CouponRepository>,
        cache: Option<AdmissionCache>,
        outcomes: OutcomeBus,
        concurrency: ConcurrencyControl,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            repository,
            cache,
            outcomes,
            concurrency,
            max_conflict_retries,
        }
    }

    /// Process one event to a terminal outcome, compensating on failure, and
    /// broadcast the outcome.
    pub async fn process(&self, event: IssuanceEvent) -> OutcomeEvent {
        debug!(
            correlation = %event.correlation_id,
            coupon = event.coupon_id,
            member = event.member_id,
            state = %AttemptState::Processing,
            "issuance picked up"
        );

        let outcome = match self.write(&event).await {
            Ok(member_coupon) => {
                info!(
                    correlation = %event.correlation_id,
                    coupon = event.coupon_id,
                    member = event.member_id,
                    member_coupon = member_coupon.id,
                    state = %AttemptState::Succeeded,
                    "coupon issued"
                );
                OutcomeEvent::success(event.correlation_id, member_coupon.id)
            }
            Err(e) => {
                info!(
                    correlation = %event.correlation_id,
                    coupon = event.coupon_id,
                    member = event.member_id,
                    reason = %e,
                    state = %AttemptState::Failed,
                    "issuance rejected"
                );
                self.compensate(&event, &e).await;
                OutcomeEvent::failure(event.correlation_id, e.reason())
            }
        };

        self.outcomes.publish(&outcome);
        outcome
    }

    /// Load, validate and run the issuance transaction, retrying version conflicts.
    async fn write(&self, event: &IssuanceEvent) -> Result<MemberCoupon, IssueError> {
        let mut conflicts = 0;
        loop {
            let coupon = self
                .repository
                .find_coupon(event.coupon_id)
                .await?
                .ok_or(IssueError::CouponNotFound(event.coupon_id))?;

            let now = Utc::now();
            if !coupon.is_active_at(now) {
                return Err(IssueError::CouponNotActive(coupon.id));
            }

            let command = IssueCommand {
                coupon_id: coupon.id,
                member_id: event.member_id,
                expected_version: match self.concurrency {
                    ConcurrencyControl::RowCount => None,
                    ConcurrencyControl::Versioned => Some(coupon.version),
                },
                issued_at: now,
            };

            match self.repository.issue(command).await {
                Ok(member_coupon) => return Ok(member_coupon),
                Err(StoreError::VersionConflict { .. }) if conflicts < self.max_conflict_retries => {
                    conflicts += 1;
                    debug!(
                        correlation = %event.correlation_id,
                        coupon = coupon.id,
                        attempt = conflicts,
                        "version conflict, retrying"
                    );
                }
                // exhausted retries read as sold out to the caller
                Err(StoreError::VersionConflict { coupon, .. }) => {
                    return Err(IssueError::StockExhausted(coupon));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Undo the admission side effects of a failed event.
    ///
    /// A duplicate rejected by the unique constraint keeps its guard mark: the
    /// member does own the coupon, and redelivered events land here too.
    async fn compensate(&self, event: &IssuanceEvent, error: &IssueError) {
        let Some(cache) = &self.cache else {
            return;
        };
        let clear_mark = !matches!(error, IssueError::DuplicateIssuance { .. });
        cache
            .compensate(
                event.coupon_id,
                event.member_id,
                clear_mark,
                event.stock_reserved,
            )
            .await;
    }
}

/// Worker tasks draining the issuance queue.
pub struct ConsumerPool {
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerPool {
    /// Spawn `worker_count` workers, each pulling up to `batch_size` events at a
    /// time and processing a batch concurrently.
    ///
    /// When `shutdown` flips to `true`, workers process what is already queued
    /// and exit. Dropping every publisher has the same effect.
    pub fn spawn(
        consumer: IssuanceConsumer,
        receiver: IssuanceReceiver,
        worker_count: usize,
        batch_size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let consumer = consumer.clone();
                let receiver = receiver.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(run_worker(
                    worker,
                    consumer,
                    receiver,
                    batch_size.max(1),
                    shutdown,
                ))
            })
            .collect();
        Self { workers }
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(reason = %e, "consumer worker panicked");
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    consumer: IssuanceConsumer,
    receiver: IssuanceReceiver,
    batch_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut batch = Vec::with_capacity(batch_size);
    loop {
        let stopping = *shutdown.borrow();
        if stopping {
            receiver.drain(&mut batch).await;
        } else {
            tokio::select! {
                received = receiver.recv_batch(&mut batch, batch_size) => {
                    if received == 0 {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // controller gone: treat as shutdown
                        receiver.drain(&mut batch).await;
                        process_batch(&consumer, &mut batch).await;
                        break;
                    }
                    continue;
                }
            }
        }

        debug!(worker, size = batch.len(), "processing batch");
        process_batch(&consumer, &mut batch).await;

        if stopping {
            break;
        }
    }
    debug!(worker, "consumer worker stopped");
}

async fn process_batch(consumer: &IssuanceConsumer, batch: &mut Vec<IssuanceEvent>) {
    let mut tasks = JoinSet::new();
    for event in batch.drain(..) {
        let consumer = consumer.clone();
        tasks.spawn(async move { consumer.process(event).await });
    }
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!(reason = %e, "issuance task panicked");
        }
    }
}
