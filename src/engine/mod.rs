//! Coupon issuance engine.
//!
//! [`IssuanceEngine`] is the request side: it runs the admission check against
//! the cache, publishes an issuance event and lets callers await the outcome.
//! [`IssuanceService`] wires the engine to its background tasks (consumer pool,
//! result dispatcher and reconciliation) and tears them down.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{AdmissionCache, CacheOperations};
use crate::config::{EngineConfig, IssuanceMode};
use crate::dispatcher::{ResultDispatcher, WaiterRegistry};
use crate::model::{
    Coupon, CorrelationId, CouponId, MemberCoupon, MemberCouponId, MemberCouponUseHistory,
    MemberId, NewCoupon, OutcomeEvent,
};
use crate::pipeline::{
    ConsumerPool, IssuanceConsumer, IssuancePublisher, OutcomeBus, issuance_queue,
};
use crate::reconcile::ReconciliationScheduler;
use crate::store::{CouponRepository, MemberDirectory};

mod state;
pub use state::{AttemptState, WaitState};

mod error;
pub use error::IssueError;

/// Request side of coupon issuance.
pub struct IssuanceEngine {
    repository: Arc<dyn CouponRepository>,
    members: Arc<dyn MemberDirectory>,
    /// `None` in database-only mode.
    cache: Option<AdmissionCache>,
    publisher: IssuancePublisher,
    registry: WaiterRegistry,
    wait_timeout: Duration,
}

/// Public API
impl IssuanceEngine {
    pub fn new(
        repository: Arc<dyn CouponRepository>,
        members: Arc<dyn MemberDirectory>,
        cache: Option<AdmissionCache>,
        publisher: IssuancePublisher,
        registry: WaiterRegistry,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            members,
            cache,
            publisher,
            registry,
            wait_timeout,
        }
    }

    /// Persist a coupon and seed its cached stock.
    pub async fn create_coupon(&self, coupon: NewCoupon) -> Result<Coupon, IssueError> {
        let coupon = self.repository.save_coupon(coupon).await?;
        self.initialize_coupon(coupon.id, coupon.total_quantity)
            .await?;
        info!(coupon = coupon.id, total = ?coupon.total_quantity, "coupon created");
        Ok(coupon)
    }

    /// Seed the cached stock of `coupon`; `None` means unlimited.
    /// Does nothing in database-only mode.
    pub async fn initialize_coupon(
        &self,
        coupon: CouponId,
        total_quantity: Option<u32>,
    ) -> Result<(), IssueError> {
        if let Some(cache) = &self.cache {
            cache.stock.initialize_stock(coupon, total_quantity).await?;
        }
        Ok(())
    }

    /// Admit a request and publish it for the authoritative write.
    ///
    /// Admission failures are returned here and nothing is published. On success
    /// the returned id is already registered, so the outcome is kept even if it
    /// arrives before [`await_outcome`](Self::await_outcome) is called. A
    /// registration nobody awaits is dropped after the configured wait timeout.
    pub async fn request_issuance(
        &self,
        coupon: CouponId,
        member: MemberId,
    ) -> Result<CorrelationId, IssueError> {
        let result = self.admit_and_publish(coupon, member).await;
        match &result {
            Ok(correlation_id) => {
                debug!(correlation = %correlation_id, coupon, member, state = %AttemptState::Pending, "issuance published");
            }
            Err(e) => info!(coupon, member, reason = %e, "issuance refused at admission"),
        }
        result
    }

    /// Wait up to `timeout` for the outcome of a published request.
    ///
    /// [`IssueError::Timeout`] means the outcome is unknown: the event may still
    /// be processed and the coupon issued.
    pub async fn await_outcome(
        &self,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> Result<OutcomeEvent, IssueError> {
        self.registry.wait(correlation_id, timeout).await
    }

    /// Request issuance and wait for the result.
    pub async fn issue_and_wait(
        &self,
        coupon: CouponId,
        member: MemberId,
        timeout: Duration,
    ) -> Result<MemberCouponId, IssueError> {
        let correlation_id = self.request_issuance(coupon, member).await?;
        self.await_outcome(correlation_id, timeout)
            .await?
            .into_result()
            .map_err(|reason| IssueError::rejected(reason, coupon, member))
    }

    /// Redeem an issued coupon. Only its owner can, and only once.
    pub async fn use_coupon(
        &self,
        member: MemberId,
        member_coupon: MemberCouponId,
    ) -> Result<MemberCoupon, IssueError> {
        let used = self
            .repository
            .use_member_coupon(member, member_coupon, Utc::now())
            .await?;
        info!(member, member_coupon, "coupon used");
        Ok(used)
    }

    pub async fn member_coupons(&self, member: MemberId) -> Result<Vec<MemberCoupon>, IssueError> {
        Ok(self.repository.find_member_coupons(member).await?)
    }

    pub async fn use_history(
        &self,
        member_coupon: MemberCouponId,
    ) -> Result<Option<MemberCouponUseHistory>, IssueError> {
        Ok(self.repository.find_use_history(member_coupon).await?)
    }

    /// Every coupon ever created, ordered by id.
    pub async fn coupons(&self) -> Result<Vec<Coupon>, IssueError> {
        Ok(self.repository.find_all_coupons().await?)
    }

    /// Cached remaining stock, `None` without a cache or a seeded counter.
    pub async fn stock(&self, coupon: CouponId) -> Result<Option<i64>, IssueError> {
        match &self.cache {
            Some(cache) => Ok(cache.stock.get_stock(coupon).await?),
            None => Ok(None),
        }
    }

    /// Timeout configured for callers without their own.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Requests registered on this instance and not yet awaited to completion.
    pub fn pending_waiters(&self) -> usize {
        self.registry.len()
    }
}

/// Private helpers
impl IssuanceEngine {
    async fn admit_and_publish(
        &self,
        coupon: CouponId,
        member: MemberId,
    ) -> Result<CorrelationId, IssueError> {
        self.members.validate_exist_member(member).await?;
        let stock_reserved = self.admit(coupon, member).await?;

        let correlation_id = CorrelationId::new();
        self.registry.register(correlation_id);
        if let Err(e) = self
            .publisher
            .issue_coupon(coupon, member, correlation_id, stock_reserved)
            .await
        {
            self.registry.cancel(correlation_id);
            if let Some(cache) = &self.cache {
                cache.compensate(coupon, member, true, stock_reserved).await;
            }
            return Err(e.into());
        }
        Ok(correlation_id)
    }

    /// Duplicate guard then stock decrement. Returns whether a unit of cached
    /// stock was taken.
    async fn admit(&self, coupon: CouponId, member: MemberId) -> Result<bool, IssueError> {
        let Some(cache) = &self.cache else {
            return Ok(false);
        };
        if !cache.guard.check_and_mark(coupon, member).await? {
            return Err(IssueError::DuplicateIssuance { coupon, member });
        }
        if let Err(e) = cache.stock.decrease_stock(coupon).await {
            cache.compensate(coupon, member, true, false).await;
            return Err(e.into());
        }
        Ok(true)
    }
}

/// A running issuance deployment: the engine plus its background tasks.
pub struct IssuanceService {
    engine: Arc<IssuanceEngine>,
    outcomes: OutcomeBus,
    shutdown: watch::Sender<bool>,
    pool: ConsumerPool,
    dispatcher: JoinHandle<()>,
    reconciler: Option<JoinHandle<()>>,
}

impl IssuanceService {
    /// Spawn the consumer pool, the result dispatcher and, in cached mode, the
    /// reconciliation scheduler. Must be called within a tokio runtime.
    pub fn start(
        config: &EngineConfig,
        repository: Arc<dyn CouponRepository>,
        members: Arc<dyn MemberDirectory>,
        cache: Arc<dyn CacheOperations>,
    ) -> Self {
        let (publisher, receiver) = issuance_queue(config.queue_capacity);
        let outcomes = OutcomeBus::new(config.outcome_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let admission = match config.mode {
            IssuanceMode::Cached => Some(AdmissionCache::new(cache, config.duplicate_ttl)),
            IssuanceMode::DatabaseOnly => None,
        };

        let registry = WaiterRegistry::new();
        // subscribe before any consumer can publish
        let dispatcher = ResultDispatcher::new(registry.clone(), config.wait_timeout)
            .spawn(outcomes.subscribe());

        let consumer = IssuanceConsumer::new(
            Arc::clone(&repository),
            admission.clone(),
            outcomes.clone(),
            config.concurrency,
            config.max_conflict_retries,
        );
        let pool = ConsumerPool::spawn(
            consumer,
            receiver,
            config.worker_count,
            config.batch_size,
            shutdown_rx.clone(),
        );

        let reconciler = admission.as_ref().map(|admission| {
            ReconciliationScheduler::new(
                Arc::clone(&repository),
                admission.stock.clone(),
                config.reconcile_interval,
            )
            .spawn(shutdown_rx)
        });

        info!(
            mode = ?config.mode,
            workers = config.worker_count,
            concurrency = ?config.concurrency,
            "issuance service started"
        );

        let engine = Arc::new(IssuanceEngine::new(
            repository,
            members,
            admission,
            publisher,
            registry,
            config.wait_timeout,
        ));
        Self {
            engine,
            outcomes,
            shutdown,
            pool,
            dispatcher,
            reconciler,
        }
    }

    pub fn engine(&self) -> Arc<IssuanceEngine> {
        Arc::clone(&self.engine)
    }

    /// Raw JSON outcomes, as seen by the dispatcher.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<String> {
        self.outcomes.subscribe()
    }

    /// Stop accepting work, finish what is queued and stop every task.
    ///
    /// Outcomes of the drained events still reach their waiters.
    pub async fn shutdown(self) {
        let Self {
            engine: _,
            outcomes,
            shutdown,
            pool,
            dispatcher,
            reconciler,
        } = self;

        // receivers may already be gone
        let _ = shutdown.send(true);
        pool.join().await;

        // the dispatcher stops once the last outcome sender is gone
        drop(outcomes);
        if let Err(e) = dispatcher.await {
            warn!(reason = %e, "result dispatcher panicked");
        }
        if let Some(reconciler) = reconciler {
            if let Err(e) = reconciler.await {
                warn!(reason = %e, "reconciliation scheduler panicked");
            }
        }
        info!("issuance service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, StockAccelerator};
    use crate::config::ConcurrencyControl;
    use crate::model::FailureReason;
    use crate::store::{IssueCommand, MemoryCouponStore, MemoryMemberDirectory, StoreError};
    use async_trait::async_trait;
    use chrono::DateTime;
    use tokio::task::JoinSet;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        service: IssuanceService,
        engine: Arc<IssuanceEngine>,
        store: Arc<MemoryCouponStore>,
        cache: Arc<MemoryCache>,
    }

    fn config() -> EngineConfig {
        EngineConfig {
            // keep reconciliation out of the way unless a test drives it
            reconcile_interval: Duration::from_secs(3600),
            ..EngineConfig::default()
        }
    }

    fn start(config: EngineConfig, members: impl IntoIterator<Item = MemberId>) -> Harness {
        let store = Arc::new(MemoryCouponStore::new());
        start_with(config, Arc::clone(&store) as Arc<dyn CouponRepository>, store, members)
    }

    fn start_with(
        config: EngineConfig,
        repository: Arc<dyn CouponRepository>,
        store: Arc<MemoryCouponStore>,
        members: impl IntoIterator<Item = MemberId>,
    ) -> Harness {
        let cache = Arc::new(MemoryCache::new());
        let service = IssuanceService::start(
            &config,
            repository,
            Arc::new(MemoryMemberDirectory::with_members(members)),
            Arc::clone(&cache) as Arc<dyn CacheOperations>,
        );
        Harness {
            engine: service.engine(),
            service,
            store,
            cache,
        }
    }

    async fn issued(store: &MemoryCouponStore, coupon: CouponId) -> u32 {
        store
            .find_coupon(coupon)
            .await
            .unwrap()
            .unwrap()
            .issued_quantity
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn last_unit_goes_to_exactly_one_member() {
        let Harness {
            service,
            engine,
            store,
            ..
        } = start(config(), [1, 2]);
        let coupon = engine
            .create_coupon(NewCoupon::new("last unit", 1000, Some(1)))
            .await
            .unwrap()
            .id;

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.issue_and_wait(coupon, 1, WAIT).await }
        });
        let second = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.issue_and_wait(coupon, 2, WAIT).await }
        });
        let results = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(IssueError::StockExhausted(id)) if *id == coupon))
        );
        assert_eq!(issued(&store, coupon).await, 1);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_member_twice_is_refused_before_publish() {
        let Harness {
            service,
            engine,
            store,
            ..
        } = start(config(), [7]);
        let coupon = engine
            .create_coupon(NewCoupon::new("once", 1000, Some(10)))
            .await
            .unwrap()
            .id;
        let mut outcomes = service.subscribe_outcomes();

        let mut requests = JoinSet::new();
        for _ in 0..2 {
            let engine = Arc::clone(&engine);
            requests.spawn(async move { engine.request_issuance(coupon, 7).await });
        }
        let results: Vec<_> = requests.join_all().await;

        let admitted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(admitted.len(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(IssueError::DuplicateIssuance { member: 7, .. })
        )));

        let outcome = engine.await_outcome(*admitted[0], WAIT).await.unwrap();
        assert!(outcome.is_success());
        // exactly one event reached the pipeline
        let payload = outcomes.recv().await.unwrap();
        let broadcast: OutcomeEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(broadcast.correlation_id, *admitted[0]);
        assert!(outcomes.try_recv().is_err());

        assert_eq!(issued(&store, coupon).await, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn stale_cache_is_rejected_then_reconciled() {
        let Harness {
            service,
            engine,
            store,
            cache,
        } = start(config(), [1, 2]);
        let coupon = engine
            .create_coupon(NewCoupon::new("stale", 1000, Some(1)))
            .await
            .unwrap();
        engine.issue_and_wait(coupon.id, 1, WAIT).await.unwrap();

        let stock = StockAccelerator::new(Arc::clone(&cache) as Arc<dyn CacheOperations>);
        stock.set_stock(coupon.id, 5).await.unwrap();

        let result = engine.issue_and_wait(coupon.id, 2, WAIT).await;
        assert!(matches!(result, Err(IssueError::StockExhausted(_))));
        // compensation put the unit back; the cache cannot know it is stale
        assert_eq!(engine.stock(coupon.id).await.unwrap(), Some(5));
        assert_eq!(issued(&store, coupon.id).await, 1);

        let scheduler = ReconciliationScheduler::new(
            Arc::clone(&store) as Arc<dyn CouponRepository>,
            stock,
            Duration::from_secs(5),
        );
        scheduler.reconcile_once(Utc::now()).await.unwrap();
        assert_eq!(engine.stock(coupon.id).await.unwrap(), Some(0));
        service.shutdown().await;
    }

    /// Repository whose issuance write takes six seconds.
    struct SlowRepository {
        inner: Arc<MemoryCouponStore>,
    }

    #[async_trait]
    impl CouponRepository for SlowRepository {
        async fn save_coupon(&self, coupon: NewCoupon) -> Result<Coupon, StoreError> {
            self.inner.save_coupon(coupon).await
        }

        async fn find_coupon(&self, id: CouponId) -> Result<Option<Coupon>, StoreError> {
            self.inner.find_coupon(id).await
        }

        async fn find_all_coupons(&self) -> Result<Vec<Coupon>, StoreError> {
            self.inner.find_all_coupons().await
        }

        async fn find_active_coupons(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<Coupon>, StoreError> {
            self.inner.find_active_coupons(now).await
        }

        async fn issue(&self, command: IssueCommand) -> Result<MemberCoupon, StoreError> {
            tokio::time::sleep(Duration::from_secs(6)).await;
            self.inner.issue(command).await
        }

        async fn find_member_coupon(
            &self,
            coupon: CouponId,
            member: MemberId,
        ) -> Result<Option<MemberCoupon>, StoreError> {
            self.inner.find_member_coupon(coupon, member).await
        }

        async fn find_member_coupons(
            &self,
            member: MemberId,
        ) -> Result<Vec<MemberCoupon>, StoreError> {
            self.inner.find_member_coupons(member).await
        }

        async fn use_member_coupon(
            &self,
            member: MemberId,
            id: MemberCouponId,
            now: DateTime<Utc>,
        ) -> Result<MemberCoupon, StoreError> {
            self.inner.use_member_coupon(member, id, now).await
        }

        async fn find_use_history(
            &self,
            member_coupon: MemberCouponId,
        ) -> Result<Option<MemberCouponUseHistory>, StoreError> {
            self.inner.find_use_history(member_coupon).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_write_times_out_and_late_outcome_is_orphaned() {
        let store = Arc::new(MemoryCouponStore::new());
        let slow = Arc::new(SlowRepository {
            inner: Arc::clone(&store),
        });
        let Harness {
            service, engine, ..
        } = start_with(config(), slow, Arc::clone(&store), [1]);
        let coupon = engine
            .create_coupon(NewCoupon::new("slow", 1000, Some(3)))
            .await
            .unwrap();
        let mut outcomes = service.subscribe_outcomes();

        let result = engine.issue_and_wait(coupon.id, 1, WAIT).await;
        assert!(matches!(result, Err(IssueError::Timeout(_))));
        assert_eq!(engine.pending_waiters(), 0);

        // the write still lands, nobody is waiting for it
        let payload = outcomes.recv().await.unwrap();
        let late: OutcomeEvent = serde_json::from_str(&payload).unwrap();
        assert!(late.is_success());
        assert_eq!(engine.pending_waiters(), 0);
        assert!(store.find_member_coupon(coupon.id, 1).await.unwrap().is_some());
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn burst_never_oversells() {
        let members: Vec<MemberId> = (1..=100).collect();
        let Harness {
            service,
            engine,
            store,
            ..
        } = start(config(), members.clone());
        let coupon = engine
            .create_coupon(NewCoupon::new("burst", 1000, Some(10)))
            .await
            .unwrap()
            .id;

        let mut requests = JoinSet::new();
        for member in members {
            let engine = Arc::clone(&engine);
            requests.spawn(async move {
                (member, engine.issue_and_wait(coupon, member, WAIT).await)
            });
        }
        let results = requests.join_all().await;

        let winners: Vec<_> = results
            .iter()
            .filter(|(_, result)| result.is_ok())
            .map(|(member, _)| *member)
            .collect();
        assert_eq!(winners.len(), 10);
        assert!(results.iter().all(|(_, result)| matches!(
            result,
            Ok(_) | Err(IssueError::StockExhausted(_))
        )));
        assert_eq!(issued(&store, coupon).await, 10);
        for member in winners {
            let owned = store.find_member_coupons(member).await.unwrap();
            assert_eq!(owned.len(), 1);
        }
        assert_eq!(engine.stock(coupon).await.unwrap(), Some(0));
        assert_eq!(engine.pending_waiters(), 0);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn member_retrying_in_a_loop_owns_one_coupon() {
        let Harness {
            service,
            engine,
            store,
            ..
        } = start(config(), [3]);
        let coupon = engine
            .create_coupon(NewCoupon::new("loop", 1000, None))
            .await
            .unwrap()
            .id;

        let mut requests = JoinSet::new();
        for _ in 0..20 {
            let engine = Arc::clone(&engine);
            requests.spawn(async move { engine.issue_and_wait(coupon, 3, WAIT).await });
        }
        let results = requests.join_all().await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(store.find_member_coupons(3).await.unwrap().len(), 1);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn database_only_mode_enforces_invariants_alone() {
        let config = EngineConfig {
            mode: IssuanceMode::DatabaseOnly,
            ..config()
        };
        let Harness {
            service,
            engine,
            store,
            ..
        } = start(config, 1..=30);
        let coupon = engine
            .create_coupon(NewCoupon::new("db only", 1000, Some(5)))
            .await
            .unwrap()
            .id;
        assert_eq!(engine.stock(coupon).await.unwrap(), None);

        let mut requests = JoinSet::new();
        for member in 1..=30 {
            for _ in 0..2 {
                let engine = Arc::clone(&engine);
                requests.spawn(async move { engine.issue_and_wait(coupon, member, WAIT).await });
            }
        }
        let results = requests.join_all().await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
        assert_eq!(issued(&store, coupon).await, 5);
        service.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn versioned_concurrency_never_oversells() {
        let config = EngineConfig {
            concurrency: ConcurrencyControl::Versioned,
            max_conflict_retries: 10,
            ..config()
        };
        let Harness {
            service,
            engine,
            store,
            ..
        } = start(config, 1..=40);
        let coupon = engine
            .create_coupon(NewCoupon::new("versioned", 1000, Some(8)))
            .await
            .unwrap()
            .id;

        let mut requests = JoinSet::new();
        for member in 1..=40 {
            let engine = Arc::clone(&engine);
            requests.spawn(async move { engine.issue_and_wait(coupon, member, WAIT).await });
        }
        let results = requests.join_all().await;

        let issued_now = issued(&store, coupon).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count() as u32, issued_now);
        assert!(issued_now <= 8);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_member_is_refused_without_side_effects() {
        let Harness {
            service, engine, ..
        } = start(config(), [1]);
        let coupon = engine
            .create_coupon(NewCoupon::new("members only", 1000, Some(2)))
            .await
            .unwrap();

        let result = engine.request_issuance(coupon.id, 99).await;

        assert!(matches!(result, Err(IssueError::UnknownMember(99))));
        assert_eq!(engine.stock(coupon.id).await.unwrap(), Some(2));
        assert_eq!(engine.pending_waiters(), 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_admission_clears_the_mark() {
        let Harness {
            service, engine, ..
        } = start(config(), [1]);
        let coupon = engine
            .create_coupon(NewCoupon::new("none left", 1000, Some(0)))
            .await
            .unwrap();

        for _ in 0..2 {
            // a cleared mark lets the retry reach the stock check again
            let result = engine.request_issuance(coupon.id, 1).await;
            assert!(matches!(result, Err(IssueError::StockExhausted(_))));
        }
        assert_eq!(engine.stock(coupon.id).await.unwrap(), Some(0));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn cache_outage_is_store_unavailable() {
        let Harness {
            service,
            engine,
            cache,
            ..
        } = start(config(), [1]);
        let coupon = engine
            .create_coupon(NewCoupon::new("outage", 1000, Some(2)))
            .await
            .unwrap();
        cache.set_available(false);

        let result = engine.request_issuance(coupon.id, 1).await;
        assert!(matches!(result, Err(IssueError::StoreUnavailable(_))));

        cache.set_available(true);
        assert!(engine.issue_and_wait(coupon.id, 1, WAIT).await.is_ok());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn expired_coupon_fails_and_compensates() {
        let Harness {
            service, engine, ..
        } = start(config(), [1]);
        let now = Utc::now();
        let coupon = engine
            .create_coupon(
                NewCoupon::new("expired", 1000, Some(2))
                    .valid_between(now - chrono::Duration::days(2), now - chrono::Duration::days(1)),
            )
            .await
            .unwrap();

        for _ in 0..2 {
            let result = engine.issue_and_wait(coupon.id, 1, WAIT).await;
            assert!(matches!(result, Err(IssueError::CouponNotActive(_))));
        }
        assert_eq!(engine.stock(coupon.id).await.unwrap(), Some(2));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn issued_coupon_is_used_once_by_its_owner() {
        let Harness {
            service, engine, ..
        } = start(config(), [1, 2]);
        let coupon = engine
            .create_coupon(NewCoupon::new("usable", 1000, Some(2)))
            .await
            .unwrap();
        let member_coupon = engine.issue_and_wait(coupon.id, 1, WAIT).await.unwrap();

        assert!(matches!(
            engine.use_coupon(2, member_coupon).await,
            Err(IssueError::NotOwner { member: 2, .. })
        ));
        assert_eq!(engine.use_history(member_coupon).await.unwrap(), None);

        let used = engine.use_coupon(1, member_coupon).await.unwrap();
        assert!(used.is_used());
        let history = engine.use_history(member_coupon).await.unwrap().unwrap();
        assert_eq!(history.member_id, 1);
        assert_eq!(Some(history.used_at), used.used_at);

        assert!(matches!(
            engine.use_coupon(1, member_coupon).await,
            Err(IssueError::AlreadyUsed(id)) if id == member_coupon
        ));
        assert_eq!(engine.member_coupons(1).await.unwrap().len(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn coupons_lists_every_created_coupon() {
        let Harness {
            service, engine, ..
        } = start(config(), [1]);
        assert!(engine.coupons().await.unwrap().is_empty());

        let now = Utc::now();
        let limited = engine
            .create_coupon(NewCoupon::new("limited", 1000, Some(3)))
            .await
            .unwrap();
        let expired = engine
            .create_coupon(
                NewCoupon::new("expired", 500, None).valid_between(
                    now - chrono::Duration::days(2),
                    now - chrono::Duration::days(1),
                ),
            )
            .await
            .unwrap();
        engine.issue_and_wait(limited.id, 1, WAIT).await.unwrap();

        let coupons = engine.coupons().await.unwrap();
        let ids: Vec<_> = coupons.iter().map(|coupon| coupon.id).collect();
        assert_eq!(ids, vec![limited.id, expired.id]);
        assert_eq!(coupons[0].issued_quantity, 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn outcome_can_be_awaited_after_it_arrived() {
        let Harness {
            service, engine, ..
        } = start(config(), [1]);
        let coupon = engine
            .create_coupon(NewCoupon::new("early", 1000, Some(1)))
            .await
            .unwrap();
        let mut outcomes = service.subscribe_outcomes();

        let correlation_id = engine.request_issuance(coupon.id, 1).await.unwrap();
        outcomes.recv().await.unwrap();
        // let the dispatcher deliver
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = engine.await_outcome(correlation_id, WAIT).await.unwrap();
        assert_eq!(outcome.correlation_id, correlation_id);
        assert!(outcome.is_success());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_delivers_queued_outcomes() {
        let Harness {
            service, engine, ..
        } = start(config(), 1..=10);
        let coupon = engine
            .create_coupon(NewCoupon::new("drain", 1000, Some(4)))
            .await
            .unwrap();

        let mut ids = Vec::new();
        for member in 1..=10 {
            if let Ok(id) = engine.request_issuance(coupon.id, member).await {
                ids.push(id);
            }
        }
        assert_eq!(ids.len(), 4);

        let waiters: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.await_outcome(id, WAIT).await })
            })
            .collect();
        service.shutdown().await;

        for waiter in waiters {
            assert!(waiter.await.unwrap().unwrap().is_success());
        }
    }

    #[tokio::test]
    async fn rejected_outcome_carries_reason() {
        let Harness {
            service, engine, ..
        } = start(config(), [1]);
        let coupon = engine
            .create_coupon(NewCoupon::new("gone", 1000, Some(1)))
            .await
            .unwrap();
        let stock = engine.stock(coupon.id).await.unwrap();
        assert_eq!(stock, Some(1));

        // coupon id the repository has never seen, seeded in the cache by hand
        engine.initialize_coupon(404, Some(1)).await.unwrap();
        let correlation_id = engine.request_issuance(404, 1).await.unwrap();
        let outcome = engine.await_outcome(correlation_id, WAIT).await.unwrap();

        assert_eq!(
            outcome.into_result(),
            Err(FailureReason::CouponNotFound)
        );
        assert_eq!(engine.stock(404).await.unwrap(), Some(1));
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unawaited_requests_do_not_hold_registrations() {
        let config = EngineConfig {
            wait_timeout: Duration::from_secs(5),
            ..config()
        };
        let Harness {
            service, engine, ..
        } = start(config, 1..=50);
        let coupon = engine
            .create_coupon(NewCoupon::new("fire and forget", 1000, None))
            .await
            .unwrap();
        let mut outcomes = service.subscribe_outcomes();

        for member in 1..=50 {
            engine.request_issuance(coupon.id, member).await.unwrap();
        }
        for _ in 0..50 {
            outcomes.recv().await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.pending_waiters(), 50);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(engine.pending_waiters(), 0);
        service.shutdown().await;
    }
}
