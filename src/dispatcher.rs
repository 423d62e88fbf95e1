//! Correlation-based result dispatch.
//!
//! One [`ResultDispatcher`] task per process consumes the outcome broadcast and
//! hands each outcome to the waiter registered under its correlation id in the
//! [`WaiterRegistry`]. Dispatch and registration are both O(1), so the cost of a
//! message does not grow with the number of concurrent waiters.
//!
//! Waiters are process-local: an outcome can only reach a caller through the
//! instance that registered it. If the caller moves between publish and await,
//! its wait times out even though the issuance may have succeeded.
//!
//! A registration nobody awaits lives at most one expiry period: the
//! dispatcher sweeps such slots on a timer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::engine::{IssueError, WaitState};
use crate::model::{CorrelationId, OutcomeEvent};

/// A single-resolution promise, split so the outcome can be delivered before
/// anyone starts awaiting it.
struct Slot {
    sender: Option<oneshot::Sender<OutcomeEvent>>,
    /// Taken by the waiter; `Some` means nobody is waiting yet.
    receiver: Option<oneshot::Receiver<OutcomeEvent>>,
    registered_at: Instant,
}

impl Slot {
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            sender: Some(sender),
            receiver: Some(receiver),
            registered_at: Instant::now(),
        }
    }

    fn is_unclaimed_since(&self, deadline: Instant) -> bool {
        self.receiver.is_some() && self.registered_at <= deadline
    }
}

/// Pending waiters of this process, keyed by correlation id.
///
/// Constructed once and shared (it is a cheap handle) by the request path and
/// the dispatcher.
#[derive(Clone, Default)]
pub struct WaiterRegistry {
    slots: Arc<Mutex<HashMap<CorrelationId, Slot>>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `id` before its event is published, so an outcome
    /// that arrives before [`wait`](Self::wait) is kept. Returns `false` if
    /// `id` was already registered.
    pub fn register(&self, id: CorrelationId) -> bool {
        let mut slots = self.slots();
        if slots.contains_key(&id) {
            return false;
        }
        slots.insert(id, Slot::new());
        true
    }

    /// Drop a registration nobody will wait for.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        self.slots().remove(&id).is_some()
    }

    /// Deliver `outcome` to its waiter, if one is registered here.
    pub fn resolve(&self, outcome: OutcomeEvent) -> WaitState {
        let sender = self
            .slots()
            .get_mut(&outcome.correlation_id)
            .and_then(|slot| slot.sender.take());
        match sender {
            Some(sender) => match sender.send(outcome) {
                Ok(()) => WaitState::Resolved,
                Err(_) => WaitState::Orphaned,
            },
            None => WaitState::Orphaned,
        }
    }

    /// Drop registrations older than `max_age` that nobody is waiting on,
    /// resolved or not. Returns how many were dropped.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let Some(deadline) = Instant::now().checked_sub(max_age) else {
            return 0;
        };
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| !slot.is_unclaimed_since(deadline));
        before - slots.len()
    }

    /// Wait for the outcome of `id` without blocking a thread.
    ///
    /// Registers `id` if needed. The registration is removed however the wait
    /// ends: resolution, timeout, or the waiting future being dropped.
    pub async fn wait(
        &self,
        id: CorrelationId,
        timeout: Duration,
    ) -> Result<OutcomeEvent, IssueError> {
        let receiver = self
            .slots()
            .entry(id)
            .or_insert_with(Slot::new)
            .receiver
            .take()
            .ok_or(IssueError::AlreadyAwaited(id))?;
        let _registration = Registration { registry: self, id };
        debug!(correlation = %id, state = %WaitState::Waiting, "waiting for outcome");

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => {
                debug!(correlation = %id, state = %WaitState::Resolved, "outcome received");
                Ok(outcome)
            }
            // sender gone without an outcome: as ambiguous as a timeout
            Ok(Err(_)) | Err(_) => {
                debug!(correlation = %id, state = %WaitState::TimedOut, "gave up waiting");
                Err(IssueError::Timeout(id))
            }
        }
    }

    /// Number of registered waiters.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<CorrelationId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a registration when the wait ends.
struct Registration<'a> {
    registry: &'a WaiterRegistry,
    id: CorrelationId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.cancel(self.id);
    }
}

/// Demultiplexes the outcome broadcast onto the [`WaiterRegistry`].
pub struct ResultDispatcher {
    registry: WaiterRegistry,
    /// Age after which an unawaited registration is swept.
    expiry: Duration,
}

impl ResultDispatcher {
    pub fn new(registry: WaiterRegistry, expiry: Duration) -> Self {
        Self {
            registry,
            expiry: expiry.max(Duration::from_millis(1)),
        }
    }

    /// Run on its own task until the broadcast channel closes.
    pub fn spawn(self, outcomes: broadcast::Receiver<String>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(BroadcastStream::new(outcomes)).await })
    }

    /// Dispatch every message of `stream` and sweep expired registrations
    /// until the stream ends. Lagging skips messages; their waiters will time
    /// out.
    pub async fn run(
        &self,
        mut stream: impl Stream<Item = Result<String, BroadcastStreamRecvError>> + Unpin,
    ) {
        let mut sweep = tokio::time::interval_at(Instant::now() + self.expiry, self.expiry);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(payload)) => {
                        self.dispatch(&payload);
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(skipped, "outcome stream lagged, waiters will time out");
                    }
                    None => break,
                },
                _ = sweep.tick() => {
                    let expired = self.registry.sweep(self.expiry);
                    if expired > 0 {
                        debug!(expired, state = %WaitState::Orphaned, "dropped unawaited registrations");
                    }
                }
            }
        }
        debug!("outcome stream closed");
    }

    /// Decode one broadcast message and resolve its waiter.
    /// Returns `None` if the message is not an outcome.
    pub fn dispatch(&self, payload: &str) -> Option<WaitState> {
        let outcome: OutcomeEvent = match serde_json::from_str(payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(reason = %e, "discarding malformed outcome");
                return None;
            }
        };
        let correlation_id = outcome.correlation_id;
        let state = self.registry.resolve(outcome);
        debug!(correlation = %correlation_id, state = %state, "outcome dispatched");
        Some(state)
    }
}
