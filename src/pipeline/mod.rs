//! Issuance event pipeline.
//!
//! Admitted requests become [`IssuanceEvent`]s on a bounded queue. A pool of
//! consumers performs the authoritative write and broadcasts one
//! [`OutcomeEvent`] per event on the [`OutcomeBus`].

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, warn};

use crate::model::{CorrelationId, CouponId, IssuanceEvent, MemberId, OutcomeEvent};

mod consumer;

pub use consumer::{ConsumerPool, IssuanceConsumer};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("issuance queue is closed")]
    QueueClosed,
}

/// Create the issuance queue.
pub fn issuance_queue(capacity: usize) -> (IssuancePublisher, IssuanceReceiver) {
    let (sender, receiver) = mpsc::channel(capacity);
    (
        IssuancePublisher { sender },
        IssuanceReceiver {
            inner: Arc::new(Mutex::new(receiver)),
        },
    )
}

/// Producer side of the issuance queue.
#[derive(Clone)]
pub struct IssuancePublisher {
    sender: mpsc::Sender<IssuanceEvent>,
}

impl IssuancePublisher {
    /// Enqueue an issuance intent. Waits only while the queue is full.
    pub async fn issue_coupon(
        &self,
        coupon_id: CouponId,
        member_id: MemberId,
        correlation_id: CorrelationId,
        stock_reserved: bool,
    ) -> Result<(), PublishError> {
        let event = IssuanceEvent {
            correlation_id,
            coupon_id,
            member_id,
            enqueued_at: Utc::now(),
            stock_reserved,
        };
        self.sender
            .send(event)
            .await
            .map_err(|_| PublishError::QueueClosed)
    }
}

/// Consumer side of the issuance queue, shared by every worker in the pool.
#[derive(Clone)]
pub struct IssuanceReceiver {
    inner: Arc<Mutex<mpsc::Receiver<IssuanceEvent>>>,
}

impl IssuanceReceiver {
    /// Wait for at least one event and append up to `limit` to `buffer`.
    /// Returns 0 once the queue is closed and empty.
    pub async fn recv_batch(&self, buffer: &mut Vec<IssuanceEvent>, limit: usize) -> usize {
        self.inner.lock().await.recv_many(buffer, limit).await
    }

    /// Take whatever is queued right now without waiting.
    pub async fn drain(&self, buffer: &mut Vec<IssuanceEvent>) -> usize {
        let mut receiver = self.inner.lock().await;
        let before = buffer.len();
        while let Ok(event) = receiver.try_recv() {
            buffer.push(event);
        }
        buffer.len() - before
    }
}

/// Broadcast channel carrying serialized outcome events to every dispatcher.
#[derive(Clone)]
pub struct OutcomeBus {
    sender: broadcast::Sender<String>,
}

impl OutcomeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Broadcast `outcome` as JSON. Returns the number of subscribers reached.
    pub fn publish(&self, outcome: &OutcomeEvent) -> usize {
        let payload = match serde_json::to_string(outcome) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(correlation = %outcome.correlation_id, reason = %e, "failed to encode outcome");
                return 0;
            }
        };
        match self.sender.send(payload) {
            Ok(subscribers) => subscribers,
            Err(_) => {
                debug!(correlation = %outcome.correlation_id, "no outcome subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}
