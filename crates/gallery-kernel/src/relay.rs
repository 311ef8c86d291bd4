//! At-least-once notification relay between the object store and the derivation
//! worker, persisted in the metadata database.
//!
//! Every received message comes back as a [`Delivery`] that must be settled.
//! A nack re-enqueues the message behind whatever is already queued (so order is
//! not preserved) until `max_deliveries` attempts have been made, after which the
//! message is parked as a [`DeadLetter`]. A delivery dropped without settling is
//! treated as a nack.
//!
//! Messages outlive the process: a published message stays in the outbox until
//! acknowledged, and deliveries still in flight when the process stops are
//! handed out again by the next [`NotificationRelay::open`]. Only one relay may
//! consume a given database at a time.

use std::{
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gallery_db::{Database, OutboxRecord, OutboxState};
use serde::Serialize;
use thiserror::Error;
use tokio::{runtime::Handle, sync::Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// How long parked messages are kept before [`NotificationRelay::purge_dead_letters`]
/// may drop them.
pub const DEFAULT_DEAD_LETTER_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay is closed")]
    Closed,
    #[error("relay store failed: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayMessage {
    pub id: Uuid,
    pub body: String,
    /// 1 on first delivery, incremented on every redelivery after a nack.
    pub attempt: u32,
    pub published_at: DateTime<Utc>,
}

impl From<OutboxRecord> for RelayMessage {
    fn from(record: OutboxRecord) -> Self {
        Self {
            id: record.message_id,
            body: record.body,
            attempt: record.attempt,
            published_at: record.published_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message: RelayMessage,
    pub reason: String,
    pub parked_at: DateTime<Utc>,
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued { next_attempt: u32 },
    Parked { reason: String },
}

#[derive(Clone)]
pub struct NotificationRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    db: Database,
    wakeup: Notify,
    closed: AtomicBool,
    max_deliveries: u32,
}

impl std::fmt::Debug for NotificationRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRelay")
            .field("max_deliveries", &self.inner.max_deliveries)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl NotificationRelay {
    /// Opens the relay over `db`, releasing deliveries a previous process left
    /// unsettled so they are handed out again.
    pub async fn open(db: Database, max_deliveries: u32) -> Result<Self, RelayError> {
        let released = db.recover_claimed_outbox().await?;
        let pending = db.count_outbox(OutboxState::Pending).await?;
        if pending > 0 {
            info!(pending, released, "relay resuming undelivered messages");
        }

        Ok(Self {
            inner: Arc::new(RelayInner {
                db,
                wakeup: Notify::new(),
                closed: AtomicBool::new(false),
                max_deliveries: max_deliveries.max(1),
            }),
        })
    }

    pub fn max_deliveries(&self) -> u32 {
        self.inner.max_deliveries
    }

    pub async fn publish(&self, body: impl Into<String>) -> Result<RelayMessage, RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        let body = body.into();
        let record = self
            .inner
            .db
            .enqueue_outbox(Uuid::new_v4(), &body, 1, Utc::now())
            .await?;
        self.inner.wakeup.notify_waiters();

        let message = RelayMessage::from(record);
        debug!(message_id = %message.id, "relay message published");
        Ok(message)
    }

    /// Delivers `message` again without counting an attempt, the way an
    /// at-least-once transport occasionally duplicates a message.
    pub async fn redeliver(&self, message: RelayMessage) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.inner
            .db
            .enqueue_outbox(message.id, &message.body, message.attempt, message.published_at)
            .await?;
        self.inner.wakeup.notify_waiters();
        Ok(())
    }

    /// Waits for the next message. Returns `None` once the relay is closed and
    /// drained.
    pub async fn recv(&self) -> Result<Option<Delivery>, RelayError> {
        loop {
            let mut notified = pin!(self.inner.wakeup.notified());
            notified.as_mut().enable();

            if let Some(delivery) = self.try_recv().await? {
                return Ok(Some(delivery));
            }
            if self.is_closed() {
                return Ok(None);
            }
            notified.await;
        }
    }

    /// Claims the next pending message without waiting for one to arrive.
    pub async fn try_recv(&self) -> Result<Option<Delivery>, RelayError> {
        let Some(record) = self.inner.db.claim_outbox().await? else {
            return Ok(None);
        };
        Ok(Some(Delivery {
            relay: self.clone(),
            seq: record.seq,
            message: record.into(),
            settled: false,
        }))
    }

    /// Stops accepting new messages. Queued messages are still delivered;
    /// messages nacked after closing wait in the outbox for the next start.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wakeup.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Messages waiting for a consumer.
    pub async fn pending(&self) -> Result<u64, RelayError> {
        Ok(self.inner.db.count_outbox(OutboxState::Pending).await?)
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, RelayError> {
        let rows = self.inner.db.list_dead_outbox().await?;
        Ok(rows
            .into_iter()
            .map(|record| DeadLetter {
                reason: record.reason.clone().unwrap_or_default(),
                parked_at: record.updated_at,
                message: record.into(),
            })
            .collect())
    }

    /// Drops dead letters parked longer than `retention` ago.
    pub async fn purge_dead_letters(&self, retention: ChronoDuration) -> Result<u64, RelayError> {
        let purged = self.inner.db.purge_dead_outbox(Utc::now() - retention).await?;
        if purged > 0 {
            info!(purged, "expired dead letters purged");
        }
        Ok(purged)
    }

    async fn retry(
        &self,
        seq: i64,
        message: &RelayMessage,
        reason: String,
    ) -> Result<Settlement, RelayError> {
        if message.attempt >= self.inner.max_deliveries {
            let reason = format!("gave up after {} deliveries: {reason}", message.attempt);
            return self.park(seq, message, reason).await;
        }

        let next_attempt = message.attempt + 1;
        if self.is_closed() {
            // Left claimed; the next `open` releases it.
            self.inner
                .db
                .settle_outbox(seq, OutboxState::Claimed, next_attempt, &reason)
                .await?;
            info!(message_id = %message.id, next_attempt, %reason, "relay closed; message deferred to next start");
        } else {
            self.inner
                .db
                .settle_outbox(seq, OutboxState::Pending, next_attempt, &reason)
                .await?;
            self.inner.wakeup.notify_waiters();
            debug!(message_id = %message.id, next_attempt, %reason, "relay message requeued");
        }
        Ok(Settlement::Requeued { next_attempt })
    }

    async fn park(
        &self,
        seq: i64,
        message: &RelayMessage,
        reason: String,
    ) -> Result<Settlement, RelayError> {
        self.inner
            .db
            .settle_outbox(seq, OutboxState::Dead, message.attempt, &reason)
            .await?;
        warn!(message_id = %message.id, attempt = message.attempt, %reason, "relay message parked");
        Ok(Settlement::Parked { reason })
    }
}

/// A message handed to a consumer. Settle it with [`ack`](Self::ack),
/// [`nack`](Self::nack) or [`reject`](Self::reject). A settlement that fails
/// to reach the store leaves the message in flight until the next start.
#[derive(Debug)]
pub struct Delivery {
    relay: NotificationRelay,
    seq: i64,
    message: RelayMessage,
    settled: bool,
}

impl Delivery {
    pub fn message(&self) -> &RelayMessage {
        &self.message
    }

    pub async fn ack(mut self) -> Result<Settlement, RelayError> {
        self.settled = true;
        self.relay.inner.db.delete_outbox(self.seq).await?;
        Ok(Settlement::Acked)
    }

    /// The work may succeed later; redeliver.
    pub async fn nack(mut self, reason: impl Into<String>) -> Result<Settlement, RelayError> {
        self.settled = true;
        self.relay.retry(self.seq, &self.message, reason.into()).await
    }

    /// The work can never succeed; park immediately.
    pub async fn reject(mut self, reason: impl Into<String>) -> Result<Settlement, RelayError> {
        self.settled = true;
        self.relay.park(self.seq, &self.message, reason.into()).await
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!(message_id = %self.message.id, "delivery dropped without settlement");
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let relay = self.relay.clone();
        let seq = self.seq;
        let message = self.message.clone();
        runtime.spawn(async move {
            let reason = "delivery dropped without settlement".to_string();
            if let Err(err) = relay.retry(seq, &message, reason).await {
                warn!(message_id = %message.id, error = %err, "failed to requeue dropped delivery");
            }
        });
    }
}
