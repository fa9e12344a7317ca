//! Broker abstraction.
//!
//! A [`Backend`] owns the connection to a broker; a [`Channel`] is a
//! per-session handle for publish, consume, count and ack traffic. Two
//! families implement these traits: a classic broker (durable queue with
//! ack/nack/requeue) and a key-value store driven as a leased queue
//! (visibility via a processing list, explicit re-queue on failure). The
//! engine only ever sees the traits.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TaskQueueError;

/// A message pulled off a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Stable identity; keys the retry table.
    pub message_id: String,
    /// JSON-encoded `AsyncTask`.
    pub body: Vec<u8>,
    /// Broker-side receipt used for acking (the AMQP delivery tag; the
    /// leased-queue variant identifies by `message_id` and leaves it 0).
    pub tag: u64,
}

/// A worker's verdict on one delivery, forwarded to the broker by the
/// dispatch loop so that channel I/O stays single-threaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMessage {
    pub ack: bool,
    pub requeue: bool,
    pub delivery: Delivery,
}

impl AckMessage {
    /// Positive acknowledgement: the task is done.
    pub fn ack(delivery: Delivery) -> Self {
        Self { ack: true, requeue: false, delivery }
    }

    /// Negative acknowledgement; `requeue` controls redelivery versus
    /// discard.
    pub fn nack(delivery: Delivery, requeue: bool) -> Self {
        Self { ack: false, requeue, delivery }
    }
}

/// A durable task-queue broker.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Establish the broker connection. `Unavailable` when unreachable.
    async fn connect(&mut self) -> Result<(), TaskQueueError>;

    /// Open an independently usable session.
    async fn get_channel(&self) -> Result<Box<dyn Channel>, TaskQueueError>;

    /// Drop all pending messages. Idempotent; succeeds even if the queue
    /// is empty or does not exist.
    async fn purge_queue(&self, queue: &str) -> Result<(), TaskQueueError>;

    /// Idempotent.
    async fn close(&mut self) -> Result<(), TaskQueueError>;
}

/// A per-session handle over a [`Backend`].
#[async_trait]
pub trait Channel: Send + Sync {
    /// Enqueue a persistent message.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TaskQueueError>;

    /// Best-effort pending count; backends without a cheap observation
    /// return 0.
    async fn count_messages(&self, queue: &str) -> Result<i64, TaskQueueError>;

    /// Open a lazy stream of deliveries. The stream ends when the channel
    /// closes.
    async fn consume(&mut self, queue: &str)
        -> Result<mpsc::Receiver<Delivery>, TaskQueueError>;

    /// Confirm successful processing.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TaskQueueError>;

    /// Reject; `requeue` returns the message for redelivery, otherwise it
    /// is discarded.
    async fn nack(&mut self, delivery: &Delivery, requeue: bool)
        -> Result<(), TaskQueueError>;

    /// Idempotent; releases all pending consumer subscriptions.
    async fn close(&mut self) -> Result<(), TaskQueueError>;
}
