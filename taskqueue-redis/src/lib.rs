//! Leased-queue backend for `taskqueue` over a Redis key-value store
//! (companion crate).
//!
//! Protocol (all keys are plain strings):
//!
//! - Enqueue: `SETNX <id> <payload>; EXPIRE <id> <tombstone>; RPUSH <queue> <id>`
//! - Consume: `BRPOPLPUSH <queue> <queue>.processing 0.2` takes the lease,
//!   then `GET <id>` fetches the payload.
//! - Ack: `LREM <queue>.processing 0 <id>`
//! - Nack with requeue: pipelined `RPUSH <queue> <id>; LREM <queue>.processing 0 <id>`
//! - Nack without requeue: `LREM <queue>.processing 0 <id>` (the payload is
//!   reclaimed when its tombstone expires)
//!
//! Ids parked on the processing list by a dead consumer are picked up by
//! the [`RedisBackend::spawn_sweeper`] task: an id still parked on two
//! consecutive sweeps is requeued while its payload survives, reclaimed
//! once the tombstone has expired. A slow-but-alive consumer can be
//! double-delivered by this; the delivery contract is at-least-once.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use taskqueue::{Backend, Channel, Delivery, TaskQueueError};

/// How long one BRPOPLPUSH may block before the consumer loop re-checks
/// its shutdown flag.
const BLOCK_SECS: f64 = 0.2;

/// Consumer stream buffer depth.
const STREAM_DEPTH: usize = 10;

fn unavailable(e: impl std::fmt::Display) -> TaskQueueError {
    TaskQueueError::Unavailable(e.to_string())
}

fn processing_list(queue: &str) -> String {
    format!("{queue}.processing")
}

/// Redis connection holder; hand out one [`RedisChannel`] per dispatch
/// loop.
pub struct RedisBackend {
    connect_string: String,
    tombstone: Duration,
    client: Option<redis::Client>,
}

impl RedisBackend {
    /// `tombstone` is the payload TTL and the sweeper period.
    pub fn new(connect: impl Into<String>, tombstone: Duration) -> Self {
        Self { connect_string: connect.into(), tombstone, client: None }
    }

    fn client(&self) -> Result<&redis::Client, TaskQueueError> {
        self.client
            .as_ref()
            .ok_or_else(|| unavailable("Redis backend is not connected"))
    }

    /// Start the orphan sweeper for one queue. Every tombstone period the
    /// processing list is inspected; an id parked there on two consecutive
    /// sweeps lost its consumer and is handed back to the queue, or
    /// reclaimed outright once its payload has expired.
    pub fn spawn_sweeper(&self, queue: &str) -> Result<JoinHandle<()>, TaskQueueError> {
        let client = self.client()?.clone();
        let queue = queue.to_string();
        let period = self.tombstone;
        Ok(tokio::spawn(sweep_loop(client, queue, period)))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn connect(&mut self) -> Result<(), TaskQueueError> {
        let client = redis::Client::open(self.connect_string.as_str()).map_err(unavailable)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        self.client = Some(client);
        Ok(())
    }

    async fn get_channel(&self) -> Result<Box<dyn Channel>, TaskQueueError> {
        let conn = self
            .client()?
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        Ok(Box::new(RedisChannel {
            client: self.client()?.clone(),
            conn,
            tombstone: self.tombstone,
            queue: None,
            stop: None,
        }))
    }

    async fn purge_queue(&self, queue: &str) -> Result<(), TaskQueueError> {
        let mut conn = self
            .client()?
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        // start > end truncates the list to nothing; missing keys are fine.
        conn.ltrim::<_, ()>(queue, 1, 0).await.map_err(unavailable)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TaskQueueError> {
        self.client = None;
        Ok(())
    }
}

/// One logical session; the consumer runs on its own connection so its
/// blocking pops cannot stall publishes or acks.
pub struct RedisChannel {
    client: redis::Client,
    conn: MultiplexedConnection,
    tombstone: Duration,
    queue: Option<String>,
    stop: Option<watch::Sender<bool>>,
}

impl RedisChannel {
    fn consumed_queue(&self) -> Result<&str, TaskQueueError> {
        self.queue
            .as_deref()
            .ok_or_else(|| unavailable("Redis channel has no active consumer"))
    }
}

#[async_trait]
impl Channel for RedisChannel {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TaskQueueError> {
        let id = format!("taskqueue-{}", uuid::Uuid::new_v4());
        let ttl = self.tombstone.as_secs().max(1) as i64;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .set_nx(&id, body)
            .ignore()
            .expire(&id, ttl)
            .ignore()
            .rpush(queue, &id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn count_messages(&self, queue: &str) -> Result<i64, TaskQueueError> {
        let mut conn = self.conn.clone();
        conn.llen(queue).await.map_err(unavailable)
    }

    async fn consume(
        &mut self,
        queue: &str,
    ) -> Result<mpsc::Receiver<Delivery>, TaskQueueError> {
        self.queue = Some(queue.to_string());
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop = Some(stop_tx);

        // Dedicated connection: BRPOPLPUSH blocks it for up to BLOCK_SECS
        // at a time.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        let queue = queue.to_string();
        let processing = processing_list(&queue);

        tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                let id: Option<String> =
                    match conn.brpoplpush(&queue, &processing, BLOCK_SECS).await {
                        Ok(id) => id,
                        Err(e) => {
                            tracing::error!(queue = %queue, error = %e, "Redis consumer failed");
                            break;
                        }
                    };
                let Some(id) = id else { continue };

                let payload: Option<Vec<u8>> = match conn.get(&id).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(queue = %queue, error = %e, "cannot fetch payload");
                        break;
                    }
                };
                match payload {
                    Some(body) => {
                        let delivery = Delivery { message_id: id, body, tag: 0 };
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Tombstone already expired; drop the dead lease.
                        tracing::warn!(queue = %queue, id = %id, "payload expired before dispatch");
                        let reclaimed: Result<i64, _> =
                            conn.lrem(&processing, 0, &id).await;
                        if let Err(e) = reclaimed {
                            tracing::error!(queue = %queue, error = %e, "cannot reclaim lease");
                            break;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TaskQueueError> {
        let processing = processing_list(self.consumed_queue()?);
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, i64>(&processing, 0, &delivery.message_id)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TaskQueueError> {
        let queue = self.consumed_queue()?.to_string();
        let processing = processing_list(&queue);
        let mut conn = self.conn.clone();
        if requeue {
            let _: () = redis::pipe()
                .rpush(&queue, &delivery.message_id)
                .ignore()
                .lrem(&processing, 0, &delivery.message_id)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
        } else {
            conn.lrem::<_, _, i64>(&processing, 0, &delivery.message_id)
                .await
                .map_err(unavailable)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TaskQueueError> {
        if let Some(stop) = self.stop.take() {
            tracing::info!("closing Redis channel");
            let _ = stop.send(true);
        }
        Ok(())
    }
}

async fn sweep_loop(client: redis::Client, queue: String, period: Duration) {
    let processing = processing_list(&queue);
    let mut parked_last_sweep: HashSet<String> = HashSet::new();

    loop {
        tokio::time::sleep(period).await;

        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "sweeper cannot reach Redis");
                continue;
            }
        };
        let parked: Vec<String> = match conn.lrange(&processing, 0, -1).await {
            Ok(parked) => parked,
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "sweeper cannot read processing list");
                continue;
            }
        };
        let parked: HashSet<String> = parked.into_iter().collect();

        for id in parked.intersection(&parked_last_sweep) {
            let payload: Option<Vec<u8>> = match conn.get(id).await {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(queue = %queue, id = %id, error = %e, "sweeper cannot fetch payload");
                    continue;
                }
            };
            let swept: Result<(), redis::RedisError> = if payload.is_some() {
                // Consumer is gone but the task is still live: hand it back.
                tracing::info!(queue = %queue, id = %id, "requeueing orphaned message");
                redis::pipe()
                    .rpush(&queue, id)
                    .ignore()
                    .lrem(&processing, 0, id)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            } else {
                tracing::info!(queue = %queue, id = %id, "reclaiming expired lease");
                conn.lrem::<_, _, i64>(&processing, 0, id).await.map(|_| ())
            };
            if let Err(e) = swept {
                tracing::warn!(queue = %queue, id = %id, error = %e, "sweep failed");
            }
        }

        parked_last_sweep = parked;
    }
}
