//! AMQP 0-9-1 backend for `taskqueue` (companion crate).
//!
//! Queues are declared durable and messages published persistent, so
//! tasks survive a broker restart. Consumption is server-push with manual
//! acks: `nack(requeue)` hands a message back to the broker for
//! redelivery, `nack` without requeue dead-letters it.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::mpsc;

use taskqueue::{Backend, Channel, Delivery, TaskQueueError};

/// Unacked messages the broker may push ahead of processing; also the
/// consumer stream's buffer depth.
const PREFETCH: u16 = 10;

/// Messages survive a broker restart.
const PERSISTENT: u8 = 2;

fn unavailable(e: impl std::fmt::Display) -> TaskQueueError {
    TaskQueueError::Unavailable(e.to_string())
}

/// AMQP connection holder; hand out one [`AmqpChannel`] per dispatch loop.
pub struct AmqpBackend {
    connect_string: String,
    conn: Option<Connection>,
}

impl AmqpBackend {
    pub fn new(connect: impl Into<String>) -> Self {
        Self { connect_string: connect.into(), conn: None }
    }

    fn connection(&self) -> Result<&Connection, TaskQueueError> {
        self.conn
            .as_ref()
            .ok_or_else(|| unavailable("AMQP backend is not connected"))
    }
}

#[async_trait]
impl Backend for AmqpBackend {
    async fn connect(&mut self) -> Result<(), TaskQueueError> {
        let conn = Connection::connect(&self.connect_string, ConnectionProperties::default())
            .await
            .map_err(unavailable)?;
        self.conn = Some(conn);
        Ok(())
    }

    async fn get_channel(&self) -> Result<Box<dyn Channel>, TaskQueueError> {
        let channel = self
            .connection()?
            .create_channel()
            .await
            .map_err(unavailable)?;
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn purge_queue(&self, queue: &str) -> Result<(), TaskQueueError> {
        // Throw-away channel; declaring first keeps the purge idempotent
        // for queues nobody has used yet.
        let channel = self
            .connection()?
            .create_channel()
            .await
            .map_err(unavailable)?;
        declare_durable(&channel, queue).await?;
        channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(unavailable)?;
        channel.close(200, "purge done").await.map_err(unavailable)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TaskQueueError> {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close(200, "shutting down").await {
                tracing::warn!(error = %e, "error closing AMQP connection");
            }
        }
        Ok(())
    }
}

/// One `lapin` channel; independently usable for publish and consume.
pub struct AmqpChannel {
    channel: lapin::Channel,
}

async fn declare_durable(
    channel: &lapin::Channel,
    queue: &str,
) -> Result<lapin::Queue, TaskQueueError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() },
            FieldTable::default(),
        )
        .await
        .map_err(unavailable)
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TaskQueueError> {
        declare_durable(&self.channel, queue).await?;
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into())
            .with_message_id(uuid::Uuid::new_v4().to_string().into());
        let _confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions { mandatory: true, ..BasicPublishOptions::default() },
                body,
                properties,
            )
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn count_messages(&self, queue: &str) -> Result<i64, TaskQueueError> {
        let state = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions { passive: true, ..QueueDeclareOptions::default() },
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;
        Ok(i64::from(state.message_count()))
    }

    async fn consume(
        &mut self,
        queue: &str,
    ) -> Result<mpsc::Receiver<Delivery>, TaskQueueError> {
        declare_durable(&self.channel, queue).await?;
        self.channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .map_err(unavailable)?;
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        let (tx, rx) = mpsc::channel(usize::from(PREFETCH));
        let queue_name = queue.to_string();
        tokio::spawn(async move {
            while let Some(attempt) = consumer.next().await {
                match attempt {
                    Ok(message) => {
                        let message_id = message
                            .properties
                            .message_id()
                            .as_ref()
                            .map(|id| id.as_str().to_string())
                            .unwrap_or_else(|| message.delivery_tag.to_string());
                        let delivery = Delivery {
                            message_id,
                            body: message.data,
                            tag: message.delivery_tag,
                        };
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(queue = %queue_name, error = %e, "AMQP consumer failed");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TaskQueueError> {
        self.channel
            .basic_ack(delivery.tag, BasicAckOptions::default())
            .await
            .map_err(unavailable)
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TaskQueueError> {
        self.channel
            .basic_nack(
                delivery.tag,
                BasicNackOptions { requeue, ..BasicNackOptions::default() },
            )
            .await
            .map_err(unavailable)
    }

    async fn close(&mut self) -> Result<(), TaskQueueError> {
        if self.channel.status().connected() {
            tracing::info!("closing AMQP channel");
            self.channel.close(200, "consumer done").await.map_err(unavailable)?;
        }
        Ok(())
    }
}
