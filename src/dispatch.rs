//! The per-queue dispatch engine.
//!
//! One loop per configured queue: pull deliveries off the channel, pace
//! them through the rate gate, fan out to a bounded pool of workers,
//! deliver each task as an HTTP POST, and feed the ack/nack verdicts back
//! to the broker.
//!
//! Invariants:
//! - At most `concurrency` workers are in flight per queue.
//! - Successive worker dispatches are at least a fill rate apart.
//! - Channel I/O stays on the loop's task; workers only emit verdicts.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::{AckMessage, Channel, Delivery};
use crate::config::QueueConfig;
use crate::error::TaskQueueError;
use crate::rate::RateGate;
use crate::retry::{RetryData, RetryTable};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::task::AsyncTask;
use crate::telemetry::{DispatchEvent, EventSink, NoopSink};

/// Webhook endpoints get a long leash before an attempt is written off.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Pause before requeueing a not-yet-due task, so a far-future ETA does
/// not spin the queue at broker speed.
const DEFER_PAUSE: Duration = Duration::from_millis(100);

/// Drives one queue until its consumer stream ends or the broker dies.
pub struct DispatchLoop {
    config: Arc<QueueConfig>,
    channel: Box<dyn Channel>,
    gate: RateGate,
    retries: RetryTable,
    sink: Arc<dyn EventSink>,
    sleeper: Arc<dyn Sleeper>,
}

impl DispatchLoop {
    pub fn new(config: QueueConfig, channel: Box<dyn Channel>) -> Self {
        let gate = RateGate::new(&config.rate_details);
        Self {
            config: Arc::new(config),
            channel,
            gate,
            retries: RetryTable::new(),
            sink: Arc::new(NoopSink),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Install a telemetry sink shared with other loops.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replace the sleeper used for pacing and deferral pauses.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.gate = RateGate::with_sleeper(&self.config.rate_details, sleeper.clone());
        self.sleeper = sleeper;
        self
    }

    /// Handle to this loop's retry table (cheap clone).
    pub fn retry_table(&self) -> RetryTable {
        self.retries.clone()
    }

    /// Run to completion. Returns `Ok(())` when the consumer stream ends;
    /// `Unavailable` when forwarding a verdict to the broker fails.
    pub async fn run(mut self) -> Result<(), TaskQueueError> {
        let queue = self.config.name.clone();
        let mut deliveries = self.channel.consume(&queue).await?;
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<AckMessage>();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<TaskQueueError>();

        tracing::info!(
            queue = %queue,
            concurrency = self.config.concurrency,
            fill_rate_ms = self.config.rate_details.fill_rate_millis,
            "dispatch loop started"
        );

        let outcome = loop {
            tokio::select! {
                maybe = deliveries.recv() => {
                    let Some(delivery) = maybe else { break Ok(()) };
                    // Backpressure: no new delivery is admitted while
                    // `concurrency` workers are still in flight.
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break Ok(());
                    };
                    self.gate.wait().await;
                    self.spawn_worker(delivery, permit, ack_tx.clone(), err_tx.clone());
                }
                Some(verdict) = ack_rx.recv() => {
                    if let Err(e) = self.forward(verdict).await {
                        break Err(e);
                    }
                }
                Some(e) = err_rx.recv() => {
                    tracing::warn!(queue = %queue, error = %e, "task error");
                }
            }
        };

        match outcome {
            Ok(()) => {
                // Forward verdicts that already arrived; verdicts from
                // workers still in flight are lost with the channel and
                // the broker redelivers (at-least-once).
                while let Ok(verdict) = ack_rx.try_recv() {
                    if let Err(e) = self.forward(verdict).await {
                        tracing::warn!(queue = %queue, error = %e, "lost verdicts at shutdown");
                        break;
                    }
                }
                self.channel.close().await?;
                tracing::info!(queue = %queue, "dispatch loop finished");
                Ok(())
            }
            Err(e) => {
                tracing::error!(queue = %queue, error = %e, "dispatch loop aborting");
                let _ = self.channel.close().await;
                Err(e)
            }
        }
    }

    async fn forward(&mut self, verdict: AckMessage) -> Result<(), TaskQueueError> {
        if verdict.ack {
            self.channel.ack(&verdict.delivery).await
        } else {
            self.channel.nack(&verdict.delivery, verdict.requeue).await
        }
    }

    fn spawn_worker(
        &self,
        delivery: Delivery,
        permit: OwnedSemaphorePermit,
        ack_tx: UnboundedSender<AckMessage>,
        err_tx: UnboundedSender<TaskQueueError>,
    ) {
        let config = Arc::clone(&self.config);
        let retries = self.retries.clone();
        let sink = Arc::clone(&self.sink);
        let sleeper = Arc::clone(&self.sleeper);
        tokio::spawn(async move {
            let disposition =
                process_delivery(&delivery, &config, &retries, sleeper.as_ref()).await;
            sink.record(&config.name, disposition.event);
            if let Some(e) = disposition.error {
                let _ = err_tx.send(e);
            }
            let _ = ack_tx.send(AckMessage {
                ack: disposition.ack,
                requeue: disposition.requeue,
                delivery,
            });
            drop(permit);
        });
    }
}

/// What a worker decided about one delivery.
struct Disposition {
    ack: bool,
    requeue: bool,
    event: DispatchEvent,
    error: Option<TaskQueueError>,
}

impl Disposition {
    fn ack(event: DispatchEvent) -> Self {
        Self { ack: true, requeue: false, event, error: None }
    }

    fn requeue(event: DispatchEvent) -> Self {
        Self { ack: false, requeue: true, event, error: None }
    }

    fn discard(event: DispatchEvent) -> Self {
        Self { ack: false, requeue: false, event, error: None }
    }
}

async fn process_delivery(
    delivery: &Delivery,
    config: &QueueConfig,
    retries: &RetryTable,
    sleeper: &dyn Sleeper,
) -> Disposition {
    let task: AsyncTask = match serde_json::from_slice(&delivery.body) {
        Ok(task) => task,
        Err(e) => {
            return Disposition {
                error: Some(TaskQueueError::Malformed {
                    message_id: delivery.message_id.clone(),
                    reason: e.to_string(),
                }),
                ..Disposition::discard(DispatchEvent::Malformed)
            };
        }
    };

    let now = unix_now();

    if task.expired(now) {
        retries.delete(&delivery.message_id);
        tracing::info!(
            message_id = %delivery.message_id,
            expires = task.expires,
            "task expired; discarding"
        );
        return Disposition::discard(DispatchEvent::Expired);
    }

    let mut state = retries.get(&delivery.message_id).unwrap_or_else(|| RetryData {
        max_retries: task.max_retries,
        current_retries: 0,
        last_backoff: 0,
        eta: task.initial_eta(now),
    });

    if state.eta > now {
        // Not due yet: requeue without counting, after a short pause so
        // the broker round-trip does not become a busy loop.
        sleeper.sleep(DEFER_PAUSE).await;
        return Disposition::requeue(DispatchEvent::Deferred);
    }

    match post_task(&task).await {
        Err(e) => {
            // Infrastructure, not a task defect: the attempt is free.
            tracing::warn!(
                message_id = %delivery.message_id,
                url = %task.url,
                error = %e,
                "transport error; requeueing"
            );
            Disposition::requeue(DispatchEvent::TransportRetry)
        }
        Ok(200) => {
            retries.delete(&delivery.message_id);
            tracing::debug!(message_id = %delivery.message_id, "task delivered");
            Disposition::ack(DispatchEvent::Delivered)
        }
        Ok(status) => {
            state.current_retries += 1;
            if state.max_retries != -1 && state.current_retries > state.max_retries {
                retries.delete(&delivery.message_id);
                tracing::error!(
                    message_id = %delivery.message_id,
                    url = %task.url,
                    status,
                    max_retries = state.max_retries,
                    "retry limit exceeded; discarding"
                );
                Disposition::discard(DispatchEvent::RetryExhausted)
            } else {
                state.advance_backoff(config, unix_now());
                tracing::warn!(
                    message_id = %delivery.message_id,
                    url = %task.url,
                    status,
                    retries = state.current_retries,
                    next_eta = state.eta,
                    "task rejected; backing off"
                );
                retries.set(&delivery.message_id, state);
                Disposition::requeue(DispatchEvent::RejectedRetry)
            }
        }
    }
}

async fn post_task(task: &AsyncTask) -> Result<u16, reqwest::Error> {
    let client = reqwest::Client::builder().timeout(DISPATCH_TIMEOUT).build()?;
    let response = client
        .post(&task.url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(task.payload.clone())
        .send()
        .await?;
    Ok(response.status().as_u16())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::RateSpec;
    use crate::sleeper::TrackingSleeper;

    fn queue_config() -> QueueConfig {
        QueueConfig {
            name: "q".to_string(),
            concurrency: 1,
            rate: "1/s".to_string(),
            rate_details: RateSpec::parse("1/s").unwrap(),
            retry_limit: -1,
            min_backoff_seconds: 0,
            max_backoff_seconds: -1,
            max_doublings: -1,
        }
    }

    fn delivery(body: &str) -> Delivery {
        Delivery { message_id: "m1".to_string(), body: body.as_bytes().to_vec(), tag: 1 }
    }

    #[tokio::test]
    async fn malformed_body_is_discarded_with_an_error() {
        let retries = RetryTable::new();
        let sleeper = TrackingSleeper::new();

        let d = process_delivery(
            &delivery("not json"),
            &queue_config(),
            &retries,
            &sleeper,
        )
        .await;

        assert!(!d.ack);
        assert!(!d.requeue);
        assert_eq!(d.event, DispatchEvent::Malformed);
        assert!(d.error.as_ref().is_some_and(|e| e.is_malformed()));
        assert!(retries.is_empty());
    }

    #[tokio::test]
    async fn expired_task_is_discarded_without_an_attempt() {
        let retries = RetryTable::new();
        retries.set("m1", RetryData::default());
        let sleeper = TrackingSleeper::new();

        let d = process_delivery(
            &delivery(r#"{"url":"http://127.0.0.1:1/x","expires":1}"#),
            &queue_config(),
            &retries,
            &sleeper,
        )
        .await;

        assert!(!d.ack);
        assert!(!d.requeue);
        assert_eq!(d.event, DispatchEvent::Expired);
        assert!(d.error.is_none());
        assert!(retries.is_empty(), "expiry drops the retry entry");
        assert!(sleeper.calls().is_empty(), "no deferral pause, no POST");
    }

    #[tokio::test]
    async fn early_eta_defers_with_a_pause_and_no_counting() {
        let retries = RetryTable::new();
        let sleeper = TrackingSleeper::new();
        let body = format!(r#"{{"url":"http://127.0.0.1:1/x","eta":{}}}"#, unix_now() + 60);

        let d = process_delivery(&delivery(&body), &queue_config(), &retries, &sleeper)
            .await;

        assert!(!d.ack);
        assert!(d.requeue);
        assert_eq!(d.event, DispatchEvent::Deferred);
        assert_eq!(sleeper.calls(), vec![DEFER_PAUSE]);
        // Deferral never counts as a retry.
        assert!(retries.get("m1").map_or(true, |rt| rt.current_retries == 0));
    }

    #[tokio::test]
    async fn transport_error_requeues_for_free() {
        let retries = RetryTable::new();
        let sleeper = TrackingSleeper::new();
        // Port 1 refuses connections.
        let body = r#"{"url":"http://127.0.0.1:1/x","max_retries":2}"#;

        for _ in 0..3 {
            let d = process_delivery(&delivery(body), &queue_config(), &retries, &sleeper)
                .await;
            assert!(!d.ack);
            assert!(d.requeue);
            assert_eq!(d.event, DispatchEvent::TransportRetry);
        }

        // No counter movement, no table entry: the failures were free.
        assert!(retries.get("m1").map_or(true, |rt| rt.current_retries == 0));
    }

    #[tokio::test]
    async fn countdown_sets_the_initial_eta() {
        let retries = RetryTable::new();
        let sleeper = TrackingSleeper::new();
        let body = r#"{"url":"http://127.0.0.1:1/x","countdown":120}"#;

        let d = process_delivery(&delivery(body), &queue_config(), &retries, &sleeper)
            .await;

        assert_eq!(d.event, DispatchEvent::Deferred);
        assert!(d.requeue);
    }
}
