//! Shared test helpers: an in-memory broker double and a local HTTP
//! endpoint harness.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use taskqueue::{Backend, Channel, Delivery, TaskQueueError};

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Delivery>>,
    acks: Vec<String>,
    nacks: Vec<(String, bool)>,
    closed: bool,
    next_tag: u64,
}

/// In-memory broker double. Handles are cheap clones over shared state.
/// `nack(requeue = true)` returns the delivery to the tail of its queue,
/// so redelivery loops behave like a real broker's.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message without going through a channel.
    pub fn seed(&self, queue: &str, body: &[u8]) -> String {
        let mut state = self.lock();
        state.next_tag += 1;
        let tag = state.next_tag;
        let message_id = format!("m{tag}");
        state.queues.entry(queue.to_string()).or_default().push_back(Delivery {
            message_id: message_id.clone(),
            body: body.to_vec(),
            tag,
        });
        message_id
    }

    /// Message ids positively acknowledged so far.
    pub fn acks(&self) -> Vec<String> {
        self.lock().acks.clone()
    }

    /// `(message_id, requeue)` pairs negatively acknowledged so far.
    pub fn nacks(&self) -> Vec<(String, bool)> {
        self.lock().nacks.clone()
    }

    /// End every consumer stream, as a broker loss or shutdown would.
    pub fn close_consumers(&self) {
        self.lock().closed = true;
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn connect(&mut self) -> Result<(), TaskQueueError> {
        Ok(())
    }

    async fn get_channel(&self) -> Result<Box<dyn Channel>, TaskQueueError> {
        Ok(Box::new(MemoryChannel { backend: self.clone(), queue: None }))
    }

    async fn purge_queue(&self, queue: &str) -> Result<(), TaskQueueError> {
        if let Some(pending) = self.lock().queues.get_mut(queue) {
            pending.clear();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TaskQueueError> {
        self.close_consumers();
        Ok(())
    }
}

pub struct MemoryChannel {
    backend: MemoryBackend,
    queue: Option<String>,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<(), TaskQueueError> {
        self.backend.seed(queue, body);
        Ok(())
    }

    async fn count_messages(&self, queue: &str) -> Result<i64, TaskQueueError> {
        Ok(self.backend.lock().queues.get(queue).map_or(0, |q| q.len() as i64))
    }

    async fn consume(
        &mut self,
        queue: &str,
    ) -> Result<mpsc::Receiver<Delivery>, TaskQueueError> {
        self.queue = Some(queue.to_string());
        let (tx, rx) = mpsc::channel(10);
        let backend = self.backend.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            loop {
                let next = {
                    let mut state = backend.lock();
                    if state.closed {
                        break;
                    }
                    state.queues.get_mut(&queue).and_then(|q| q.pop_front())
                };
                match next {
                    Some(delivery) => {
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    None => tokio::time::sleep(Duration::from_millis(5)).await,
                }
            }
        });
        Ok(rx)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), TaskQueueError> {
        self.backend.lock().acks.push(delivery.message_id.clone());
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TaskQueueError> {
        let queue = self
            .queue
            .clone()
            .ok_or_else(|| TaskQueueError::Unavailable("no active consumer".to_string()))?;
        let mut state = self.backend.lock();
        state.nacks.push((delivery.message_id.clone(), requeue));
        if requeue {
            state.queues.entry(queue).or_default().push_back(delivery.clone());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TaskQueueError> {
        Ok(())
    }
}

/// Serve an axum router on an ephemeral local port.
pub async fn start_endpoint(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test endpoint");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve test endpoint");
    });
    addr
}

/// Poll `condition` until it holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
