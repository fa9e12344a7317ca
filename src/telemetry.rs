//! Dispatch outcome events and pluggable sinks.
//!
//! The engine narrates what happened to each delivery as a
//! [`DispatchEvent`]; anything implementing [`EventSink`] can aggregate
//! them (counters, logs). Sinks run inline on the loop's task and must not
//! block.

/// What happened to one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    /// The endpoint returned 200; the task is done.
    Delivered,
    /// ETA is still in the future; requeued untouched.
    Deferred,
    /// Transport-level failure; requeued without touching the retry count.
    TransportRetry,
    /// Non-200 status with retry budget left; requeued with backoff.
    RejectedRetry,
    /// Non-200 status with no retries left; discarded.
    RetryExhausted,
    /// Body failed to decode; discarded.
    Malformed,
    /// Past its expiry; discarded without an attempt.
    Expired,
}

impl DispatchEvent {
    /// Stable label, suitable for metric dimensions.
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchEvent::Delivered => "delivered",
            DispatchEvent::Deferred => "deferred",
            DispatchEvent::TransportRetry => "transport_retry",
            DispatchEvent::RejectedRetry => "rejected_retry",
            DispatchEvent::RetryExhausted => "retry_exhausted",
            DispatchEvent::Malformed => "malformed",
            DispatchEvent::Expired => "expired",
        }
    }
}

/// Receives every dispatch event from a loop.
pub trait EventSink: Send + Sync {
    fn record(&self, queue: &str, event: DispatchEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _queue: &str, _event: DispatchEvent) {}
}

/// Sink that logs each event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, queue: &str, event: DispatchEvent) {
        tracing::debug!(queue, outcome = event.as_str(), "dispatch event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CollectingSink {
        seen: Mutex<Vec<(String, DispatchEvent)>>,
    }

    impl EventSink for CollectingSink {
        fn record(&self, queue: &str, event: DispatchEvent) {
            self.seen.lock().unwrap().push((queue.to_string(), event));
        }
    }

    #[test]
    fn labels_are_distinct() {
        let all = [
            DispatchEvent::Delivered,
            DispatchEvent::Deferred,
            DispatchEvent::TransportRetry,
            DispatchEvent::RejectedRetry,
            DispatchEvent::RetryExhausted,
            DispatchEvent::Malformed,
            DispatchEvent::Expired,
        ];
        let mut labels: Vec<_> = all.iter().map(|e| e.as_str()).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), all.len());
    }

    #[test]
    fn sinks_are_object_safe() {
        let sink: Arc<dyn EventSink> = Arc::new(CollectingSink::default());
        sink.record("q", DispatchEvent::Delivered);
        NoopSink.record("q", DispatchEvent::Deferred);
    }
}
