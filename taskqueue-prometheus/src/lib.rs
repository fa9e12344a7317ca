//! Prometheus metrics sink for `taskqueue`.
//! Bring your own `prometheus::Registry`; counters are registered and
//! incremented per queue and dispatch outcome.

use std::sync::Arc;

use prometheus::{IntCounterVec, Registry};

use taskqueue::{DispatchEvent, EventSink};

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    dispatches: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register its counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name
    /// conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let dispatches = IntCounterVec::new(
            prometheus::Opts::new("taskqueue_dispatch_total", "Dispatch outcomes"),
            &["queue", "outcome"],
        )?;
        registry.register(Box::new(dispatches.clone()))?;
        Ok(Self { registry, dispatches })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl EventSink for PrometheusSink {
    fn record(&self, queue: &str, event: DispatchEvent) {
        self.dispatches
            .with_label_values(&[queue, event.as_str()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_queue_and_outcome() {
        let sink = PrometheusSink::new(Registry::new()).expect("register");

        sink.record("hooks", DispatchEvent::Delivered);
        sink.record("hooks", DispatchEvent::Delivered);
        sink.record("hooks", DispatchEvent::RejectedRetry);
        sink.record("other", DispatchEvent::Delivered);

        let delivered = sink
            .dispatches
            .with_label_values(&["hooks", "delivered"])
            .get();
        assert_eq!(delivered, 2);
        let rejected = sink
            .dispatches
            .with_label_values(&["hooks", "rejected_retry"])
            .get();
        assert_eq!(rejected, 1);
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let registry = Arc::new(Registry::new());
        let _first = PrometheusSink::new(registry.clone()).expect("first registration");
        assert!(PrometheusSink::new(registry).is_err());
    }
}
