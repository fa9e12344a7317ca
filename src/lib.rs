#![forbid(unsafe_code)]

//! # taskqueue
//!
//! A rate-limited, retrying webhook dispatcher. Producers enqueue durable
//! task descriptions on a broker; each task is delivered as an HTTP POST
//! to its URL, with transient failures absorbed through bounded retries
//! and truncated exponential backoff, under per-queue concurrency and
//! fill-rate limits.
//!
//! ## Pieces
//!
//! - [`Backend`] / [`Channel`]: the broker abstraction. Concrete AMQP and
//!   Redis (leased-queue) implementations live in the companion crates
//!   `taskqueue-amqp` and `taskqueue-redis`.
//! - [`RateGate`]: per-queue pacer enforcing a minimum gap between
//!   dispatches, derived from specs like `"21.5/m"`.
//! - [`RetryTable`]: in-memory bookkeeping of attempt counts, backoff and
//!   next-earliest execution times.
//! - [`DispatchLoop`]: the engine tying them together, one per queue.
//! - [`ServerConfig`]: the immutable INI-derived configuration record.
//!
//! Delivery is at-least-once: acks can be lost with a dying channel and
//! the broker redelivers. Retry bookkeeping is process-local; after a
//! crash, redeliveries start from scratch and the broker remains the
//! source of truth.
//!
//! ## Backoff at a glance
//!
//! ```rust
//! use taskqueue::{QueueConfig, RateSpec, RetryData};
//!
//! let config = QueueConfig {
//!     name: "hooks".to_string(),
//!     concurrency: 4,
//!     rate: "2/s".to_string(),
//!     rate_details: RateSpec::parse("2/s").unwrap(),
//!     retry_limit: 5,
//!     min_backoff_seconds: 1,
//!     max_backoff_seconds: 30,
//!     max_doublings: -1,
//! };
//! assert_eq!(config.rate_details.fill_rate_millis, 500);
//!
//! let mut state = RetryData { max_retries: 5, ..RetryData::default() };
//! state.current_retries = 1;
//! state.advance_backoff(&config, 1_000);
//! assert_eq!(state.last_backoff, 1);
//! assert_eq!(state.eta, 1_001);
//! ```

mod backend;
mod config;
mod dispatch;
mod error;
mod rate;
mod retry;
mod sleeper;
mod task;
mod telemetry;

// Re-exports
pub use backend::{AckMessage, Backend, Channel, Delivery};
pub use config::{BackendKind, QueueConfig, ServerConfig};
pub use dispatch::DispatchLoop;
pub use error::TaskQueueError;
pub use rate::{Interval, RateGate, RateSpec};
pub use retry::{RetryData, RetryTable};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use task::AsyncTask;
pub use telemetry::{DispatchEvent, EventSink, NoopSink, TracingSink};
