//! Wire model for queued tasks.
//!
//! A broker message body is UTF-8 JSON of [`AsyncTask`]. Unknown fields are
//! ignored and missing fields take zero values, so producers on older or
//! newer schemas keep working.

use serde::{Deserialize, Serialize};

/// A task description as enqueued by a producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncTask {
    /// Where to POST the payload.
    pub url: String,
    /// Unix second at or after which the task may run; 0 means immediately.
    pub eta: i64,
    /// Seconds from first observation, as an alternative to `eta`.
    pub countdown: i64,
    /// Retry budget for rejected attempts; -1 means unlimited.
    pub max_retries: i64,
    /// Opaque body forwarded verbatim to the endpoint.
    pub payload: String,
    /// Unix second after which the task is dropped; 0 means never.
    pub expires: i64,
    /// Queue the producer aimed at.
    pub queue: String,
}

impl AsyncTask {
    /// The earliest Unix second this task may be attempted. `eta` wins over
    /// `countdown`; with neither set the task is due immediately.
    pub fn initial_eta(&self, now_unix: i64) -> i64 {
        if self.eta != 0 {
            self.eta
        } else if self.countdown > 0 {
            now_unix + self.countdown
        } else {
            0
        }
    }

    /// Whether the task's expiry has passed.
    pub fn expired(&self, now_unix: i64) -> bool {
        self.expires != 0 && now_unix >= self.expires
    }
}
