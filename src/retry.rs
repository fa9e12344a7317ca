//! Per-message retry bookkeeping and the truncated exponential backoff.
//!
//! Invariants:
//! - `current_retries` only ever grows, and only on rejected (non-200)
//!   attempts.
//! - `last_backoff` stays within `[min_backoff_seconds,
//!   max(min_backoff_seconds, max_backoff_seconds)]` whenever a cap is set.
//! - The table holds a key only while its message is in flight or awaiting
//!   retry; terminal success and terminal discard both remove it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::QueueConfig;

/// Retry state for one message, keyed by its broker identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryData {
    /// Budget carried over from the task; -1 means unlimited.
    pub max_retries: i64,
    /// Rejected attempts so far.
    pub current_retries: i64,
    /// Seconds slept before the most recent requeue.
    pub last_backoff: i64,
    /// Unix second before which the message must not be attempted.
    pub eta: i64,
}

impl RetryData {
    /// Advance the backoff window after a rejected attempt and stamp the
    /// next earliest execution time.
    ///
    /// The cap comparison is strictly `<`, so the delay can plateau one
    /// doubling below `max_backoff_seconds`; consumers depend on that
    /// exact schedule. `max_doublings == -1` means the delay doubles on
    /// every attempt.
    pub fn advance_backoff(&mut self, config: &QueueConfig, now_unix: i64) {
        if self.last_backoff == 0 {
            self.last_backoff = config.min_backoff_seconds;
        } else if config.max_doublings == -1 || self.current_retries < config.max_doublings {
            let doubled = self.last_backoff * 2;
            if config.max_backoff_seconds == -1 || doubled < config.max_backoff_seconds {
                self.last_backoff = doubled;
            }
        }
        self.eta = now_unix + self.last_backoff;
    }
}

/// Concurrent map from message id to [`RetryData`].
///
/// Readers proceed in parallel, writers are exclusive, and values are
/// copied in and out so callers never alias internal storage. Handles are
/// cheap clones over shared state.
#[derive(Debug, Clone, Default)]
pub struct RetryTable {
    inner: Arc<RwLock<HashMap<String, RetryData>>>,
}

impl RetryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<RetryData> {
        self.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, data: RetryData) {
        self.write().insert(key.to_string(), data);
    }

    pub fn delete(&self, key: &str) {
        self.write().remove(key);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RetryData>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RetryData>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
