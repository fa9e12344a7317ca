//! Error types surfaced by the dispatcher core.

/// Crate-wide error enum.
///
/// Only `Unavailable` (and `Config`, at startup) ever propagate out of a
/// dispatch loop. Per-message conditions are absorbed by the loop; the
/// broker ack/nack decision is the caller-visible signal.
#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    /// Malformed INI, bad rate spec, bad server URL. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Broker connect, channel or publish failure. Fatal inside a dispatch
    /// loop; the loop exits and leaves the restart to its supervisor.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// A delivery body that does not decode as a task. Terminal for that
    /// message only.
    #[error("malformed task payload for message {message_id}: {reason}")]
    Malformed {
        /// Identity of the offending delivery.
        message_id: String,
        /// Decoder complaint, for the logs.
        reason: String,
    },
}

impl TaskQueueError {
    /// Check if this error is a configuration failure.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this error means the broker is gone.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Check if this error is a per-message decode failure.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}
