//! Rate specs and the per-queue pacing gate.
//!
//! Semantics
//! - A rate spec is `N/s`, `N/m` or `N/h` with a positive decimal amount;
//!   it boils down to a fill rate: the minimum milliseconds between two
//!   dispatch permits.
//! - [`RateGate::wait`] measures from the moment the previous permit was
//!   actually issued, not from when it was requested, and accumulates no
//!   burst credit. This is strictly stricter than a token bucket with
//!   burst 1.
//! - The very first call initialises the gate and returns immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::TaskQueueError;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Interval unit of a rate spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Second,
    Minute,
    Hour,
}

impl Interval {
    /// Length of the interval in seconds.
    pub fn seconds(self) -> f64 {
        match self {
            Interval::Second => 1.0,
            Interval::Minute => 60.0,
            Interval::Hour => 3600.0,
        }
    }

    /// Single-letter form as written in configuration dumps.
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Second => "S",
            Interval::Minute => "M",
            Interval::Hour => "H",
        }
    }
}

/// A parsed rate. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSpec {
    /// Permits per interval.
    pub amount: f64,
    /// The interval the amount is spread over.
    pub interval: Interval,
    /// Minimum milliseconds between two dispatch permits.
    pub fill_rate_millis: u64,
}

impl RateSpec {
    /// Parse a raw spec like `"1/s"`, `"21.5/m"` or `"100/h"`.
    ///
    /// The amount accepts only digits and dots (so no signs, no
    /// exponents) and must be positive.
    pub fn parse(raw: &str) -> Result<Self, TaskQueueError> {
        let bad = || {
            TaskQueueError::Config(format!(
                "rate {raw:?} does not match N/s, N/m or N/h"
            ))
        };

        let (amount_raw, interval_raw) = raw.split_once('/').ok_or_else(bad)?;
        if amount_raw.is_empty()
            || !amount_raw.chars().all(|c| c.is_ascii_digit() || c == '.')
        {
            return Err(bad());
        }
        let amount: f64 = amount_raw.parse().map_err(|_| bad())?;
        if amount <= 0.0 || !amount.is_finite() {
            return Err(TaskQueueError::Config(format!(
                "rate {raw:?} must have a positive amount"
            )));
        }
        let interval = match interval_raw {
            "s" => Interval::Second,
            "m" => Interval::Minute,
            "h" => Interval::Hour,
            _ => return Err(bad()),
        };

        let fill_rate_millis = (1000.0 * interval.seconds() / amount).floor() as u64;

        Ok(RateSpec { amount, interval, fill_rate_millis })
    }

    /// The fill rate as a `Duration`.
    pub fn fill_rate(&self) -> Duration {
        Duration::from_millis(self.fill_rate_millis)
    }
}

/// Per-queue pacer enforcing the minimum inter-dispatch gap.
///
/// Single-writer: only the owning dispatch loop calls [`RateGate::wait`].
#[derive(Debug)]
pub struct RateGate {
    fill_rate: Duration,
    last_fill_at: Option<Instant>,
    sleeper: Arc<dyn Sleeper>,
}

impl RateGate {
    pub fn new(spec: &RateSpec) -> Self {
        Self::with_sleeper(spec, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(spec: &RateSpec, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { fill_rate: spec.fill_rate(), last_fill_at: None, sleeper }
    }

    /// Block until the gap since the previous permit reaches the fill
    /// rate, then issue a permit. The first call issues immediately.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last_fill_at {
            let elapsed = last.elapsed();
            if elapsed < self.fill_rate {
                self.sleeper.sleep(self.fill_rate - elapsed).await;
            }
        }
        self.last_fill_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::TrackingSleeper;

    #[test]
    fn fill_rate_per_second() {
        assert_eq!(RateSpec::parse("1/s").unwrap().fill_rate_millis, 1000);
        assert_eq!(RateSpec::parse("2/s").unwrap().fill_rate_millis, 500);
        assert_eq!(RateSpec::parse("0.5/s").unwrap().fill_rate_millis, 2000);
        assert_eq!(RateSpec::parse("3/s").unwrap().fill_rate_millis, 333);
    }

    #[test]
    fn fill_rate_per_minute_and_hour() {
        let spec = RateSpec::parse("21.5/m").unwrap();
        assert_eq!(spec.amount, 21.5);
        assert_eq!(spec.interval, Interval::Minute);
        assert_eq!(spec.fill_rate_millis, 2790);

        assert_eq!(RateSpec::parse("1/m").unwrap().fill_rate_millis, 60_000);
        assert_eq!(RateSpec::parse("1/h").unwrap().fill_rate_millis, 3_600_000);
        assert_eq!(RateSpec::parse("100/h").unwrap().fill_rate_millis, 36_000);
    }

    #[test]
    fn interval_letters() {
        assert_eq!(RateSpec::parse("1/s").unwrap().interval.as_str(), "S");
        assert_eq!(RateSpec::parse("1/m").unwrap().interval.as_str(), "M");
        assert_eq!(RateSpec::parse("1/h").unwrap().interval.as_str(), "H");
    }

    #[test]
    fn rejects_malformed_specs() {
        for raw in ["", "1", "/s", "1/", "1/d", "one/s", "-1/s", "1e3/s", "1 /s"] {
            let err = RateSpec::parse(raw).unwrap_err();
            assert!(err.is_config(), "{raw:?} should be rejected");
        }
    }

    #[test]
    fn rejects_zero_amount() {
        assert!(RateSpec::parse("0/s").unwrap_err().is_config());
        assert!(RateSpec::parse("0.0/m").unwrap_err().is_config());
    }

    #[tokio::test]
    async fn first_permit_is_immediate() {
        let sleeper = TrackingSleeper::new();
        let spec = RateSpec::parse("1/s").unwrap();
        let mut gate = RateGate::with_sleeper(&spec, Arc::new(sleeper.clone()));

        gate.wait().await;
        assert!(sleeper.calls().is_empty(), "first call must not sleep");
    }

    #[tokio::test]
    async fn back_to_back_permits_wait_out_the_fill_rate() {
        let sleeper = TrackingSleeper::new();
        let spec = RateSpec::parse("2/s").unwrap();
        let mut gate = RateGate::with_sleeper(&spec, Arc::new(sleeper.clone()));

        gate.wait().await;
        gate.wait().await;
        gate.wait().await;

        let calls = sleeper.calls();
        assert_eq!(calls.len(), 2);
        for wait in calls {
            // Requested remainder can only be shy of the full fill rate by
            // however long the loop body took.
            assert!(wait <= Duration::from_millis(500));
            assert!(wait >= Duration::from_millis(400));
        }
    }

    #[tokio::test]
    async fn slow_caller_passes_straight_through() {
        let sleeper = TrackingSleeper::new();
        let spec = RateSpec::parse("100/s").unwrap(); // 10ms fill rate
        let mut gate = RateGate::with_sleeper(&spec, Arc::new(sleeper.clone()));

        gate.wait().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        gate.wait().await;

        assert!(sleeper.calls().is_empty(), "gap already elapsed; no sleep");
    }
}
