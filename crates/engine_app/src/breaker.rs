//! Per-stage circuit breaker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    #[default]
    Closed,
    /// Runs are skipped until the breaker is reset.
    Open,
}

/// Counts consecutive failures and opens at `threshold`.
///
/// An open breaker stays open until [`reset`](CircuitBreaker::reset); it
/// never closes on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    state: BreakerState,
    failures: u32,
    threshold: u32,
    opened_at: Option<DateTime<Utc>>,
    trips: u64,
}

impl CircuitBreaker {
    /// A closed breaker. A threshold of zero is treated as one.
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            opened_at: None,
            trips: 0,
        }
    }

    /// Count a failure. Returns `true` if this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        if self.state == BreakerState::Closed && self.failures >= self.threshold {
            self.state = BreakerState::Open;
            self.opened_at = Some(Utc::now());
            self.trips += 1;
            return true;
        }
        false
    }

    /// A success clears the failure count and closes the breaker.
    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = BreakerState::Closed;
        self.opened_at = None;
    }

    pub fn reset(&mut self) {
        self.record_success();
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    #[must_use]
    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    /// How many times the breaker has opened.
    #[must_use]
    pub fn trips(&self) -> u64 {
        self.trips
    }
}
