//! Retry policies
//!
//! A [`RetryPolicy`] turns "this packet has failed `n` times" into either a
//! delay before the next attempt or a decision to give up. Delays double
//! with every failure, capped at `max_delay`.

use std::time::Duration;

/// Outcome of consulting a [`RetryPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay
    Retry(Duration),
    /// Stop retrying
    GiveUp,
}

/// Exponential backoff with an optional attempt cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy that gives up after `max_attempts` failed attempts
    pub const fn bounded(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            base_delay,
            max_delay,
        }
    }

    /// Policy that never gives up
    pub const fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay,
            max_delay,
        }
    }

    /// Default for packets whose destination has no route
    pub const fn no_route() -> Self {
        Self::bounded(5, Duration::from_millis(500), Duration::from_secs(4))
    }

    /// Default for forwarding to a next hop that refused the connection
    pub const fn connection_failure() -> Self {
        Self::unbounded(Duration::from_millis(250), Duration::from_secs(5))
    }

    /// Default for flooding a record to one neighbor
    pub const fn flooding() -> Self {
        Self::bounded(3, Duration::from_millis(200), Duration::from_secs(1))
    }

    /// Decide what to do after `failures` failed attempts
    pub fn decide(&self, failures: u32) -> RetryDecision {
        match self.max_attempts {
            Some(max) if failures >= max => RetryDecision::GiveUp,
            _ => RetryDecision::Retry(self.delay_for(failures)),
        }
    }

    /// Backoff delay after `failures` failed attempts
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}
