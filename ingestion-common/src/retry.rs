//! # Retry
//!
//! Module providing a `RetryPolicy` struct to compute how long the broker should wait before
//! redelivering a message whose batch could not be persisted.
use std::time;

#[derive(Clone, Debug, PartialEq, Eq)]
/// An exponential backoff policy keyed on a message's delivery count.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past delivery.
    pub backoff_coefficient: u32,
    /// The backoff interval after the first delivery.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between deliveries.
    pub maximum_interval: time::Duration,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine the redelivery delay for a message that has been delivered `delivery_count` times.
    ///
    /// `delay = min(initial_interval * backoff_coefficient^(delivery_count - 1), maximum_interval)`,
    /// with `delivery_count` floored at 1. Overflow saturates to `maximum_interval`.
    pub fn next_delay(&self, delivery_count: u64) -> time::Duration {
        let exponent = delivery_count.max(1) - 1;

        let candidate_interval = u32::try_from(exponent)
            .ok()
            .and_then(|exponent| self.backoff_coefficient.checked_pow(exponent))
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match candidate_interval {
            Some(interval) => std::cmp::min(interval, self.maximum_interval),
            None => self.maximum_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: time::Duration,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(30),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = interval;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}
