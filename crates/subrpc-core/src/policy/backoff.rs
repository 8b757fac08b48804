//! Reconnect delay policy: capped exponential backoff, fixed delay by default.

use std::time::Duration;

/// Configuration for the reconnect backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial: Duration,
    /// Upper bound for the delay.
    pub max: Duration,
    /// Multiplier applied per failed attempt (1.0 = fixed delay).
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(2_500),
            max: Duration::from_secs(60),
            multiplier: 1.0,
        }
    }
}

/// Stateless policy — computes the delay for a given attempt number.
///
/// Unlike a request retry policy it never gives up: the reconnect loop runs
/// until it succeeds or the provider is disconnected by the caller.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub config: BackoffConfig,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Fixed delay of `delay`.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(BackoffConfig {
            initial: delay,
            max: delay,
            multiplier: 1.0,
        })
    }

    /// Returns the delay before the `attempt`-th reconnect (1-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = self.config.multiplier.max(1.0);
        let base_ms = self.config.initial.as_millis() as f64 * multiplier.powi(exponent);
        let cap_ms = self.config.max.max(self.config.initial).as_millis() as f64;
        Duration::from_millis(base_ms.min(cap_ms) as u64)
    }
}
