//! Exponential backoff shared by every retry loop in the controller.
//!
//! A [`RetryConfig`] is consumed in two ways:
//! - [`RetryConfig::delay_for`] yields the deterministic delay for the n-th
//!   failure. The work queue and the Job retry policy record it as a
//!   deadline instead of sleeping.
//! - [`retry_with_backoff`] wraps one async call (status writes) and sleeps
//!   in place between attempts, with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Bounded (or unbounded) exponential backoff policy
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Failures tolerated before giving up (0 = never give up)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Ceiling for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default delays with a failure budget of `attempts`
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Doubling backoff from `initial_delay` up to `max_delay`
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
        }
    }

    /// Delay to wait after `attempt` failures (0-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.min(63) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Whether `attempts` failures have used up the budget
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts >= self.max_attempts
    }
}

/// Scale `delay` by a random factor in `[0.5, 1.5)`
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Run `operation` until it succeeds or the budget in `config` is spent.
///
/// The error of the final attempt is returned when retries run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures = 0u32;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        failures += 1;

        if config.is_exhausted(failures) {
            error!(
                operation = %operation_name,
                attempts = failures,
                error = %err,
                "giving up after repeated failures"
            );
            return Err(err);
        }

        let delay = jittered(config.delay_for(failures - 1));
        warn!(
            operation = %operation_name,
            attempt = failures,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "operation failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
