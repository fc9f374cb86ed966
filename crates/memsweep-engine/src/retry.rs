//! Retry policy for control surface calls
//!
//! Every call into the vendor API goes through [`RetryPolicy::invoke`]. Lock
//! contention with a competing overclock tool shows up as a handful of
//! transient status codes; those are retried with exponential backoff inside
//! an attempt bound and a wall-clock budget. Everything else fails at once.

use memsweep_core::{DriverError, DriverResult, Error, Result, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a driver failure is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Transient,
    Permanent,
}

/// Classify a driver failure; unknown codes are permanent
pub fn classify(error: &DriverError) -> Classification {
    if error.is_transient() {
        Classification::Transient
    } else {
        Classification::Permanent
    }
}

/// Bookkeeping for one logical operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryContext {
    /// Calls made, the first one included
    pub attempts: u32,
    pub last_classification: Option<Classification>,
    /// Total time spent sleeping between attempts
    pub backoff_elapsed: Duration,
}

/// Bounded exponential backoff for transient driver failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    multiplier: f64,
    max_backoff: Duration,
    budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        multiplier: f64,
        max_backoff: Duration,
        budget: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            multiplier,
            max_backoff,
            budget,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.initial_backoff(),
            config.backoff_multiplier,
            config.max_backoff(),
            config.budget(),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let seconds = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        // overflowing or NaN delays saturate at the cap
        Duration::try_from_secs_f64(seconds)
            .map(|delay| delay.min(self.max_backoff))
            .unwrap_or(self.max_backoff)
    }

    /// Run `call` until it succeeds, fails permanently or the bounds run out
    pub async fn invoke<F, Fut, T>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        self.invoke_with_context(operation, call).await.0
    }

    /// Like [`invoke`](Self::invoke), also returning the retry bookkeeping
    pub async fn invoke_with_context<F, Fut, T>(
        &self,
        operation: &str,
        mut call: F,
    ) -> (Result<T>, RetryContext)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        let deadline = Instant::now() + self.budget;
        let mut context = RetryContext::default();

        loop {
            context.attempts += 1;
            let error = match call().await {
                Ok(value) => {
                    if context.attempts > 1 {
                        debug!("{} succeeded after {} attempts", operation, context.attempts);
                    }
                    return (Ok(value), context);
                }
                Err(error) => error,
            };

            let classification = classify(&error);
            context.last_classification = Some(classification);

            if classification == Classification::Permanent {
                warn!("{} failed permanently: {}", operation, error);
                return (Err(Error::PermanentDriver(error)), context);
            }

            let delay = self.backoff_for(context.attempts);
            if context.attempts >= self.max_attempts || Instant::now() + delay > deadline {
                warn!(
                    "{} still failing after {} attempts ({:?} backing off): {}",
                    operation, context.attempts, context.backoff_elapsed, error
                );
                return (
                    Err(Error::TransientDriver {
                        source: error,
                        attempts: context.attempts,
                    }),
                    context,
                );
            }

            warn!(
                "{} hit transient failure, retrying in {:?} (attempt {}/{}): {}",
                operation, delay, context.attempts, self.max_attempts, error
            );
            tokio::time::sleep(delay).await;
            context.backoff_elapsed += delay;
        }
    }
}
