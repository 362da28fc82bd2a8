//! # Retry Executor
//!
//! Bounded-attempt exponential backoff with optional jitter. Every fallible
//! operation in the pipeline runs through a [`RetryExecutor`] configured with one
//! of three named policies:
//!
//! - [`RetryPolicy::light`] for best-effort sends
//! - [`RetryPolicy::standard`] for read paths
//! - [`RetryPolicy::heavy`] for writes, initialization and connection bring-up
//!
//! The executor checks the shared cancellation token before every attempt and
//! while waiting out a backoff delay. An attempt that is already running is never
//! interrupted, so an in-flight transaction completes or fails on its own.

use crate::metrics::IngestMetrics;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for crate::error::IngestError {
    fn is_retryable(&self) -> bool {
        crate::error::IngestError::is_retryable(self)
    }
}

/// Outcome of a retried operation that did not succeed
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The cancellation token fired before an attempt or during a backoff wait
    #[error("Operation {operation} cancelled")]
    Cancelled { operation: String },

    /// The operation failed with an error that retrying cannot fix
    #[error("Operation aborted: {0}")]
    Aborted(E),

    /// Every attempt failed; carries the last observed error
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

/// Backoff parameters for the retry executor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; values below 1 are treated as 1
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    /// Add a uniformly random `[0, delay/2)` on top of each delay
    pub jitter: bool,
}

impl RetryPolicy {
    /// Two quick attempts for best-effort sends
    pub const fn light() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            backoff_factor: 1.5,
            jitter: true,
        }
    }

    /// Three attempts with moderate delay for read paths
    pub const fn standard() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: true,
        }
    }

    /// Five attempts with long delays for operations whose failure loses data
    pub const fn heavy() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.5,
            jitter: true,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic part of the delay after the failed attempt `attempt` (0-based):
    /// `min(max_backoff, initial_backoff * backoff_factor^attempt)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(scaled.max(0.0))
        }
    }

    /// Delay to wait after the failed attempt `attempt`, jitter included
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        if self.jitter && !delay.is_zero() {
            delay + delay.mul_f64(rand::random::<f64>() / 2.0)
        } else {
            delay
        }
    }

    /// Longest a full run can take when each attempt is bounded by
    /// `per_attempt`: every attempt plus every backoff at its jittered maximum
    pub fn worst_case(&self, per_attempt: Duration) -> Duration {
        let attempts = self.attempts();
        let backoff: Duration = (0..attempts - 1)
            .map(|attempt| {
                let delay = self.base_delay(attempt);
                if self.jitter {
                    delay + delay / 2
                } else {
                    delay
                }
            })
            .sum();
        per_attempt.saturating_mul(attempts).saturating_add(backoff)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    metrics: Option<IngestMetrics>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            metrics: None,
        }
    }

    pub fn light() -> Self {
        Self::new(RetryPolicy::light())
    }

    pub fn standard() -> Self {
        Self::new(RetryPolicy::standard())
    }

    pub fn heavy() -> Self {
        Self::new(RetryPolicy::heavy())
    }

    /// Count every attempt into the given metrics bundle
    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or `cancel` fires.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let max_attempts = self.policy.attempts();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    operation: operation.to_string(),
                });
            }

            if let Some(metrics) = &self.metrics {
                metrics.record_retry_attempt(operation);
            }

            let err = match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(
                            operation = %operation,
                            attempts = attempt + 1,
                            "🔁 Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(operation = %operation, error = %err, "Non-retryable failure");
                return Err(RetryError::Aborted(err));
            }

            if attempt + 1 >= max_attempts {
                warn!(
                    operation = %operation,
                    attempts = max_attempts,
                    error = %err,
                    "❌ Retry attempts exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: max_attempts,
                    last_error: err,
                });
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                operation = %operation,
                attempt = attempt + 1,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "⚠️ Attempt failed, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        operation: operation.to_string(),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
