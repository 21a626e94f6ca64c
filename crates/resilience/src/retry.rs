//! Retry logic with exponential backoff.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::classify::Classify;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,

    /// Backoff before the second attempt
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Backoff multiplier (typically 2.0 for exponential)
    pub backoff_multiplier: f64,

    /// Upper bound for a single backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Apply ±10% jitter so parallel workers do not retry in lockstep
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(32),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with custom parameters
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        backoff_multiplier: f64,
        max_backoff: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            backoff_multiplier,
            max_backoff,
            jitter: true,
        }
    }

    /// Disable jitter, mostly useful for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Attempts actually made; a zero budget still gets one try.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff before the attempt following `attempt` (zero-based).
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff.as_millis() as f64;
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let mut backoff_ms = base_ms * multiplier;

        if self.jitter {
            backoff_ms *= 0.9 + fastrand::f64() * 0.2;
        }

        let max_ms = self.max_backoff.as_millis() as f64;
        Duration::from_millis(backoff_ms.min(max_ms) as u64)
    }
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The error was not transient, so no further attempt was made.
    #[error("{operation} failed: {error}")]
    Permanent {
        /// Name of the operation
        operation: String,
        /// The failure
        error: E,
    },

    /// Every attempt failed with a transient error.
    #[error("{operation} still failing after {attempts} attempts: {error}")]
    Exhausted {
        /// Name of the operation
        operation: String,
        /// Attempts made
        attempts: u32,
        /// The last failure
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Borrow the last underlying error.
    pub fn inner(&self) -> &E {
        match self {
            Self::Permanent { error, .. } | Self::Exhausted { error, .. } => error,
        }
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { .. } => 1,
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Only errors for which [`Classify::is_transient`] holds are retried; any
/// other error is returned immediately as [`RetryError::Permanent`].
///
/// ```rust,ignore
/// let policy = RetryPolicy::default();
/// let grants = retry_with_backoff(&policy, "list_grants", || client.list_grants()).await?;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_transient() => {
                return Err(RetryError::Permanent {
                    operation: operation.to_owned(),
                    error,
                });
            }
            Err(error) => {
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts,
                    error = %error,
                    "Retry attempt failed"
                );

                attempt += 1;
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        operation: operation.to_owned(),
                        attempts: attempt,
                        error,
                    });
                }

                let backoff = policy.backoff_duration(attempt - 1);
                tracing::debug!(
                    operation,
                    backoff_ms = backoff.as_millis() as u64,
                    "Backing off before next retry"
                );
                sleep(backoff).await;
            }
        }
    }
}
