//! Rotation Policy
//!
//! How often keys rotate and how patient each rotation is.

use std::time::Duration;

use bastion_resilience::RetryPolicy;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::error::{RotationError, RotationResult};
use crate::keygen::{DEFAULT_PBKDF2_ITERATIONS, MIN_KEY_BITS};

/// Rotation policy of an identity
///
/// # Example
///
/// ```yaml
/// interval_days: 90
/// key_bits: 4096
/// max_test_attempts: 3
/// lease_ttl: 10m
/// phase_timeout: 30s
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    /// Days a key stays CURRENT before it is due for rotation
    pub interval_days: u32,

    /// RSA modulus size for new keys
    pub key_bits: usize,

    /// PBKDF2 rounds protecting stored private keys
    pub pbkdf2_iterations: u32,

    /// Failed testSecret attempts before the rotation rolls back
    pub max_test_attempts: u32,

    /// Lease duration; renewed before every phase
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,

    /// Deadline for every platform and store call
    #[serde(with = "humantime_serde")]
    pub phase_timeout: Duration,

    /// Retries for transient platform and store failures; its backoff also
    /// spaces out testSecret attempts
    pub retry: RetryPolicy,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            interval_days: 90,
            key_bits: MIN_KEY_BITS,
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            max_test_attempts: 3,
            lease_ttl: Duration::from_secs(10 * 60),
            phase_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl RotationPolicy {
    /// Validate the policy
    ///
    /// # Errors
    ///
    /// * `InvalidPolicy` if the key is too small, no test attempt is allowed,
    ///   or the lease would expire before a single call times out
    pub fn validate(&self) -> RotationResult<()> {
        if self.interval_days == 0 {
            return Err(RotationError::InvalidPolicy {
                reason: "Rotation interval must be at least 1 day".into(),
            });
        }

        if self.key_bits < MIN_KEY_BITS {
            return Err(RotationError::InvalidPolicy {
                reason: format!(
                    "Key size must be at least {MIN_KEY_BITS} bits, got {}",
                    self.key_bits
                ),
            });
        }

        if self.max_test_attempts == 0 {
            return Err(RotationError::InvalidPolicy {
                reason: "At least one test attempt is required".into(),
            });
        }

        if self.lease_ttl <= self.phase_timeout {
            return Err(RotationError::InvalidPolicy {
                reason: format!(
                    "Lease TTL ({:?}) must exceed the phase timeout ({:?})",
                    self.lease_ttl, self.phase_timeout
                ),
            });
        }

        Ok(())
    }

    /// Whether a key created at `created_at` is due for rotation at `now`.
    pub fn is_due(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - created_at >= TimeDelta::days(i64::from(self.interval_days))
    }
}
