#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Bastion Resilience
//!
//! Retry and timeout primitives shared by the grant reconciler and the
//! rotation controller.
//!
//! - [`RetryPolicy`]: bounded attempts with exponential backoff and jitter
//! - [`retry_with_backoff`]: drives an async operation under a policy,
//!   retrying only errors that [`Classify::is_transient`]
//! - [`with_timeout`]: bounds a single call so no phase blocks forever

pub mod classify;
pub mod retry;
pub mod timeout;

pub use classify::Classify;
pub use retry::{RetryError, RetryPolicy, retry_with_backoff};
pub use timeout::{TimedOut, with_timeout};
