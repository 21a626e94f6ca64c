//! Bounded waits for single external calls.

use std::future::Future;
use std::time::Duration;

/// A call did not complete within its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {after:?}")]
pub struct TimedOut {
    /// The deadline that elapsed
    pub after: Duration,
}

/// Run `future` for at most `duration`.
///
/// The caller's error type absorbs the timeout through `From<TimedOut>`, so a
/// call site reads the same with or without the bound:
///
/// ```rust,ignore
/// let keys = with_timeout(phase_timeout, client.identity_keys(&identity)).await?;
/// ```
pub async fn with_timeout<F, T, E>(duration: Duration, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<TimedOut>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(TimedOut { after: duration }.into()),
    }
}
