//! Bounded exponential backoff for transient object-store I/O, retried at
//! the adapter level with bounded exponential backoff and surfaced as an
//! error after exhaustion.

use std::future::Future;

use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};

/// Classifies a raw `object_store::Error` as worth retrying or not.
/// Precondition-failed and not-found are never retried: they are
/// meaningful, immediate answers, not flaky I/O.
pub fn is_transient(err: &object_store::Error) -> bool {
    !matches!(
        err,
        object_store::Error::NotFound { .. }
            | object_store::Error::AlreadyExists { .. }
            | object_store::Error::Precondition { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::InvalidPath { .. }
    )
}

/// Runs `action` with up to `max_attempts` tries, backing off exponentially
/// (with jitter) between attempts. Errors classified as non-transient by
/// [`is_transient`] are surfaced on the first attempt.
pub async fn with_retry<T, F, Fut>(max_attempts: usize, action: F) -> Result<T, object_store::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, object_store::Error>>,
{
    let strategy = ExponentialBackoff::from_millis(20)
        .map(jitter)
        .take(max_attempts.saturating_sub(1));

    let result = Retry::spawn(strategy, || async {
        action().await.map_err(|err| {
            if is_transient(&err) {
                RetryError::to_transient(err)
            } else {
                RetryError::to_permanent(err)
            }
        })
    })
    .await;

    result.map_err(|retry_err| retry_err.error)
}
