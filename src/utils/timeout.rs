//! Timeout wrappers for async operations
//!
//! Two distinct contracts live here. [`with_timeout`] bounds a single
//! future and reports elapsed time as an error; it is used for the user
//! handler, which must never be retried on timeout. [`timeout_and_retry`]
//! re-runs an operation whose timeout is considered transient, up to a
//! bounded number of attempts; it wraps internal source operations such
//! as fetching the next request or marking one handled. Non-timeout
//! errors always propagate immediately from both.

use std::future::Future;
use std::time::Duration;

use log::debug;

/// Marker error produced when a wrapped operation exceeds its time
/// budget (including all retries, for the retrying wrapper).
///
/// Callers that need to distinguish a timeout from an ordinary failure
/// can `downcast_ref::<OperationTimedOut>()` on the `anyhow` chain.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{operation} timed out after {timeout:?}")]
pub struct OperationTimedOut {
    /// Human-readable name of the operation, used in error messages.
    pub operation: String,
    /// The per-attempt time budget that elapsed.
    pub timeout: Duration,
}

/// Run `fut` with a time limit of `timeout`.
///
/// Returns the future's own result on completion, or an
/// [`OperationTimedOut`] error if the clock runs out first. The future
/// is dropped on timeout, which cancels it at its next suspension
/// point.
pub async fn with_timeout<T, F>(operation: &str, timeout: Duration, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(OperationTimedOut {
            operation: operation.to_string(),
            timeout,
        }
        .into()),
    }
}

/// Run `op` with a time limit of `timeout`, retrying on timeout up to
/// `max_retries` additional attempts.
///
/// Only timeouts are retried. An error returned by the operation itself
/// propagates immediately, so a failing backing store surfaces after a
/// single attempt rather than after the full retry budget.
pub async fn timeout_and_retry<T, Op, Fut>(
    operation: &str,
    timeout: Duration,
    max_retries: u32,
    op: Op,
) -> anyhow::Result<T>
where
    Op: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match tokio::time::timeout(timeout, op()).await {
            Ok(result) => return result,
            Err(_) if attempt < max_retries => {
                attempt += 1;
                debug!(
                    "{operation} timed out after {timeout:?}, retrying ({attempt}/{max_retries})"
                );
            }
            Err(_) => {
                return Err(OperationTimedOut {
                    operation: operation.to_string(),
                    timeout,
                }
                .into());
            }
        }
    }
}
