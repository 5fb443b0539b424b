use crate::config::RetryConfig;
use crate::error::{CaptureError, CaptureResult};
use log::warn;
use std::future::Future;
use std::time::Duration;

/// The error that ended a retry loop and the number of attempts made.
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: CaptureError,
}

/// Runs `op` until it succeeds, retrying transient errors with exponential
/// backoff up to `config.max_attempts` attempts.
pub async fn retry<T, F, Fut>(config: &RetryConfig, what: &str, op: F) -> CaptureResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CaptureResult<T>>,
{
    retry_if(config, what, CaptureError::is_transient, op)
        .await
        .map_err(|failure| failure.error)
}

/// Like [`retry`] with a caller-chosen predicate deciding which errors are
/// worth another attempt.
pub async fn retry_if<T, F, Fut, P>(
    config: &RetryConfig,
    what: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CaptureResult<T>>,
    P: Fn(&CaptureError) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(RetryFailure {
                        attempts: attempt,
                        error,
                    });
                }
                let delay = config.backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what, attempt, max_attempts, delay, error
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Bounds `future` by `duration`; expiry surfaces as a transient timeout.
pub async fn with_timeout<T, Fut>(duration: Duration, what: &str, future: Fut) -> CaptureResult<T>
where
    Fut: Future<Output = CaptureResult<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(CaptureError::Timeout(format!("{} after {:?}", what, duration))),
    }
}
