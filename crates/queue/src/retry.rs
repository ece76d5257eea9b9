//! Bounded retries for transient queue failures.

use askq_core::{AppResult, BackoffPolicy};
use std::future::Future;

/// Run `op` until it succeeds, fails permanently, or the policy's attempts
/// are exhausted. Only errors classified as transient are retried.
pub async fn with_backoff<T, F, Fut>(policy: &BackoffPolicy, what: &str, mut op: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut backoff = policy.start();

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && backoff.attempts() + 1 < policy.max_attempts => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    backoff.attempts(),
                    policy.max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askq_core::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial_ms: 1,
            max_ms: 2,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_backoff(&fast_policy(5), "publish", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AppError::Queue("database is locked".to_string()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: AppResult<()> = with_backoff(&fast_policy(3), "publish", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Queue("down".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: AppResult<()> = with_backoff(&fast_policy(5), "publish", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::InvalidInput("bad".to_string()))
        })
        .await;

        assert!(matches!(result, Err(AppError::InvalidInput(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
