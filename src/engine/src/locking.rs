//! Timed lock acquisition and bounded retry for concurrency conflicts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::error::{EngineError, EngineResult};

/// Backoff step between retries; attempt `n` waits `n * RETRY_BACKOFF_MS`.
const RETRY_BACKOFF_MS: u64 = 10;

/// Lock `mutex`, reporting a `ConcurrencyConflict` if it stays contended past `wait`.
pub(crate) async fn lock_timed<'a, T>(
    mutex: &'a Mutex<T>,
    wait: Duration,
    what: &str,
) -> EngineResult<MutexGuard<'a, T>> {
    timeout(wait, mutex.lock())
        .await
        .map_err(|_| EngineError::ConcurrencyConflict(format!("timed out locking {}", what)))
}

/// Owned variant of [`lock_timed`], for guards that outlive the borrow of the handle.
pub(crate) async fn lock_owned_timed<T>(
    mutex: &Arc<Mutex<T>>,
    wait: Duration,
    what: &str,
) -> EngineResult<OwnedMutexGuard<T>> {
    timeout(wait, mutex.clone().lock_owned())
        .await
        .map_err(|_| EngineError::ConcurrencyConflict(format!("timed out locking {}", what)))
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// `max_retries` retries have been spent.
pub(crate) async fn with_retry<T, F, Fut>(
    max_retries: u32,
    operation: &str,
    mut attempt: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Err(e) if e.is_retryable() && retries < max_retries => {
                retries += 1;
                warn!(
                    "[RETRY] {} hit conflict ({}), retry {}/{}",
                    operation, e, retries, max_retries
                );
                sleep(Duration::from_millis(RETRY_BACKOFF_MS * retries as u64)).await;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_lock_timed_succeeds_when_free() {
        let mutex = Mutex::new(5);
        let guard = lock_timed(&mutex, Duration::from_millis(50), "value").await.unwrap();
        assert_eq!(*guard, 5);
    }

    #[tokio::test]
    async fn test_lock_timed_reports_conflict_when_held() {
        let mutex = Mutex::new(5);
        let _held = mutex.lock().await;

        let result = lock_timed(&mutex, Duration::from_millis(20), "value").await;

        assert!(matches!(result, Err(EngineError::ConcurrencyConflict(_))));
    }

    #[tokio::test]
    async fn test_owned_lock_times_out_then_succeeds_once_released() {
        let mutex = Arc::new(Mutex::new(5));
        let held = mutex.clone().lock_owned().await;

        let result = lock_owned_timed(&mutex, Duration::from_millis(20), "value").await;
        assert!(matches!(result, Err(EngineError::ConcurrencyConflict(_))));

        drop(held);
        let guard = lock_owned_timed(&mutex, Duration::from_millis(20), "value").await.unwrap();
        assert_eq!(*guard, 5);
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_conflict() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(3, "test", move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(EngineError::ConcurrencyConflict("busy".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_surfaces_conflict_after_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: EngineResult<()> = with_retry(3, "test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::ConcurrencyConflict("busy".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(EngineError::ConcurrencyConflict(_))));
        // One initial attempt plus three retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_validation_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: EngineResult<()> = with_retry(3, "test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Validation("bad amount".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
