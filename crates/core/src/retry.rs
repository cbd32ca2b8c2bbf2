use crate::error::RetryError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Call `f` until it succeeds.
///
/// The first attempt happens immediately. After each failure the helper waits
/// `interval` and tries again. With `max_retries == 0` it retries until
/// `cancel` fires; otherwise it gives up after `max_retries` additional
/// attempts, so an always-failing `f` is invoked `max_retries + 1` times.
pub async fn retryable<T, E, F, Fut>(
    cancel: &CancellationToken,
    interval: Duration,
    max_retries: u32,
    mut f: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut err = match f().await {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    let mut retries: u32 = 0;
    loop {
        if max_retries > 0 && retries >= max_retries {
            tracing::error!("{}", err);
            return Err(RetryError::MaxRetriesReached {
                attempts: retries + 1,
                last_error: err.to_string(),
            });
        }

        tracing::warn!(
            "{}, retrying in {:.2}s",
            err,
            interval.as_secs_f64()
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => err = e,
        }
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_first_time() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = retryable(&cancel, Duration::from_millis(10), 3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(42)
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retries_invoke_max_plus_one() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retryable(&cancel, Duration::from_millis(10), 3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("boom")
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(RetryError::MaxRetriesReached { attempts, last_error }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(RetryError::MaxRetriesReached {
            attempts: 4,
            last_error: "boom".into()
        }
        .to_string()
        .contains("max retries reached"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_success() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = retryable(&cancel, Duration::from_millis(10), 5, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("not yet")
            } else {
                Ok(n)
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retries_stop_on_cancel() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(55)).await;
            deadline.cancel();
        });

        let counter = calls.clone();
        let result: Result<(), _> = retryable(&cancel, Duration::from_millis(10), 0, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("still failing")
            }
        })
        .await;

        assert_eq!(result, Err(RetryError::Cancelled));
        assert!(calls.load(Ordering::SeqCst) > 1);
    }
}
