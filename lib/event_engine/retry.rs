use std::future::Future;

use super::types::RetryPolicy;

/// Terminal state returned once the retry runner gives up.
#[derive(Debug)]
pub struct RetryTerminal<E> {
    pub error: E,
    pub attempts: u32,
    /// `true` when every attempt failed with a retryable error.
    pub exhausted_retryable: bool,
}

/// Executes one async operation under `retry_policy`.
///
/// `is_retryable` classifies each error; a non-retryable error ends the run immediately.
/// The operation receives the 1-based attempt number. On success the attempt count is
/// returned alongside the value.
pub async fn run_with_retry<T, E, F, Fut, R>(
    retry_policy: &RetryPolicy,
    mut op: F,
    mut is_retryable: R,
) -> Result<(T, u32), RetryTerminal<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
{
    let max_attempts = retry_policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(error) => {
                let retryable = is_retryable(&error);
                if retryable && attempt < max_attempts {
                    let delay = retry_policy.delay.after_attempt(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                    continue;
                }
                return Err(RetryTerminal {
                    error,
                    attempts: attempt,
                    exhausted_retryable: retryable,
                });
            }
        }
    }
}

/// Retries every error until `max_attempts` is reached and returns the last one.
pub async fn retry_all<T, E, F, Fut>(retry_policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    run_with_retry(retry_policy, |_| op(), |_| true)
        .await
        .map(|(value, _)| value)
        .map_err(|terminal| terminal.error)
}

#[cfg(test)]
mod tests {
    use super::{retry_all, run_with_retry};
    use crate::event_engine::types::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn always_failing_op_is_called_max_attempts_times() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));

        let err = retry_all(&policy, || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err::<(), _>(format!("failure #{call}")) }
        })
        .await
        .expect_err("every attempt fails");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err, "failure #3");
    }

    #[tokio::test]
    async fn second_attempt_success_stops_retrying() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));

        let value = retry_all(&policy, || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call == 1 {
                    Err("transient".to_string())
                } else {
                    Ok(call * 10)
                }
            }
        })
        .await
        .expect("second attempt succeeds");

        assert_eq!(value, 20);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_is_not_retried() {
        let policy = RetryPolicy::fixed(5, Duration::ZERO);
        let terminal = run_with_retry(
            &policy,
            |_| async { Err::<(), _>("validation failed") },
            |_| false,
        )
        .await
        .expect_err("permanent failure");

        assert_eq!(terminal.attempts, 1);
        assert!(!terminal.exhausted_retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn linear_policy_waits_attempt_times_step() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(1500));
        let started = tokio::time::Instant::now();

        let terminal = run_with_retry(&policy, |_| async { Err::<(), _>("down") }, |_| true)
            .await
            .expect_err("every attempt fails");

        assert_eq!(terminal.attempts, 3);
        assert!(terminal.exhausted_retryable);
        assert_eq!(started.elapsed(), Duration::from_millis(1500 + 3000));
    }

    #[tokio::test]
    async fn zero_max_attempts_still_tries_once() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        let (value, attempts) = run_with_retry(&policy, |_| async { Ok::<_, ()>(7) }, |_| true)
            .await
            .expect("succeeds");
        assert_eq!((value, attempts), (7, 1));
    }
}
