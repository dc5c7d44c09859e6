use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Back-off policy for one external call site: `max_tries` attempts, the
/// delay between them starting at `base_delay` and multiplying up to `cap`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_tries: u32, base_delay: Duration) -> Self {
        Self {
            max_tries,
            base_delay,
            multiplier: 2,
            cap: Duration::from_secs(60),
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

pub async fn with_backoff<T, E, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = policy.base_delay;
    let tries = policy.max_tries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= tries => {
                tracing::warn!(error = %err, what, attempt, "giving up after final attempt");
                return Err(err);
            }
            Err(err) => {
                tracing::warn!(error = %err, what, attempt, delay_ms = delay.as_millis() as u64, "attempt failed, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * policy.multiplier).min(policy.cap);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_tries: u32) -> RetryPolicy {
        RetryPolicy {
            max_tries,
            base_delay: Duration::from_millis(1),
            multiplier: 2,
            cap: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_backoff(quick(3), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_backoff(quick(5), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_backoff(quick(3), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {n}")) }
        })
        .await;
        assert_eq!(result.unwrap_err(), "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_retry_policy_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_backoff(RetryPolicy::no_retry(), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("boom".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
