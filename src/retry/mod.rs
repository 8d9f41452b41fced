//! Linear backoff retry for fallible async operations.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How many times to retry and how long to wait between attempts.
///
/// The first attempt runs immediately. After the n-th failure the wait is
/// `initial_delay + (n - 1) * delay_increment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default = "default_delay_increment", with = "humantime_serde")]
    pub delay_increment: Duration,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_delay_increment() -> Duration {
    Duration::from_secs(2)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            delay_increment: default_delay_increment(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    /// Every attempt failed. `source` is the last failure.
    #[error("giving up after {retries} retries")]
    Exhausted {
        retries: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

/// Runs `op` until it succeeds, the policy is exhausted, or `cancel` fires.
///
/// Returns `Ok(None)` when cancelled during a backoff wait.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    policy: RetryPolicy,
    mut op: F,
) -> Result<Option<T>, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt: u32 = 0;

    loop {
        let err = match op().await {
            Ok(v) => return Ok(Some(v)),
            Err(e) => e,
        };

        if attempt >= policy.max_attempts {
            return Err(RetryError::Exhausted {
                retries: policy.max_attempts,
                source: err.into(),
            });
        }
        attempt += 1;

        debug!(
            attempt,
            delay = ?delay,
            error = %format!("{err:#}"),
            "attempt failed, backing off"
        );

        tokio::select! {
            biased;

            () = cancel.cancelled() => return Ok(None),
            () = tokio::time::sleep(delay) => {}
        }

        delay += policy.delay_increment;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            delay_increment: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_counts_attempts_and_keeps_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let c = calls.clone();
        let result: Result<Option<()>, _> = retry(&cancel, policy(3), || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(anyhow::anyhow!("attempt {n} failed")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 1s + 3s + 5s of backoff.
        assert_eq!(started.elapsed(), Duration::from_secs(9));

        let err = result.expect_err("should exhaust");
        let RetryError::Exhausted { retries, ref source } = err;
        assert_eq!(retries, 3);
        assert_eq!(source.to_string(), "attempt 4 failed");
        assert_eq!(err.to_string(), "giving up after 3 retries");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let c = calls.clone();
        let started = Instant::now();
        let result: Result<Option<()>, _> = retry(&cancel, policy(3), || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("down")) }
        })
        .await;

        assert!(matches!(result, Ok(None)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let c = calls.clone();
        let result = retry(&cancel, policy(3), || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    anyhow::bail!("not yet");
                }
                Ok(n)
            }
        })
        .await
        .expect("should succeed");

        assert_eq!(result, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<Option<()>, _> = retry(&cancel, policy(0), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("nope")) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { retries: 0, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policy_from_yaml() {
        let p: RetryPolicy =
            serde_yaml::from_str("max_attempts: 5\ninitial_delay: 200ms\n").expect("parse");
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.initial_delay, Duration::from_millis(200));
        assert_eq!(p.delay_increment, Duration::from_secs(2));
    }
}
