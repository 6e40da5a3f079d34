//! Retry and polling helpers.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{self, Error, Result};

/// Retry configuration for operations.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Policy with a fixed number of attempts and short delays.
    #[must_use]
    pub fn quick(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }

    /// Calculate the delay for a given attempt number.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.min(10)).unwrap_or(10);
        let multiplier = self.backoff_multiplier.powi(exp);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry given the current attempt count.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Run `op` until it succeeds, retrying transient failures with backoff.
///
/// # Errors
///
/// Returns the last error once it is not transient or attempts run out.
pub async fn retry_async<T, F, Fut>(policy: &RetryConfig, what: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if !error::is_transient(&e) || !policy.should_retry(attempt) {
                    return Err(e);
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    what,
                    attempt,
                    error = %e,
                    delay_secs = delay.as_secs(),
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Call a synchronous probe every `interval` until it yields a value.
///
/// # Errors
///
/// Returns [`Error::Timeout`] when `timeout` elapses first.
pub async fn poll_until<T, F>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Option<T>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = probe() {
            return Ok(value);
        }
        if start.elapsed() >= timeout {
            return Err(timed_out(what, timeout));
        }
        debug!(what, elapsed_secs = start.elapsed().as_secs(), "Still waiting");
        tokio::time::sleep(next_wait(start, timeout, interval)).await;
    }
}

/// Async variant of [`poll_until`].
///
/// # Errors
///
/// Returns [`Error::Timeout`] when `timeout` elapses first.
pub async fn poll_until_async<T, F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = probe().await {
            return Ok(value);
        }
        if start.elapsed() >= timeout {
            return Err(timed_out(what, timeout));
        }
        debug!(what, elapsed_secs = start.elapsed().as_secs(), "Still waiting");
        tokio::time::sleep(next_wait(start, timeout, interval)).await;
    }
}

/// The poll interval, cut short so the last wait ends at the deadline.
fn next_wait(start: Instant, timeout: Duration, interval: Duration) -> Duration {
    interval.min(timeout.saturating_sub(start.elapsed()))
}

fn timed_out(what: &str, timeout: Duration) -> Error {
    Error::Timeout {
        what: what.to_string(),
        secs: timeout.as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_retry_config() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(20));

        // Should cap at max_delay
        assert_eq!(config.delay_for_attempt(100), config.max_delay);
    }

    #[test]
    fn test_should_retry() {
        let config = RetryConfig::default();
        assert!(config.should_retry(0));
        assert!(config.should_retry(4));
        assert!(!config.should_retry(5));
    }

    fn instant_policy(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        }
    }

    #[tokio::test]
    async fn test_retry_async_recovers_from_transient() {
        let calls = &AtomicU32::new(0);
        let result = retry_async(&instant_policy(5), "flaky", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("connection refused")
            }
            Ok(42)
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_async_stops_on_hard_error() {
        let calls = &AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_async(&instant_policy(5), "broken", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("chart not found")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_async_gives_up() {
        let calls = &AtomicU32::new(0);
        let result: anyhow::Result<()> = retry_async(&instant_policy(3), "down", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("503 Service Unavailable")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_returns_value() {
        let mut remaining = 3;
        let value = poll_until("countdown", Duration::from_secs(5), Duration::from_millis(1), || {
            remaining -= 1;
            (remaining == 0).then_some("done")
        })
        .await
        .unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let err = poll_until::<(), _>(
            "never",
            Duration::from_millis(20),
            Duration::from_millis(5),
            || None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.to_string().contains("never"));
    }

    #[tokio::test]
    async fn test_poll_until_stops_at_deadline_not_interval() {
        let started = Instant::now();
        let err = poll_until::<(), _>(
            "slow",
            Duration::from_millis(50),
            Duration::from_secs(30),
            || None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_poll_until_async_stops_at_deadline_not_interval() {
        let started = Instant::now();
        let err = poll_until_async::<(), _, _>(
            "slow",
            Duration::from_millis(50),
            Duration::from_secs(30),
            || async { None },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
