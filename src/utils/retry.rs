use crate::utils::error::Result;
use std::future::Future;
use std::time::Duration;

const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    pub fn none() -> Self {
        Self::new(1, 0)
    }

    /// Delay before retry number `retry` (1-based), doubling each time.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_DELAY)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label,
                        attempt,
                        self.attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 1000);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), MAX_DELAY);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(3, 1);

        let result = policy
            .run("flaky", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SyncError::transient("test", "busy"))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(5, 1);

        let result: Result<()> = policy
            .run("broken", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::store("test", "access denied"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(2, 1);

        let result: Result<()> = policy
            .run("down", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::transient("test", "unavailable"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
