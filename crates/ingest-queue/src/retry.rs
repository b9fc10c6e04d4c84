use crate::error::QueueError;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff parameters for a class of queue operation. The
/// mutex busy-wait has its own 1s-to-10s doubling schedule baked into
/// [`crate::queue::ContributionQueue::acquire_mutex`]; this policy governs
/// the automatic retry wrapped around every other queue operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Default ceiling for ordinary queue reads/writes: generous, but not
    /// unbounded, so a truly wedged database still surfaces an error.
    pub const fn default_queue() -> Self {
        Self {
            max_attempts: 10,
            base: Duration::from_millis(200),
            cap: Duration::from_secs(10),
        }
    }

    /// `unlock_contribfiles` must restore the queue to a state consistent
    /// with what the server actually did, even if the database is flapping
    /// -- so it gets a much higher attempt ceiling.
    pub const fn reconciliation() -> Self {
        Self {
            max_attempts: 100,
            base: Duration::from_millis(200),
            cap: Duration::from_secs(10),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scale = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(scale).min(self.cap)
    }
}

/// Runs `op` under `policy`, retrying on [`QueueError::is_transient`] with
/// exponential backoff capped at `policy.cap`, until `policy.max_attempts`
/// is exhausted.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "retrying queue operation after transient error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> QueueError {
        QueueError::Database(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(10),
            cap: Duration::from_millis(100),
        };

        let result: Result<i32, QueueError> = with_retry(policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(10),
            cap: Duration::from_millis(50),
        };

        let result: Result<i32, QueueError> = with_retry(policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err::<i32, _>(transient()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default_queue();

        let result: Result<i32, QueueError> = with_retry(policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err::<i32, _>(QueueError::Invariant("nope".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
